//! LibSQL document store
//!
//! Persists documents as JSON text in a single `documents` table keyed by
//! `(collection, id)`. Field-level writes are a read-modify-write inside one
//! transaction, serialized by a writer lock, so a write to `data.<user>`
//! never races a write to `mu` on the same record.

use super::document::{self, FieldPath};
use super::{DocumentStore, Filter};
use crate::error::{MantisError, Result};
use async_trait::async_trait;
use libsql::{params, Builder, Connection, Database};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);
"#;

/// Document store backed by a libSQL database
pub struct LibsqlDocumentStore {
    // kept alive for the lifetime of the connection
    _db: Database,
    conn: Connection,
    writer: Mutex<()>,
}

impl LibsqlDocumentStore {
    /// Open (or create) a local database file
    pub async fn open_local(path: &str) -> Result<Self> {
        info!("Opening libSQL document store at {}", path);

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    MantisError::Database(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| MantisError::Database(format!("Failed to create local database: {}", e)))?;
        Self::from_database(db).await
    }

    /// Open a private in-memory database
    ///
    /// The store keeps a single connection, so all operations see the same
    /// in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                MantisError::Database(format!("Failed to create in-memory database: {}", e))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self> {
        let conn = db
            .connect()
            .map_err(|e| MantisError::Database(format!("Failed to get connection: {}", e)))?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| MantisError::Database(format!("Failed to create schema: {}", e)))?;
        debug!("Document schema ready");

        Ok(Self {
            _db: db,
            conn,
            writer: Mutex::new(()),
        })
    }

    async fn read_body(conn: &Connection, collection: &str, id: &str) -> Result<Option<Value>> {
        let mut rows = conn
            .query(
                "SELECT body FROM documents WHERE collection = ? AND id = ?",
                params![collection, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let body: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    /// Apply `edit` to one document inside a transaction.
    ///
    /// Returns false without writing when the document does not exist.
    async fn modify<F>(&self, collection: &str, id: &str, edit: F) -> Result<bool>
    where
        F: FnOnce(&mut Value) -> Result<bool> + Send,
    {
        let _guard = self.writer.lock().await;
        let tx = self.conn.transaction().await.map_err(|e| {
            MantisError::StoreWrite(format!("{}/{}: failed to begin transaction: {}", collection, id, e))
        })?;

        let Some(mut body) = Self::read_body(&tx, collection, id).await? else {
            tx.rollback().await?;
            return Ok(false);
        };

        if !edit(&mut body)? {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.execute(
            "UPDATE documents SET body = ? WHERE collection = ? AND id = ?",
            params![serde_json::to_string(&body)?, collection, id],
        )
        .await
        .map_err(|e| MantisError::StoreWrite(format!("{}/{}: {}", collection, id, e)))?;

        tx.commit()
            .await
            .map_err(|e| MantisError::StoreWrite(format!("{}/{}: commit failed: {}", collection, id, e)))?;
        Ok(true)
    }
}

#[async_trait]
impl DocumentStore for LibsqlDocumentStore {
    async fn insert(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        let _guard = self.writer.lock().await;
        if Self::read_body(&self.conn, collection, id).await?.is_some() {
            return Err(MantisError::AlreadyExists(format!("{}/{}", collection, id)));
        }

        debug!("Inserting document {}/{}", collection, id);
        self.conn
            .execute(
                "INSERT INTO documents (collection, id, body) VALUES (?, ?, ?)",
                params![collection, id, serde_json::to_string(&document)?],
            )
            .await
            .map_err(|e| MantisError::StoreWrite(format!("{}/{}: {}", collection, id, e)))?;
        Ok(())
    }

    async fn load_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        Self::read_body(&self.conn, collection, id).await
    }

    async fn load_one_in_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &[FieldPath],
    ) -> Result<Option<Value>> {
        match Self::read_body(&self.conn, collection, id).await? {
            Some(doc) => Ok(Some(document::project(&doc, fields)?)),
            None => Ok(None),
        }
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter<'_>,
        fields: &[FieldPath],
    ) -> Result<Option<Value>> {
        let mut sql = String::from("SELECT body FROM documents WHERE collection = ?");
        let mut values = vec![libsql::Value::Text(collection.to_string())];
        for (field, expected) in filter {
            sql.push_str(" AND json_extract(body, ?) = json_extract(?, '$')");
            values.push(libsql::Value::Text(format!("$.\"{}\"", field)));
            values.push(libsql::Value::Text(serde_json::to_string(expected)?));
        }
        sql.push_str(" ORDER BY id LIMIT 1");

        let mut rows = self
            .conn
            .query(&sql, libsql::params_from_iter(values))
            .await?;

        match rows.next().await? {
            Some(row) => {
                let body: String = row.get(0)?;
                let doc: Value = serde_json::from_str(&body)?;
                Ok(Some(document::project(&doc, fields)?))
            }
            None => Ok(None),
        }
    }

    async fn update_one_in_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &[(FieldPath, Value)],
    ) -> Result<bool> {
        self.modify(collection, id, |doc| {
            for (path, value) in fields {
                document::set_path(doc, path, value.clone())?;
            }
            Ok(true)
        })
        .await
    }

    async fn push_one_in_fields(
        &self,
        collection: &str,
        id: &str,
        field: &FieldPath,
        value: Value,
    ) -> Result<bool> {
        self.modify(collection, id, |doc| {
            document::push_path(doc, field, value)?;
            Ok(true)
        })
        .await
    }

    async fn remove_field(&self, collection: &str, id: &str, field: &FieldPath) -> Result<bool> {
        self.modify(collection, id, |doc| Ok(document::remove_path(doc, field)))
            .await
    }

    async fn exists_field(&self, collection: &str, id: &str, field: &FieldPath) -> Result<bool> {
        Ok(Self::read_body(&self.conn, collection, id)
            .await?
            .map(|doc| document::get_path(&doc, field).is_some())
            .unwrap_or(false))
    }

    async fn load_all_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT body FROM documents WHERE collection = ? AND id IN ({})",
            placeholders
        );
        let mut values = vec![libsql::Value::Text(collection.to_string())];
        values.extend(ids.iter().map(|id| libsql::Value::Text(id.clone())));

        let mut rows = self
            .conn
            .query(&sql, libsql::params_from_iter(values))
            .await?;

        let mut docs = Vec::new();
        while let Some(row) = rows.next().await? {
            let body: String = row.get(0)?;
            docs.push(serde_json::from_str(&body)?);
        }
        Ok(docs)
    }
}
