//! In-process document store
//!
//! Keeps every collection in a `tokio::sync::RwLock`. Each operation takes
//! the lock once, so field updates are atomic with respect to each other.
//! Write and read failures can be injected to exercise the error paths of
//! callers.

use super::document::{self, FieldPath};
use super::{DocumentStore, Filter};
use crate::error::{MantisError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;

type Collection = BTreeMap<String, Value>;

/// Document store backed by process memory
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Collection>>,
    fail_writes: AtomicBool,
    fail_reads: Mutex<Option<String>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StoreWrite` (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self, collection: &str, id: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MantisError::StoreWrite(format!(
                "write to {}/{} rejected",
                collection, id
            )));
        }
        Ok(())
    }

    /// Make every subsequent read of `collection` fail with `Database`
    pub fn set_fail_reads(&self, collection: Option<&str>) {
        if let Ok(mut failing) = self.fail_reads.lock() {
            *failing = collection.map(str::to_string);
        }
    }

    fn check_readable(&self, collection: &str) -> Result<()> {
        let failing = self
            .fail_reads
            .lock()
            .map(|f| f.as_deref() == Some(collection))
            .unwrap_or(false);
        if failing {
            return Err(MantisError::Database(format!("read of {} rejected", collection)));
        }
        Ok(())
    }

    /// Number of documents in a collection
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(&self, collection: &str, id: &str, document: Value) -> Result<()> {
        self.check_writable(collection, id)?;
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(MantisError::AlreadyExists(format!("{}/{}", collection, id)));
        }
        debug!("Inserting document {}/{}", collection, id);
        docs.insert(id.to_string(), document);
        Ok(())
    }

    async fn load_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.check_readable(collection)?;
        let collections = self.collections.read().await;
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn load_one_in_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &[FieldPath],
    ) -> Result<Option<Value>> {
        self.check_readable(collection)?;
        let collections = self.collections.read().await;
        match collections.get(collection).and_then(|c| c.get(id)) {
            Some(doc) => Ok(Some(document::project(doc, fields)?)),
            None => Ok(None),
        }
    }

    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter<'_>,
        fields: &[FieldPath],
    ) -> Result<Option<Value>> {
        self.check_readable(collection)?;
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(None);
        };
        match docs.values().find(|doc| document::matches(doc, filter)) {
            Some(doc) => Ok(Some(document::project(doc, fields)?)),
            None => Ok(None),
        }
    }

    async fn update_one_in_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &[(FieldPath, Value)],
    ) -> Result<bool> {
        self.check_writable(collection, id)?;
        let mut collections = self.collections.write().await;
        let Some(doc) = collections.get_mut(collection).and_then(|c| c.get_mut(id)) else {
            return Ok(false);
        };

        // apply to a copy so a bad path leaves the document untouched
        let mut updated = doc.clone();
        for (path, value) in fields {
            document::set_path(&mut updated, path, value.clone())?;
        }
        *doc = updated;
        Ok(true)
    }

    async fn push_one_in_fields(
        &self,
        collection: &str,
        id: &str,
        field: &FieldPath,
        value: Value,
    ) -> Result<bool> {
        self.check_writable(collection, id)?;
        let mut collections = self.collections.write().await;
        let Some(doc) = collections.get_mut(collection).and_then(|c| c.get_mut(id)) else {
            return Ok(false);
        };
        let mut updated = doc.clone();
        document::push_path(&mut updated, field, value)?;
        *doc = updated;
        Ok(true)
    }

    async fn remove_field(&self, collection: &str, id: &str, field: &FieldPath) -> Result<bool> {
        self.check_writable(collection, id)?;
        let mut collections = self.collections.write().await;
        Ok(collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .map(|doc| document::remove_path(doc, field))
            .unwrap_or(false))
    }

    async fn exists_field(&self, collection: &str, id: &str, field: &FieldPath) -> Result<bool> {
        self.check_readable(collection)?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|doc| document::get_path(doc, field).is_some())
            .unwrap_or(false))
    }

    async fn load_all_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Value>> {
        self.check_readable(collection)?;
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| docs.get(id).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_field_operations() {
        let store = InMemoryDocumentStore::new();
        store
            .insert("mantis", "m1", json!({"id": "m1", "data": {}}))
            .await
            .unwrap();

        let field = FieldPath::new("data").child("u1");
        assert!(!store.exists_field("mantis", "m1", &field).await.unwrap());

        assert!(store
            .update_one_in_fields("mantis", "m1", &[(field.clone(), json!({}))])
            .await
            .unwrap());
        assert!(store.exists_field("mantis", "m1", &field).await.unwrap());

        assert!(store.remove_field("mantis", "m1", &field).await.unwrap());
        assert!(!store.remove_field("mantis", "m1", &field).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let store = InMemoryDocumentStore::new();
        let updated = store
            .update_one_in_fields("mantis", "nope", &[(FieldPath::new("mu"), json!([]))])
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_duplicate_insert() {
        let store = InMemoryDocumentStore::new();
        store.insert("models", "a", json!({})).await.unwrap();
        assert!(matches!(
            store.insert("models", "a", json!({})).await,
            Err(MantisError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = InMemoryDocumentStore::new();
        store.insert("models", "a", json!({"z": []})).await.unwrap();
        store.set_fail_writes(true);

        let result = store
            .update_one_in_fields("models", "a", &[(FieldPath::new("z"), json!([[1, 1.0]]))])
            .await;
        assert!(matches!(result, Err(MantisError::StoreWrite(_))));

        // reads still work and see the old value
        let doc = store.load_by_id("models", "a").await.unwrap().unwrap();
        assert_eq!(doc["z"], json!([]));
    }

    #[tokio::test]
    async fn test_injected_read_failure() {
        let store = InMemoryDocumentStore::new();
        store.insert("entities", "e1", json!({"id": "e1"})).await.unwrap();
        store.insert("models", "a", json!({"id": "a"})).await.unwrap();
        store.set_fail_reads(Some("entities"));

        let result = store.load_all_by_ids("entities", &["e1".to_string()]).await;
        assert!(matches!(result, Err(MantisError::Database(_))));
        // other collections are unaffected
        assert!(store.load_by_id("models", "a").await.unwrap().is_some());

        store.set_fail_reads(None);
        assert_eq!(store.load_all_by_ids("entities", &["e1".to_string()]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_one_and_load_all() {
        let store = InMemoryDocumentStore::new();
        store
            .insert("models", "a", json!({"id": "a", "name": "spam", "creator": "alice", "z": [[1, 2.0]]}))
            .await
            .unwrap();
        store
            .insert("models", "b", json!({"id": "b", "name": "spam", "creator": "bob", "z": []}))
            .await
            .unwrap();

        let found = store
            .find_one(
                "models",
                &[("name", json!("spam")), ("creator", json!("alice"))],
                &[FieldPath::new("z")],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, json!({"id": "a", "z": [[1, 2.0]]}));

        let docs = store
            .load_all_by_ids("models", &["b".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(store.count("models").await, 2);
    }
}
