//! Storage layer for Mantis
//!
//! Records live as JSON documents grouped in named collections. The session
//! manager relies on field-scoped operations (`data.<user>`, `mu`, `z`, ...)
//! being atomic per call so that writes to unrelated fields of the same
//! document never clobber each other.

pub mod document;
pub mod libsql;
pub mod memory;
pub mod test_utils;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

pub use document::FieldPath;
pub use self::libsql::LibsqlDocumentStore;
pub use memory::InMemoryDocumentStore;

/// Equality filter on top-level document fields
pub type Filter<'a> = [(&'a str, Value)];

/// Document store trait defining all required operations
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document; fails with `AlreadyExists` if the id is taken
    async fn insert(&self, collection: &str, id: &str, document: Value) -> Result<()>;

    /// Load a whole document by id
    async fn load_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Load only the given fields of a document (missing fields are omitted)
    async fn load_one_in_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &[FieldPath],
    ) -> Result<Option<Value>>;

    /// Load the given fields of the first document matching `filter`
    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter<'_>,
        fields: &[FieldPath],
    ) -> Result<Option<Value>>;

    /// Set fields in one atomic write; false when the document is absent
    async fn update_one_in_fields(
        &self,
        collection: &str,
        id: &str,
        fields: &[(FieldPath, Value)],
    ) -> Result<bool>;

    /// Append a value to an array field, creating the array if needed
    async fn push_one_in_fields(
        &self,
        collection: &str,
        id: &str,
        field: &FieldPath,
        value: Value,
    ) -> Result<bool>;

    /// Delete a field; false when the document or the field is absent
    async fn remove_field(&self, collection: &str, id: &str, field: &FieldPath) -> Result<bool>;

    /// Whether the field is present on the document
    async fn exists_field(&self, collection: &str, id: &str, field: &FieldPath) -> Result<bool>;

    /// Load every document whose id is listed; absent ids are skipped
    async fn load_all_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Value>>;
}
