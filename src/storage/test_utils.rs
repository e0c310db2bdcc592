//! Test utilities for storage initialization
//!
//! Builds stores pre-seeded with the documents a session manager expects,
//! so tests can start from a known model and entity set.

use crate::error::Result;
use crate::storage::{DocumentStore, InMemoryDocumentStore, LibsqlDocumentStore};
use crate::types::Entity;
use std::path::Path;
use std::sync::Arc;

/// Create an empty in-memory document store
pub fn create_test_store() -> Arc<InMemoryDocumentStore> {
    Arc::new(InMemoryDocumentStore::new())
}

/// Create a libSQL store on a file inside `dir`
///
/// A file is used rather than `:memory:` so that a test can reopen the same
/// database and observe what was persisted.
pub async fn create_test_libsql_store(dir: &Path) -> Result<Arc<LibsqlDocumentStore>> {
    let path = dir.join("mantis_test.db");
    let store = LibsqlDocumentStore::open_local(&path.to_string_lossy()).await?;
    Ok(Arc::new(store))
}

/// Write entities into the entity collection
pub async fn seed_entities(
    store: &dyn DocumentStore,
    collection: &str,
    entities: &[Entity],
) -> Result<()> {
    for entity in entities {
        store
            .insert(collection, &entity.id.to_string(), serde_json::to_value(entity)?)
            .await?;
    }
    Ok(())
}
