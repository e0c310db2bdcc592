//! Common test utilities and helpers

#![allow(dead_code)]

use mantis_core::storage::test_utils::{create_test_store, seed_entities};
use mantis_core::{Context, Entity, InMemoryDocumentStore, MantisConfig, SessionManager, SparseVector};
use std::sync::Arc;

/// Configuration with a bounded working set and small solvers
pub fn test_config(max_live_users: usize, max_num_instances: usize) -> MantisConfig {
    let mut config = MantisConfig::default();
    config.sessions.max_live_users = max_live_users;
    config.defaults.max_num_instances = max_num_instances;
    config
}

/// Context over a fresh in-memory store
pub fn create_test_context(config: MantisConfig) -> (Context, Arc<InMemoryDocumentStore>) {
    let store = create_test_store();
    (Context::new(store.clone(), config), store)
}

/// Manager for model "spam" created by `creator`
pub async fn create_test_manager(ctx: &Context, creator: &str) -> Arc<SessionManager> {
    SessionManager::create(ctx.clone(), "spam", creator)
        .await
        .expect("Failed to create session manager")
}

/// Entity with the given features
pub fn entity(pairs: &[(u64, f64)]) -> Entity {
    Entity::new(pairs.to_vec().into())
}

/// Store entities so users holding them can be loaded back
pub async fn store_entities(ctx: &Context, entities: &[Entity]) {
    seed_entities(ctx.store.as_ref(), ctx.entities(), entities)
        .await
        .expect("Failed to seed entities");
}

/// Same keys and values within float round-trip error
pub fn assert_vectors_close(left: &SparseVector, right: &SparseVector) {
    let left_keys: Vec<_> = left.keys().collect();
    let right_keys: Vec<_> = right.keys().collect();
    assert_eq!(left_keys, right_keys);
    for key in left_keys {
        assert!(
            (left.get(key) - right.get(key)).abs() < 1e-12,
            "key {}: {} != {}",
            key,
            left.get(key),
            right.get(key)
        );
    }
}
