//! Consensus round integration tests
//!
//! Several creators training copies of the same model name and merging into
//! one consensus vector.

mod common;

use common::{assert_vectors_close, create_test_context, create_test_manager, entity, test_config};
use mantis_core::registry::Record;
use mantis_core::{Context, MantisRecord, Model, SessionManager};

fn consensus_json(doc: &serde_json::Value) -> String {
    serde_json::to_string(&(&doc["mu"], &doc["q"], &doc["dq"])).unwrap()
}

async fn stored_consensus(ctx: &Context, manager: &SessionManager) -> String {
    let doc = ctx
        .store
        .load_by_id(ctx.mantis(), &manager.id().to_string())
        .await
        .unwrap()
        .unwrap();
    consensus_json(&doc)
}

#[tokio::test]
async fn test_commit_twice_is_identical() {
    let (ctx, _store) = create_test_context(test_config(8, 100));
    let manager = create_test_manager(&ctx, "alice").await;
    manager.add_one("alice").await.unwrap();
    manager
        .add_data("alice", &entity(&[(1, 1.0), (2, -1.0)]), 1.0, 1.0)
        .await
        .unwrap();
    manager.train("alice", None).await.unwrap();

    manager.commit().await.unwrap();
    let first = stored_consensus(&ctx, &manager).await;
    manager.commit().await.unwrap();
    let second = stored_consensus(&ctx, &manager).await;

    assert_eq!(first, second);
    let in_memory = manager.record().await.to_tagged_document();
    assert_eq!(first, consensus_json(&in_memory));
}

#[tokio::test]
async fn test_zero_rho_is_guarded_on_restore() {
    let mut config = test_config(8, 100);
    config.defaults.rho = 0.0;
    let (ctx, _store) = create_test_context(config);

    let manager = create_test_manager(&ctx, "alice").await;
    assert_eq!(manager.params().rho, 1.0);

    // merge divides by 1/rho, so it must stay finite
    manager.merge("alice", 0).await.unwrap();
    assert!(manager.model_snapshot().await.z.is_finite());

    let doc = ctx
        .store
        .load_by_id(ctx.mantis(), &manager.id().to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(MantisRecord::from_document(&doc).unwrap().params.rho, 1.0);
}

#[tokio::test]
async fn test_follower_update_merges_into_leader() {
    let (ctx, _store) = create_test_context(test_config(8, 100));
    let leader = create_test_manager(&ctx, "alice").await;
    let follower = create_test_manager(&ctx, "bob").await;

    // follower trains against the leader's consensus and commits its dq
    follower.add_one("bob").await.unwrap();
    follower
        .add_data("bob", &entity(&[(3, 1.0)]), 1.0, 1.0)
        .await
        .unwrap();
    follower.train("bob", Some("alice")).await.unwrap();
    follower.commit().await.unwrap();
    let dq = follower.record().await.consensus.dq;
    assert!(dq.get(3) != 0.0);

    leader.merge("bob", 0).await.unwrap();

    // rho = 1, m = 0: z = -dq
    let z = leader.model_snapshot().await.z;
    assert!((z.get(3) + dq.get(3)).abs() < 1e-12);

    let stored = Model::find(&ctx, "spam", "alice").await.unwrap().unwrap();
    assert_vectors_close(&stored.z, &z);
}

#[tokio::test]
async fn test_rounds_move_consensus_towards_data() {
    let (ctx, _store) = create_test_context(test_config(8, 100));
    let manager = create_test_manager(&ctx, "alice").await;
    manager.add_one("alice").await.unwrap();
    manager
        .add_data("alice", &entity(&[(1, 1.0)]), 1.0, 1.0)
        .await
        .unwrap();
    manager
        .add_data("alice", &entity(&[(2, 1.0)]), -1.0, 1.0)
        .await
        .unwrap();

    for _ in 0..5 {
        manager.train("alice", None).await.unwrap();
        manager.merge("alice", 0).await.unwrap();
    }
    manager.commit().await.unwrap();

    let model = manager.model_snapshot().await;
    assert!(model.z.get(1) > 0.0);
    assert!(model.z.get(2) < 0.0);

    let positive = entity(&[(1, 1.0)]);
    assert!(manager.predict("alice", &positive).await.unwrap() > 0.5);
}

#[tokio::test]
async fn test_reset_clears_state() {
    let (ctx, _store) = create_test_context(test_config(8, 100));
    let manager = create_test_manager(&ctx, "alice").await;
    manager.add_one("alice").await.unwrap();
    manager
        .add_data("alice", &entity(&[(1, 1.0)]), 1.0, 1.0)
        .await
        .unwrap();
    manager.train("alice", None).await.unwrap();
    manager.commit().await.unwrap();

    manager.reset().await.unwrap();

    let reopened = SessionManager::open(ctx.clone(), manager.id()).await.unwrap();
    let record = reopened.record().await;
    assert!(record.consensus.mu.is_empty());
    assert!(record.consensus.q.is_empty());
    assert!(record.consensus.dq.is_empty());
}

#[tokio::test]
async fn test_committed_feature_keys_survive_reopen() {
    let (ctx, store) = create_test_context(test_config(8, 100));
    let manager = create_test_manager(&ctx, "alice").await;
    manager.add_one("u1").await.unwrap();
    manager
        .add_data("u1", &entity(&[(7, 1.0)]), 1.0, 1.0)
        .await
        .unwrap();
    manager.save_one("u1").await.unwrap();
    manager.train("u1", None).await.unwrap();
    manager.commit().await.unwrap();
    manager.unload_one("u1").await.unwrap();

    // a context of its own reads everything back from the store
    let fresh = Context::new(store, test_config(8, 100));
    let reopened = SessionManager::open_for(fresh, "spam", "alice").await.unwrap();
    let model = reopened.model_snapshot().await;
    assert!(model.features.contains(&7));
    assert!(model.z.contains_key(7));
}
