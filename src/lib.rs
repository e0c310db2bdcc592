//! Mantis - ADMM Consensus Optimizer Sessions
//!
//! Trains per-user linear classifiers that are pulled towards a shared
//! consensus model:
//! - Per-user local solvers with bounded, slot-addressed training instances
//! - Dual ascent, auxiliary and merge steps of consensus ADMM
//! - A bounded working set of live users backed by a document store
//!
//! # Architecture
//!
//! The crate is organized into several layers:
//! - **Types**: Identifiers, instances, entities, hyperparameters, sparse vectors
//! - **Storage**: Document store backends (in-memory, libSQL)
//! - **Records**: The shared `Model` and its `MantisRecord`
//! - **Mantis**: The `SessionManager` and its consensus steps
//!
//! # Example
//!
//! ```ignore
//! use mantis_core::{Context, Entity, MantisConfig, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> mantis_core::Result<()> {
//!     let ctx = Context::from_config(MantisConfig::default()).await?;
//!     let manager = SessionManager::create(ctx, "spam", "alice").await?;
//!
//!     manager.add_one("alice").await?;
//!     let entity = Entity::new(vec![(1, 1.0), (7, 0.5)].into());
//!     manager.add_data("alice", &entity, 1.0, 1.0).await?;
//!
//!     manager.train("alice", None).await?;
//!     manager.merge("alice", 0).await?;
//!     manager.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod mantis;
pub mod model;
pub mod registry;
pub mod solver;
pub mod storage;
pub mod types;
pub mod vector;

// Re-export commonly used types
pub use config::MantisConfig;
pub use context::Context;
pub use error::{MantisError, Result, ResultExt};
pub use mantis::{MantisRecord, SessionManager};
pub use model::Model;
pub use registry::{AnyRecord, Record};
pub use storage::{DocumentStore, InMemoryDocumentStore, LibsqlDocumentStore};
pub use types::{Entity, EntityId, Hyperparameters, Instance, RecordId, UserData, UserId};
pub use vector::SparseVector;
