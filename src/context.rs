//! Explicit runtime context
//!
//! Everything a session manager needs from its environment (the document
//! store, configuration, how to build solvers and how to evict training
//! instances) travels in one `Context` handed to constructors.
//!
//! Clones of a context share one table of open session managers, so every
//! `open` of a record through them hands out the same manager.

use crate::config::{MantisConfig, StoreConfig};
use crate::error::Result;
use crate::mantis::eviction::{EvictionPolicy, RandomEviction};
use crate::mantis::SessionManager;
use crate::solver::{SolverBuilder, SvmDualBuilder};
use crate::storage::{DocumentStore, InMemoryDocumentStore, LibsqlDocumentStore};
use crate::types::RecordId;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::info;

/// Open managers by mantis record id
pub(crate) type ManagerRegistry = Mutex<HashMap<RecordId, Weak<SessionManager>>>;

#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn DocumentStore>,
    pub config: Arc<MantisConfig>,
    pub solvers: Arc<dyn SolverBuilder>,
    pub eviction: Arc<dyn EvictionPolicy>,
    pub(crate) managers: Arc<ManagerRegistry>,
}

impl Context {
    /// Context with the default solver and eviction policy
    pub fn new(store: Arc<dyn DocumentStore>, config: MantisConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            solvers: Arc::new(SvmDualBuilder),
            eviction: Arc::new(RandomEviction),
            managers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open the store named by the configuration
    pub async fn from_config(config: MantisConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn DocumentStore> = match &config.store {
            StoreConfig::Memory => {
                info!("Using in-memory document store");
                Arc::new(InMemoryDocumentStore::new())
            }
            StoreConfig::Libsql { path } => Arc::new(LibsqlDocumentStore::open_local(path).await?),
        };
        Ok(Self::new(store, config))
    }

    pub fn with_solver_builder(mut self, solvers: Arc<dyn SolverBuilder>) -> Self {
        self.solvers = solvers;
        self
    }

    pub fn with_eviction_policy(mut self, eviction: Arc<dyn EvictionPolicy>) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn models(&self) -> &str {
        &self.config.collections.models
    }

    pub fn mantis(&self) -> &str {
        &self.config.collections.mantis
    }

    pub fn entities(&self) -> &str {
        &self.config.collections.entities
    }

    /// Number of session managers currently open through this context
    pub async fn open_managers(&self) -> usize {
        self.managers
            .lock()
            .await
            .values()
            .filter(|m| m.strong_count() > 0)
            .count()
    }
}
