//! Session manager
//!
//! Holds the live users of one mantis record. Each user sits behind its own
//! async mutex so operations on different users run concurrently while
//! operations on the same user serialize. The set of live users is bounded by
//! `sessions.max_live_users`; past that, the least recently used user is
//! persisted and dropped from memory.
//!
//! Managers are shared: opening a record that is already open through the
//! same `Context` returns the existing manager, so there is never more than
//! one in-memory session per user of a record.

use crate::context::Context;
use crate::error::{MantisError, Result};
use crate::mantis::record::{ConsensusVectors, MantisRecord, FIELD_DATA};
use crate::mantis::session::UserSession;
use crate::model::Model;
use crate::solver::{LocalSolver, SolverInstance};
use crate::storage::{document, FieldPath};
use crate::types::{user_data_from_external, Entity, Hyperparameters, RecordId, UserData, UserId};
use crate::vector::SparseVector;
use lru::LruCache;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

type SessionHandle = Arc<Mutex<Option<UserSession>>>;

pub struct SessionManager {
    pub(crate) ctx: Context,
    pub(crate) id: RecordId,
    pub(crate) name: String,
    pub(crate) creator: UserId,
    pub(crate) params: Hyperparameters,
    model_id: RecordId,
    pub(crate) consensus: Mutex<ConsensusVectors>,
    pub(crate) model: RwLock<Model>,
    sessions: Mutex<HashMap<UserId, SessionHandle>>,
    recency: Mutex<LruCache<UserId, ()>>,
    evictions: AtomicUsize,
}

impl SessionManager {
    /// Create a model and its mantis record for `(name, creator)`
    pub async fn create(ctx: Context, name: &str, creator: &str) -> Result<Arc<Self>> {
        if Model::find(&ctx, name, creator).await?.is_some() {
            error!("Model {} of {} already exists", name, creator);
            return Err(MantisError::AlreadyExists(format!("model {} of {}", name, creator)));
        }

        let mut model = Model::new(name, creator);
        let record = MantisRecord::new(&model, ctx.config.defaults);
        model.mantis = Some(record.id);
        model.insert(&ctx).await?;
        record.insert(&ctx).await?;
        info!("Created model {} for {} (mantis {})", name, creator, record.id);

        Self::open(ctx, record.id).await
    }

    /// Open an existing mantis record and its model
    ///
    /// Returns the manager already open for `id` when there is one.
    pub async fn open(ctx: Context, id: RecordId) -> Result<Arc<Self>> {
        let registry = ctx.managers.clone();
        let mut managers = registry.lock().await;
        if let Some(manager) = managers.get(&id).and_then(Weak::upgrade) {
            debug!("Mantis {} already open", id);
            return Ok(manager);
        }

        let record = MantisRecord::load(&ctx, id).await?;
        let model = Model::load(&ctx, record.model_id).await?;
        debug!(
            "Opened mantis {} of model {} (rho={}, gamma={})",
            record.id, record.name, record.params.rho, record.params.gamma
        );
        let manager = Arc::new(Self::from_parts(ctx, record, model));
        managers.retain(|_, m| m.strong_count() > 0);
        managers.insert(id, Arc::downgrade(&manager));
        Ok(manager)
    }

    /// Open the mantis record of `(name, creator)`
    pub async fn open_for(ctx: Context, name: &str, creator: &str) -> Result<Arc<Self>> {
        match MantisRecord::find_id(&ctx, name, creator).await? {
            Some(id) => Self::open(ctx, id).await,
            None => {
                warn!("No mantis record for model {} of {}", name, creator);
                Err(MantisError::NotFound(format!("mantis of {} for {}", name, creator)))
            }
        }
    }

    fn from_parts(ctx: Context, record: MantisRecord, model: Model) -> Self {
        Self {
            ctx,
            id: record.id,
            name: record.name,
            creator: record.creator,
            params: record.params,
            model_id: record.model_id,
            consensus: Mutex::new(record.consensus),
            model: RwLock::new(model),
            sessions: Mutex::new(HashMap::new()),
            recency: Mutex::new(LruCache::unbounded()),
            evictions: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    /// Hyperparameters in effect after restore
    pub fn params(&self) -> &Hyperparameters {
        &self.params
    }

    /// Snapshot of the record as currently held in memory
    pub async fn record(&self) -> MantisRecord {
        MantisRecord {
            id: self.id,
            model_id: self.model_id,
            name: self.name.clone(),
            creator: self.creator.clone(),
            params: self.params,
            consensus: self.consensus.lock().await.clone(),
        }
    }

    pub async fn model_snapshot(&self) -> Model {
        self.model.read().await.clone()
    }

    // -- per-user locking --------------------------------------------------

    fn data_field(user: &str) -> FieldPath {
        FieldPath::new(FIELD_DATA).child(user)
    }

    /// Lock handle for `user`, creating an empty one if needed
    async fn handle(&self, user: &str) -> SessionHandle {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(user.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn existing_handle(&self, user: &str) -> Option<SessionHandle> {
        self.sessions.lock().await.get(user).cloned()
    }

    /// Drop our handle and prune the entry when nobody holds a session for it
    async fn release(&self, user: &str, handle: SessionHandle) {
        drop(handle);
        let mut sessions = self.sessions.lock().await;
        let idle = sessions
            .get(user)
            .map(|h| {
                Arc::strong_count(h) == 1 && h.try_lock().map(|s| s.is_none()).unwrap_or(false)
            })
            .unwrap_or(false);
        if idle {
            sessions.remove(user);
        }
    }

    async fn touch(&self, user: &str) {
        self.recency.lock().await.put(user.to_string(), ());
    }

    async fn forget(&self, user: &str) {
        self.recency.lock().await.pop(user);
    }

    fn not_live(&self, user: &str) -> MantisError {
        warn!("User {} is not live in mantis {}", user, self.id);
        MantisError::NotFound(format!("live user {} in mantis {}", user, self.id))
    }

    /// Write fields of this record, mapping any failure to `StoreWrite`
    pub(crate) async fn write_fields(&self, fields: &[(FieldPath, Value)]) -> Result<()> {
        let described = || {
            fields
                .iter()
                .map(|(path, _)| path.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        match self
            .ctx
            .store
            .update_one_in_fields(self.ctx.mantis(), &self.id.to_string(), fields)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                error!("Mantis {} missing from store while writing {}", self.id, described());
                Err(MantisError::StoreWrite(format!("mantis {} {}", self.id, described())))
            }
            Err(e) => {
                error!("Can not write {} of mantis {}: {}", described(), self.id, e);
                Err(match e {
                    MantisError::StoreWrite(_) => e,
                    other => MantisError::StoreWrite(other.to_string()),
                })
            }
        }
    }

    fn build_solver(&self, weights: SparseVector, user: &str) -> Result<Box<dyn LocalSolver>> {
        self.ctx.solvers.build(weights, &self.params).map_err(|e| {
            error!("Can not create a solver for {} in mantis {}: {}", user, self.id, e);
            match e {
                MantisError::SolverInit(_) => e,
                other => MantisError::SolverInit(other.to_string()),
            }
        })
    }

    // -- membership --------------------------------------------------------

    /// Whether `user` is live in memory
    pub async fn has_user(&self, user: &str) -> bool {
        let Some(handle) = self.existing_handle(user).await else {
            return false;
        };
        let live = handle.lock().await.is_some();
        self.release(user, handle).await;
        live
    }

    /// Whether `user` has persisted data in this record
    pub async fn has_user_in_store(&self, user: &str) -> Result<bool> {
        self.ctx
            .store
            .exists_field(self.ctx.mantis(), &self.id.to_string(), &Self::data_field(user))
            .await
    }

    /// Users currently live, in no particular order
    pub async fn live_users(&self) -> Vec<UserId> {
        let handles: Vec<(UserId, SessionHandle)> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(user, handle)| (user.clone(), handle.clone()))
            .collect();

        let mut live = Vec::with_capacity(handles.len());
        for (user, handle) in handles {
            if handle.lock().await.is_some() {
                live.push(user.clone());
            }
            self.release(&user, handle).await;
        }
        live
    }

    /// Number of per-user lock entries held, live or not
    pub(crate) async fn tracked_users(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Number of users dropped to stay within `max_live_users`
    pub fn eviction_count(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }

    // -- lifecycle ---------------------------------------------------------

    /// Register a brand-new user with an empty data map
    pub async fn add_one(&self, user: &str) -> Result<()> {
        let handle = self.handle(user).await;
        let result = self.add_locked(user, &handle).await;
        self.release(user, handle).await;
        if result.is_ok() {
            self.touch(user).await;
            self.enforce_capacity(user).await;
        }
        result
    }

    async fn add_locked(&self, user: &str, handle: &SessionHandle) -> Result<()> {
        let mut slot = handle.lock().await;
        if slot.is_some() || self.has_user_in_store(user).await? {
            error!("User {} already exists in mantis {}", user, self.id);
            return Err(MantisError::AlreadyExists(format!(
                "user {} in mantis {}",
                user, self.id
            )));
        }

        let weights = {
            let model = self.model.read().await;
            model.get_model(&self.ctx, user).await?
        };
        let solver = self.build_solver(weights, user)?;

        self.write_fields(&[(Self::data_field(user), json!({}))]).await?;
        *slot = Some(UserSession::new(solver));
        info!("Added user {} to mantis {}", user, self.id);
        Ok(())
    }

    /// Bring a stored user into memory; a no-op when already live
    pub async fn load_one(&self, user: &str) -> Result<()> {
        let handle = self.handle(user).await;
        let result = self.load_locked(user, &handle).await;
        self.release(user, handle).await;
        if result.is_ok() {
            self.touch(user).await;
            self.enforce_capacity(user).await;
        }
        result
    }

    async fn load_locked(&self, user: &str, handle: &SessionHandle) -> Result<()> {
        let mut slot = handle.lock().await;
        if slot.is_some() {
            debug!("User {} already live in mantis {}", user, self.id);
            return Ok(());
        }

        let field = Self::data_field(user);
        let doc = self
            .ctx
            .store
            .load_one_in_fields(self.ctx.mantis(), &self.id.to_string(), &[field.clone()])
            .await
            .map_err(|e| {
                error!("Can not read {} of mantis {}: {}", field, self.id, e);
                e
            })?;
        let Some(raw) = doc.as_ref().and_then(|d| document::get_path(d, &field)) else {
            warn!("Mantis {} has no stored data for user {}", self.id, user);
            return Err(MantisError::NotFound(format!(
                "user {} in mantis {}",
                user, self.id
            )));
        };
        let data = user_data_from_external(raw).map_err(|e| {
            error!("Stored data of user {} in mantis {} is invalid: {}", user, self.id, e);
            e
        })?;

        let weights = {
            let model = self.model.read().await;
            model.get_model(&self.ctx, user).await?
        };
        let solver = self.build_solver(weights, user)?;

        let ids: Vec<String> = data.keys().map(|id| id.to_string()).collect();
        let entities = self
            .ctx
            .store
            .load_all_by_ids(self.ctx.entities(), &ids)
            .await
            .map_err(|e| {
                error!("Can not read entities of user {} in mantis {}: {}", user, self.id, e);
                e
            })?
            .into_iter()
            .map(serde_json::from_value::<Entity>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                error!("Invalid entity for user {} in mantis {}: {}", user, self.id, e);
                MantisError::from(e)
            })?;

        let session = UserSession::restore(solver, data, &entities)?;
        info!(
            "Loaded user {} into mantis {} ({} instances)",
            user,
            self.id,
            session.data().len()
        );
        *slot = Some(session);
        Ok(())
    }

    /// Persist a live user's data and drop it from memory
    pub async fn unload_one(&self, user: &str) -> Result<()> {
        let Some(handle) = self.existing_handle(user).await else {
            return Err(self.not_live(user));
        };
        let result = self.unload_locked(user, &handle).await;
        if result.is_ok() {
            self.forget(user).await;
            debug!("Unloaded user {} from mantis {}", user, self.id);
        }
        self.release(user, handle).await;
        result
    }

    async fn unload_locked(&self, user: &str, handle: &SessionHandle) -> Result<()> {
        let mut slot = handle.lock().await;
        let data = match slot.as_ref() {
            Some(session) => session.data_to_external(),
            None => return Err(self.not_live(user)),
        };
        // memory is only dropped once the data is safely stored
        self.write_fields(&[(Self::data_field(user), data)]).await?;
        *slot = None;
        Ok(())
    }

    /// Delete a user's stored data and drop any live state
    pub async fn remove_one(&self, user: &str) -> Result<()> {
        let handle = self.handle(user).await;
        let result = self.remove_locked(user, &handle).await;
        if result.is_ok() {
            self.forget(user).await;
        }
        self.release(user, handle).await;
        result
    }

    async fn remove_locked(&self, user: &str, handle: &SessionHandle) -> Result<()> {
        let mut slot = handle.lock().await;
        if !self.has_user_in_store(user).await? {
            warn!("User {} is not stored in mantis {}", user, self.id);
            return Err(MantisError::NotFound(format!(
                "user {} in mantis {}",
                user, self.id
            )));
        }

        let field = Self::data_field(user);
        let removed = self
            .ctx
            .store
            .remove_field(self.ctx.mantis(), &self.id.to_string(), &field)
            .await
            .map_err(|e| {
                error!("Can not remove {} of mantis {}: {}", field, self.id, e);
                match e {
                    MantisError::StoreWrite(_) => e,
                    other => MantisError::StoreWrite(other.to_string()),
                }
            })?;
        if !removed {
            error!("Removing {} of mantis {} changed nothing", field, self.id);
            return Err(MantisError::StoreWrite(format!("mantis {} {}", self.id, field)));
        }

        *slot = None;
        info!("Removed user {} from mantis {}", user, self.id);
        Ok(())
    }

    /// Persist a live user's data, keeping it live
    pub async fn save_one(&self, user: &str) -> Result<()> {
        let Some(handle) = self.existing_handle(user).await else {
            return Err(self.not_live(user));
        };
        let result = {
            let slot = handle.lock().await;
            match slot.as_ref() {
                Some(session) => {
                    self.write_fields(&[(Self::data_field(user), session.data_to_external())])
                        .await
                }
                None => Err(self.not_live(user)),
            }
        };
        self.release(user, handle).await;
        result
    }

    /// Record a labeled entity for a live user; returns the solver slot used
    pub async fn add_data(
        &self,
        user: &str,
        entity: &Entity,
        label: f64,
        weight: f64,
    ) -> Result<usize> {
        let Some(handle) = self.existing_handle(user).await else {
            return Err(self.not_live(user));
        };
        let result = {
            let mut slot = handle.lock().await;
            match slot.as_mut() {
                Some(session) => session.add_instance(
                    entity,
                    label,
                    weight,
                    self.params.max_num_instances,
                    self.ctx.eviction.as_ref(),
                ),
                None => Err(self.not_live(user)),
            }
        };
        self.release(user, handle).await;
        let slot = result?;

        let keys: Vec<_> = entity.features.keys().collect();
        self.model.write().await.add_features(keys.iter().copied());
        self.consensus.lock().await.add_keys(keys);
        self.touch(user).await;
        Ok(slot)
    }

    /// Run `f` against a live user's session
    pub(crate) async fn with_session<T>(
        &self,
        user: &str,
        f: impl FnOnce(&mut UserSession) -> T,
    ) -> Result<T> {
        let Some(handle) = self.existing_handle(user).await else {
            return Err(self.not_live(user));
        };
        let result = {
            let mut slot = handle.lock().await;
            match slot.as_mut() {
                Some(session) => Ok(f(session)),
                None => Err(self.not_live(user)),
            }
        };
        self.release(user, handle).await;
        result
    }

    /// Run `f` against a live user's session together with the consensus state
    pub(crate) async fn with_consensus_session<T>(
        &self,
        user: &str,
        f: impl FnOnce(&mut UserSession, &mut ConsensusVectors) -> T,
    ) -> Result<T> {
        let Some(handle) = self.existing_handle(user).await else {
            return Err(self.not_live(user));
        };
        let result = {
            let mut slot = handle.lock().await;
            match slot.as_mut() {
                Some(session) => {
                    let mut state = self.consensus.lock().await;
                    Ok(f(session, &mut state))
                }
                None => Err(self.not_live(user)),
            }
        };
        self.release(user, handle).await;
        if result.is_ok() {
            self.touch(user).await;
        }
        result
    }

    pub async fn user_data(&self, user: &str) -> Result<UserData> {
        self.with_session(user, |s| s.data().clone()).await
    }

    pub async fn solver_instances(&self, user: &str) -> Result<Vec<SolverInstance>> {
        self.with_session(user, |s| s.solver.instances()).await
    }

    /// Current local weights of a live user
    pub async fn user_weights(&self, user: &str) -> Result<SparseVector> {
        self.with_session(user, |s| s.solver.weights().clone()).await
    }

    /// Probability that `entity` is positive under the user's local weights
    pub async fn predict(&self, user: &str, entity: &Entity) -> Result<f64> {
        let weights = self.user_weights(user).await?;
        Ok(crate::model::sigmoid(weights.dot(&entity.features)))
    }

    /// Store a live user's local weights on their own model copy
    pub async fn publish_weights(&self, user: &str) -> Result<()> {
        let weights = self.user_weights(user).await?;

        if user == self.creator {
            let mut model = self.model.write().await;
            let previous = std::mem::replace(&mut model.weights, weights);
            if let Err(e) = model.push_weights(&self.ctx).await {
                model.weights = previous;
                return Err(e);
            }
            return Ok(());
        }

        match Model::find(&self.ctx, &self.name, user).await? {
            Some(mut copy) => {
                copy.weights = weights;
                copy.push_weights(&self.ctx).await
            }
            None => {
                let mut copy = self.model.read().await.clone_for(user);
                copy.weights = weights;
                copy.insert(&self.ctx).await?;
                info!("Created model copy of {} for {}", self.name, user);
                Ok(())
            }
        }
    }

    // -- working set -------------------------------------------------------

    /// Unload least recently used users until within `max_live_users`
    async fn enforce_capacity(&self, keep: &str) {
        let capacity = self.ctx.config.sessions.max_live_users;
        loop {
            let victim = {
                let mut recency = self.recency.lock().await;
                if recency.len() <= capacity {
                    return;
                }
                match recency.pop_lru() {
                    Some((user, ())) if user == keep => {
                        recency.put(user, ());
                        return;
                    }
                    Some((user, ())) => user,
                    None => return,
                }
            };

            match self.unload_one(&victim).await {
                Ok(()) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Evicted user {} from mantis {} (LRU, max_live_users={})",
                        victim, self.id, capacity
                    );
                }
                Err(MantisError::NotFound(_)) => continue,
                Err(e) => {
                    warn!("Keeping user {} live, eviction failed: {}", victim, e);
                    self.touch(&victim).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MantisConfig;
    use crate::solver::MockSolverBuilder;
    use crate::storage::test_utils::{create_test_store, seed_entities};
    use crate::storage::{DocumentStore, InMemoryDocumentStore};

    fn ctx_with(store: Arc<InMemoryDocumentStore>, max_live_users: usize) -> Context {
        let mut config = MantisConfig::default();
        config.sessions.max_live_users = max_live_users;
        Context::new(store, config)
    }

    async fn manager(max_live_users: usize) -> (Arc<SessionManager>, Arc<InMemoryDocumentStore>) {
        let store = create_test_store();
        let ctx = ctx_with(store.clone(), max_live_users);
        let manager = SessionManager::create(ctx, "spam", "alice").await.unwrap();
        (manager, store)
    }

    #[tokio::test]
    async fn test_add_one_twice_is_rejected() {
        let (manager, _) = manager(8).await;
        manager.add_one("u1").await.unwrap();
        assert!(manager.has_user("u1").await);
        assert!(manager.has_user_in_store("u1").await.unwrap());

        let err = manager.add_one("u1").await.unwrap_err();
        assert!(matches!(err, MantisError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_add_one_rejects_stored_user() {
        let (manager, _) = manager(8).await;
        manager.add_one("u1").await.unwrap();
        manager.unload_one("u1").await.unwrap();

        assert!(!manager.has_user("u1").await);
        assert!(matches!(
            manager.add_one("u1").await,
            Err(MantisError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_solver_failure_leaves_no_state() {
        let store = create_test_store();
        let mut builder = MockSolverBuilder::new();
        builder
            .expect_build()
            .returning(|_, _| Err(MantisError::SolverInit("boom".to_string())));
        let ctx = ctx_with(store, 8).with_solver_builder(Arc::new(builder));
        let manager = SessionManager::create(ctx, "spam", "alice").await.unwrap();

        let err = manager.add_one("u1").await.unwrap_err();
        assert!(matches!(err, MantisError::SolverInit(_)));
        assert!(!manager.has_user("u1").await);
        assert!(!manager.has_user_in_store("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_user_unstored() {
        let (manager, store) = manager(8).await;
        store.set_fail_writes(true);

        let err = manager.add_one("u1").await.unwrap_err();
        assert!(matches!(err, MantisError::StoreWrite(_)));
        assert!(!manager.has_user("u1").await);

        store.set_fail_writes(false);
        manager.add_one("u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_unload_keeps_user_live() {
        let (manager, store) = manager(8).await;
        manager.add_one("u1").await.unwrap();

        store.set_fail_writes(true);
        assert!(manager.unload_one("u1").await.is_err());
        assert!(manager.has_user("u1").await);
    }

    #[tokio::test]
    async fn test_operations_on_absent_user() {
        let (manager, _) = manager(8).await;
        let entity = Entity::new(vec![(1, 1.0)].into());

        assert!(matches!(manager.unload_one("ghost").await, Err(MantisError::NotFound(_))));
        assert!(matches!(manager.save_one("ghost").await, Err(MantisError::NotFound(_))));
        assert!(matches!(manager.remove_one("ghost").await, Err(MantisError::NotFound(_))));
        assert!(matches!(manager.load_one("ghost").await, Err(MantisError::NotFound(_))));
        assert!(matches!(
            manager.add_data("ghost", &entity, 1.0, 1.0).await,
            Err(MantisError::NotFound(_))
        ));
        assert!(manager.live_users().await.is_empty());
    }

    #[tokio::test]
    async fn test_membership_queries_do_not_grow_lock_table() {
        let (manager, _) = manager(8).await;
        manager.add_one("u1").await.unwrap();

        for i in 0..50 {
            let user = format!("ghost{}", i);
            assert!(!manager.has_user(&user).await);
            assert!(manager.unload_one(&user).await.is_err());
            assert!(manager.load_one(&user).await.is_err());
        }
        assert_eq!(manager.live_users().await, vec!["u1".to_string()]);
        assert_eq!(manager.tracked_users().await, 1);

        // an unloaded user leaves no entry behind either
        manager.unload_one("u1").await.unwrap();
        assert!(!manager.has_user("u1").await);
        assert!(manager.live_users().await.is_empty());
        assert_eq!(manager.tracked_users().await, 0);
    }

    #[tokio::test]
    async fn test_load_read_failure_leaves_user_unloaded() {
        let (manager, store) = manager(8).await;
        let entity = Entity::new(vec![(1, 1.0)].into());
        seed_entities(store.as_ref(), "entities", &[entity.clone()])
            .await
            .unwrap();
        manager.add_one("u1").await.unwrap();
        manager.add_data("u1", &entity, 1.0, 1.0).await.unwrap();
        manager.unload_one("u1").await.unwrap();

        store.set_fail_reads(Some("entities"));
        assert!(matches!(manager.load_one("u1").await, Err(MantisError::Database(_))));
        assert!(!manager.has_user("u1").await);

        store.set_fail_reads(Some("mantis"));
        assert!(matches!(manager.load_one("u1").await, Err(MantisError::Database(_))));
        assert!(!manager.has_user("u1").await);

        store.set_fail_reads(None);
        manager.load_one("u1").await.unwrap();
        assert_eq!(manager.solver_instances("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_rejects_malformed_entity() {
        let (manager, store) = manager(8).await;
        let entity = Entity::new(vec![(1, 1.0)].into());
        manager.add_one("u1").await.unwrap();
        manager.add_data("u1", &entity, 1.0, 1.0).await.unwrap();
        manager.unload_one("u1").await.unwrap();

        store
            .insert("entities", &entity.id.to_string(), json!({"id": 42}))
            .await
            .unwrap();
        assert!(matches!(
            manager.load_one("u1").await,
            Err(MantisError::Serialization(_))
        ));
        assert!(!manager.has_user("u1").await);
    }

    #[tokio::test]
    async fn test_open_returns_shared_manager() {
        let (manager, _) = manager(8).await;
        let ctx = manager.ctx.clone();

        let again = SessionManager::open(ctx.clone(), manager.id()).await.unwrap();
        let by_name = SessionManager::open_for(ctx.clone(), "spam", "alice").await.unwrap();
        assert!(Arc::ptr_eq(&manager, &again));
        assert!(Arc::ptr_eq(&manager, &by_name));
        assert_eq!(ctx.open_managers().await, 1);

        drop((manager, again, by_name));
        assert_eq!(ctx.open_managers().await, 0);
    }

    #[tokio::test]
    async fn test_load_restores_data_and_slots() {
        let (manager, store) = manager(8).await;
        let entities: Vec<Entity> = (1..=3u64)
            .map(|k| Entity::new(vec![(k, 1.0)].into()))
            .collect();
        seed_entities(store.as_ref(), "entities", &entities)
            .await
            .unwrap();

        manager.add_one("u1").await.unwrap();
        for entity in &entities {
            manager.add_data("u1", entity, 1.0, 1.0).await.unwrap();
        }
        let before = manager.user_data("u1").await.unwrap();
        manager.unload_one("u1").await.unwrap();

        manager.load_one("u1").await.unwrap();
        assert_eq!(manager.user_data("u1").await.unwrap(), before);
        assert_eq!(manager.solver_instances("u1").await.unwrap().len(), 3);

        // loading a live user changes nothing
        manager.load_one("u1").await.unwrap();
        assert_eq!(manager.user_data("u1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_add_data_extends_key_domain() {
        let (manager, _) = manager(8).await;
        manager.add_one("u1").await.unwrap();
        let entity = Entity::new(vec![(7, 1.0), (9, -1.0)].into());

        let slot = manager.add_data("u1", &entity, 1.0, 1.0).await.unwrap();
        assert_eq!(slot, 0);

        let model = manager.model_snapshot().await;
        assert!(model.z.contains_key(7) && model.weights.contains_key(9));
        let record = manager.record().await;
        assert!(record.consensus.mu.contains_key(9));
        assert!(record.consensus.q.contains_key(7));
        assert!(record.consensus.dq.contains_key(7));
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let (manager, _) = manager(2).await;
        manager.add_one("u1").await.unwrap();
        manager.add_one("u2").await.unwrap();
        // u1 becomes most recent
        manager.save_one("u1").await.unwrap();
        manager.add_data("u1", &Entity::new(vec![(1, 1.0)].into()), 1.0, 1.0).await.unwrap();

        manager.add_one("u3").await.unwrap();

        assert!(manager.has_user("u1").await);
        assert!(!manager.has_user("u2").await);
        assert!(manager.has_user("u3").await);
        assert!(manager.has_user_in_store("u2").await.unwrap());
        assert_eq!(manager.eviction_count(), 1);
    }

    #[tokio::test]
    async fn test_open_for_finds_created_record() {
        let (manager, store) = manager(8).await;
        let ctx = ctx_with(store, 8);

        let reopened = SessionManager::open_for(ctx.clone(), "spam", "alice").await.unwrap();
        assert_eq!(reopened.id(), manager.id());
        assert_eq!(reopened.params().gamma, crate::mantis::GAMMA_OVERRIDE);

        assert!(matches!(
            SessionManager::create(ctx.clone(), "spam", "alice").await,
            Err(MantisError::AlreadyExists(_))
        ));
        assert!(matches!(
            SessionManager::open_for(ctx, "spam", "bob").await,
            Err(MantisError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_weights_creates_user_copy() {
        let (manager, _) = manager(8).await;
        manager.add_one("bob").await.unwrap();
        manager.publish_weights("bob").await.unwrap();

        let copy = Model::find(&manager.ctx, "spam", "bob").await.unwrap();
        assert!(copy.is_some());
        manager.publish_weights("bob").await.unwrap();
    }
}
