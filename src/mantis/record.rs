//! Persisted per-model optimizer record
//!
//! One record exists per `(model name, creator)`. Besides the solver
//! hyperparameters it carries the ADMM vectors `mu`, `q` and `dq`; per-user
//! training data lives under `data.<user>` in the same document but is only
//! ever read and written field by field through the session manager.

use crate::context::Context;
use crate::error::{MantisError, Result};
use crate::model::Model;
use crate::registry::Record;
use crate::storage::FieldPath;
use crate::types::{Hyperparameters, RecordId, UserId};
use crate::vector::{FeatureKey, SparseVector};
use serde_json::{json, Value};
use tracing::warn;

pub const FIELD_DATA: &str = "data";
pub const FIELD_MU: &str = "mu";
pub const FIELD_Q: &str = "q";
pub const FIELD_DQ: &str = "dq";
pub const FIELD_PANDA: &str = "panda";

/// Penalties at or below this are treated as unset on restore
pub const MIN_PENALTY: f64 = 1e-8;

/// Value `gamma` is pinned to after a successful restore.
///
/// Applied regardless of the stored or configured gamma.
// TODO: confirm with the model owners whether this override is intended;
// until then the persisted gamma is ignored.
pub const GAMMA_OVERRIDE: f64 = 0.1;

/// ADMM state of one record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsensusVectors {
    /// Dual variable
    pub mu: SparseVector,
    /// Auxiliary local variable
    pub q: SparseVector,
    /// Change of `q` in the last local step
    pub dq: SparseVector,
}

impl ConsensusVectors {
    pub fn add_keys<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = FeatureKey>,
        I::IntoIter: Clone,
    {
        let keys = keys.into_iter();
        self.mu.add_keys(keys.clone());
        self.q.add_keys(keys.clone());
        self.dq.add_keys(keys);
    }

    pub fn clear(&mut self) {
        self.mu.clear();
        self.q.clear();
        self.dq.clear();
    }

    /// Field updates persisting all three vectors
    pub fn to_fields(&self) -> Vec<(FieldPath, Value)> {
        vec![
            (FieldPath::new(FIELD_MU), self.mu.to_external()),
            (FieldPath::new(FIELD_Q), self.q.to_external()),
            (FieldPath::new(FIELD_DQ), self.dq.to_external()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MantisRecord {
    pub id: RecordId,
    /// Owning model
    pub model_id: RecordId,
    /// Model name, shared by every creator's copy
    pub name: String,
    pub creator: UserId,
    pub params: Hyperparameters,
    pub consensus: ConsensusVectors,
}

impl MantisRecord {
    pub fn new(model: &Model, params: Hyperparameters) -> Self {
        Self {
            id: RecordId::new(),
            model_id: model.id,
            name: model.name.clone(),
            creator: model.creator.clone(),
            params,
            consensus: ConsensusVectors::default(),
        }
    }

    pub async fn insert(&self, ctx: &Context) -> Result<()> {
        ctx.store
            .insert(ctx.mantis(), &self.id.to_string(), self.to_tagged_document())
            .await
    }

    pub async fn load(ctx: &Context, id: RecordId) -> Result<Self> {
        match ctx.store.load_by_id(ctx.mantis(), &id.to_string()).await? {
            Some(doc) => Self::from_document(&doc),
            None => Err(MantisError::NotFound(format!("mantis record {}", id))),
        }
    }

    /// Id of the record for `(name, creator)`, if one exists
    pub async fn find_id(ctx: &Context, name: &str, creator: &str) -> Result<Option<RecordId>> {
        let doc = ctx
            .store
            .find_one(
                ctx.mantis(),
                &[("name", json!(name)), ("creator", json!(creator))],
                &[],
            )
            .await?;
        match doc.as_ref().and_then(|d| d.get("id")).and_then(Value::as_str) {
            Some(id) => Ok(Some(RecordId::from_string(id)?)),
            None => Ok(None),
        }
    }
}

/// Guard the penalties of a restored record
///
/// Non-positive `gamma`/`rho` would zero the denominators of the mixing
/// ratio and of the merge step, so they fall back to 1. `gamma` is then
/// pinned to `GAMMA_OVERRIDE`.
pub fn sanitize_params(mut params: Hyperparameters, record: &str) -> Hyperparameters {
    if !(params.gamma > MIN_PENALTY) {
        warn!("mantis {}: gamma {} not positive, using 1", record, params.gamma);
        params.gamma = 1.0;
    }
    if !(params.rho > MIN_PENALTY) {
        warn!("mantis {}: rho {} not positive, using 1", record, params.rho);
        params.rho = 1.0;
    }
    params.gamma = GAMMA_OVERRIDE;
    params
}

impl Record for MantisRecord {
    const TYPE_TAG: &'static str = "mantis";

    fn restore(document: &Value) -> Result<Self> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MantisError::InvalidDocument("mantis record without id".to_string()))?;
        let model_id = document
            .get(FIELD_PANDA)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MantisError::InvalidDocument(format!("mantis record {} without a model", id))
            })?;
        let name = document.get("name").and_then(Value::as_str).unwrap_or_default();
        let creator = document.get("creator").and_then(Value::as_str).unwrap_or_default();

        let params: Hyperparameters = serde_json::from_value(document.clone())?;
        let params = sanitize_params(params, id);

        let null = Value::Null;
        let vector = |field: &str| SparseVector::from_external(document.get(field).unwrap_or(&null));

        Ok(Self {
            id: RecordId::from_string(id)?,
            model_id: RecordId::from_string(model_id)?,
            name: name.to_string(),
            creator: creator.to_string(),
            params,
            consensus: ConsensusVectors {
                mu: vector(FIELD_MU)?,
                q: vector(FIELD_Q)?,
                dq: vector(FIELD_DQ)?,
            },
        })
    }

    fn to_document(&self) -> Value {
        json!({
            "id": self.id.to_string(),
            FIELD_PANDA: self.model_id.to_string(),
            "name": self.name,
            "creator": self.creator,
            "eps": self.params.eps,
            "gamma": self.params.gamma,
            "rho": self.params.rho,
            "maxNumIters": self.params.max_num_iters,
            "maxNumInstances": self.params.max_num_instances,
            FIELD_MU: self.consensus.mu.to_external(),
            FIELD_Q: self.consensus.q.to_external(),
            FIELD_DQ: self.consensus.dq.to_external(),
            FIELD_DATA: {},
        })
    }
}
