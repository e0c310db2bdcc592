//! Core data types for the Mantis consensus system
//!
//! Identifiers, training instances, entities and hyperparameters shared by
//! the records, the solver and the session manager.

use crate::error::{MantisError, Result};
use crate::vector::SparseVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for persisted records (models and mantis records)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a training entity
///
/// Persisted data maps are keyed by the string form; `from_string` turns the
/// stored key back into the typed id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier (also used as a record creator)
pub type UserId = String;

/// One stored training instance: `[slot, label, weight]` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(usize, f64, f64)", into = "(usize, f64, f64)")]
pub struct Instance {
    pub slot: usize,
    pub label: f64,
    pub weight: f64,
}

impl From<(usize, f64, f64)> for Instance {
    fn from((slot, label, weight): (usize, f64, f64)) -> Self {
        Self {
            slot,
            label,
            weight,
        }
    }
}

impl From<Instance> for (usize, f64, f64) {
    fn from(instance: Instance) -> Self {
        (instance.slot, instance.label, instance.weight)
    }
}

/// Training data of one user: entity id to its solver slot, label and weight
pub type UserData = HashMap<EntityId, Instance>;

/// Encode user data with string keys for persistence
pub fn user_data_to_external(data: &UserData) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = data
        .iter()
        .map(|(id, instance)| {
            (
                id.to_string(),
                serde_json::json!([instance.slot, instance.label, instance.weight]),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}

/// Decode persisted user data, turning string keys back into entity ids
pub fn user_data_from_external(value: &serde_json::Value) -> Result<UserData> {
    match value {
        serde_json::Value::Null => Ok(UserData::new()),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(key, raw)| {
                let id = EntityId::from_string(key)?;
                let instance: Instance = serde_json::from_value(raw.clone())?;
                Ok((id, instance))
            })
            .collect(),
        other => Err(MantisError::InvalidDocument(format!(
            "expected user data object, got {}",
            other
        ))),
    }
}

/// A training entity with its feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub features: SparseVector,
}

impl Entity {
    pub fn new(features: SparseVector) -> Self {
        Self {
            id: EntityId::new(),
            features,
        }
    }
}

/// Solver hyperparameters carried by a mantis record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hyperparameters {
    pub eps: f64,
    pub gamma: f64,
    pub rho: f64,
    pub max_num_iters: usize,
    pub max_num_instances: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            eps: 1e-4,
            gamma: 1.0,
            rho: 1.0,
            max_num_iters: 1000,
            max_num_instances: 1000,
        }
    }
}

impl Hyperparameters {
    /// Mixing ratio `rho / (rho + gamma)` of the auxiliary update
    pub fn mixing_ratio(&self) -> f64 {
        self.rho / (self.rho + self.gamma)
    }
}
