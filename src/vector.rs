//! Sparse feature vectors
//!
//! `SparseVector` is the value type behind model weights, the consensus
//! vector `z`, the dual variable `mu` and the auxiliary `q`/`dq` vectors.
//! Keys are feature uids; iteration order is the key order, so the external
//! encoding of a vector is deterministic.

use crate::error::{MantisError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Feature uid
pub type FeatureKey = u64;

/// Key-indexed vector of f64 values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<(FeatureKey, f64)>", into = "Vec<(FeatureKey, f64)>")]
pub struct SparseVector {
    entries: BTreeMap<FeatureKey, f64>,
}

impl SparseVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value at `key`, zero when the key is absent
    pub fn get(&self, key: FeatureKey) -> f64 {
        self.entries.get(&key).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, key: FeatureKey, value: f64) {
        self.entries.insert(key, value);
    }

    pub fn contains_key(&self, key: FeatureKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = FeatureKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureKey, f64)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, *v))
    }

    /// In place `self += scale * other`; keys of `other` are added to `self`
    pub fn add(&mut self, other: &SparseVector, scale: f64) {
        for (key, value) in other.iter() {
            *self.entries.entry(key).or_insert(0.0) += scale * value;
        }
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Squared euclidean norm
    pub fn norm2(&self) -> f64 {
        self.entries.values().map(|v| v * v).sum()
    }

    pub fn dot(&self, other: &SparseVector) -> f64 {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small
            .entries
            .iter()
            .filter_map(|(k, v)| large.entries.get(k).map(|w| v * w))
            .sum()
    }

    /// Register keys with a zero value; existing values are left alone
    pub fn add_keys<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = FeatureKey>,
    {
        for key in keys {
            self.entries.entry(key).or_insert(0.0);
        }
    }

    pub fn is_finite(&self) -> bool {
        self.entries.values().all(|v| v.is_finite())
    }

    /// Encode as a JSON array of `[key, value]` pairs
    pub fn to_external(&self) -> Value {
        Value::Array(
            self.iter()
                .map(|(k, v)| serde_json::json!([k, v]))
                .collect(),
        )
    }

    /// Decode the `[key, value]` pair encoding; `null` decodes to an empty vector
    pub fn from_external(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Array(_) => Ok(serde_json::from_value(value.clone())?),
            other => Err(MantisError::InvalidDocument(format!(
                "expected an array of [key, value] pairs, got {}",
                other
            ))),
        }
    }
}

impl From<Vec<(FeatureKey, f64)>> for SparseVector {
    fn from(pairs: Vec<(FeatureKey, f64)>) -> Self {
        Self {
            entries: pairs.into_iter().collect(),
        }
    }
}

impl From<SparseVector> for Vec<(FeatureKey, f64)> {
    fn from(vector: SparseVector) -> Self {
        vector.entries.into_iter().collect()
    }
}

impl FromIterator<(FeatureKey, f64)> for SparseVector {
    fn from_iter<I: IntoIterator<Item = (FeatureKey, f64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
