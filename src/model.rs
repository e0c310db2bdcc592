//! Shared linear model
//!
//! A model document exists per `(name, creator)`: the creator's own copy holds
//! the consensus vector `z` that followers merge into, and every user copy
//! holds that user's personalized `weights`.

use crate::context::Context;
use crate::error::{MantisError, Result};
use crate::registry::Record;
use crate::storage::FieldPath;
use crate::types::{RecordId, UserId};
use crate::vector::{FeatureKey, SparseVector};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub const FIELD_WEIGHTS: &str = "weights";
pub const FIELD_Z: &str = "z";
pub const FIELD_FEATURES: &str = "features";
pub const FIELD_MANTIS: &str = "mantis";

/// Logistic function
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub id: RecordId,
    pub name: String,
    pub creator: UserId,
    /// Registered feature uids
    pub features: BTreeSet<FeatureKey>,
    pub weights: SparseVector,
    /// Consensus vector
    pub z: SparseVector,
    pub mantis: Option<RecordId>,
}

impl Model {
    pub fn new(name: impl Into<String>, creator: impl Into<String>) -> Self {
        Self {
            id: RecordId::new(),
            name: name.into(),
            creator: creator.into(),
            features: BTreeSet::new(),
            weights: SparseVector::new(),
            z: SparseVector::new(),
            mantis: None,
        }
    }

    /// Copy of this model owned by `user`
    pub fn clone_for(&self, user: &str) -> Self {
        Self {
            id: RecordId::new(),
            creator: user.to_string(),
            mantis: None,
            ..self.clone()
        }
    }

    /// Store as a new document
    pub async fn insert(&self, ctx: &Context) -> Result<()> {
        ctx.store
            .insert(ctx.models(), &self.id.to_string(), self.to_tagged_document())
            .await
    }

    pub async fn load(ctx: &Context, id: RecordId) -> Result<Self> {
        match ctx.store.load_by_id(ctx.models(), &id.to_string()).await? {
            Some(doc) => Self::from_document(&doc),
            None => Err(MantisError::NotFound(format!("model {}", id))),
        }
    }

    /// Model document of `(name, creator)`, if one exists
    pub async fn find(ctx: &Context, name: &str, creator: &str) -> Result<Option<Self>> {
        let fields = [
            "_type",
            "name",
            "creator",
            FIELD_FEATURES,
            FIELD_WEIGHTS,
            FIELD_Z,
            FIELD_MANTIS,
        ]
        .map(FieldPath::new);
        let doc = ctx
            .store
            .find_one(
                ctx.models(),
                &[("name", json!(name)), ("creator", json!(creator))],
                &fields,
            )
            .await?;
        doc.map(|d| Self::from_document(&d)).transpose()
    }

    /// Register feature uids on the feature set, the weights and `z`
    pub fn add_features<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = FeatureKey>,
    {
        for key in keys {
            if self.features.insert(key) {
                self.weights.add_keys([key]);
                self.z.add_keys([key]);
            }
        }
    }

    /// Starting weights for `user`
    ///
    /// The creator gets this model's weights; any other user gets the weights
    /// of their own copy when one is stored, else this model's weights.
    pub async fn get_model(&self, ctx: &Context, user: &str) -> Result<SparseVector> {
        if user == self.creator {
            return Ok(self.weights.clone());
        }

        let doc = ctx
            .store
            .find_one(
                ctx.models(),
                &[("name", json!(self.name)), ("creator", json!(user))],
                &[FieldPath::new(FIELD_WEIGHTS)],
            )
            .await?;

        match doc.as_ref().and_then(|d| d.get(FIELD_WEIGHTS)) {
            Some(raw) => {
                let mut weights = SparseVector::from_external(raw)?;
                weights.add_keys(self.features.iter().copied());
                Ok(weights)
            }
            None => {
                debug!("No model copy of {} for user {}, starting from shared weights", self.name, user);
                Ok(self.weights.clone())
            }
        }
    }

    /// Replace in-memory weights with the stored ones
    pub async fn pull_weights(&mut self, ctx: &Context) -> Result<()> {
        let doc = ctx
            .store
            .load_one_in_fields(ctx.models(), &self.id.to_string(), &[FieldPath::new(FIELD_WEIGHTS)])
            .await?
            .ok_or_else(|| MantisError::NotFound(format!("model {}", self.id)))?;
        self.weights = SparseVector::from_external(doc.get(FIELD_WEIGHTS).unwrap_or(&Value::Null))?;
        Ok(())
    }

    pub async fn push_weights(&self, ctx: &Context) -> Result<()> {
        self.write_fields(ctx, &[(FIELD_WEIGHTS, self.weights.to_external())]).await
    }

    /// Persist a consensus vector as this model's `z`
    pub async fn push_consensus(&self, ctx: &Context, z: &SparseVector) -> Result<()> {
        self.write_fields(ctx, &[(FIELD_Z, z.to_external())]).await
    }

    /// Persist the feature set together with `z`, whose keys cover it
    pub async fn push_features(&self, ctx: &Context) -> Result<()> {
        self.write_fields(
            ctx,
            &[
                (FIELD_FEATURES, json!(self.features)),
                (FIELD_Z, self.z.to_external()),
            ],
        )
        .await
    }

    async fn write_fields(&self, ctx: &Context, fields: &[(&str, Value)]) -> Result<()> {
        let updates: Vec<(FieldPath, Value)> = fields
            .iter()
            .map(|(field, value)| (FieldPath::new(*field), value.clone()))
            .collect();
        let written = ctx
            .store
            .update_one_in_fields(ctx.models(), &self.id.to_string(), &updates)
            .await?;
        if !written {
            let names: Vec<&str> = fields.iter().map(|(field, _)| *field).collect();
            warn!(
                "Model {} ({}) missing from store while writing {}",
                self.name,
                self.id,
                names.join(",")
            );
            return Err(MantisError::StoreWrite(format!(
                "model {} fields {}",
                self.id,
                names.join(",")
            )));
        }
        Ok(())
    }

    /// Probability that `features` belongs to the positive class
    pub fn predict(&self, features: &SparseVector) -> f64 {
        sigmoid(self.weights.dot(features))
    }
}

impl Record for Model {
    const TYPE_TAG: &'static str = "model";

    fn restore(document: &Value) -> Result<Self> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MantisError::InvalidDocument("model without id".to_string()))?;
        let name = document
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| MantisError::InvalidDocument(format!("model {} without name", id)))?;
        let creator = document
            .get("creator")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let features: BTreeSet<FeatureKey> = match document.get(FIELD_FEATURES) {
            Some(raw) if !raw.is_null() => serde_json::from_value(raw.clone())?,
            _ => BTreeSet::new(),
        };
        let null = Value::Null;
        let mut weights = SparseVector::from_external(document.get(FIELD_WEIGHTS).unwrap_or(&null))?;
        let mut z = SparseVector::from_external(document.get(FIELD_Z).unwrap_or(&null))?;
        weights.add_keys(features.iter().copied());
        z.add_keys(features.iter().copied());

        let mantis = match document.get(FIELD_MANTIS).and_then(Value::as_str) {
            Some(raw) => Some(RecordId::from_string(raw)?),
            None => None,
        };

        Ok(Self {
            id: RecordId::from_string(id)?,
            name: name.to_string(),
            creator: creator.to_string(),
            features,
            weights,
            z,
            mantis,
        })
    }

    fn to_document(&self) -> Value {
        json!({
            "id": self.id.to_string(),
            "name": self.name,
            "creator": self.creator,
            FIELD_FEATURES: self.features,
            FIELD_WEIGHTS: self.weights.to_external(),
            FIELD_Z: self.z.to_external(),
            FIELD_MANTIS: self.mantis.map(|id| id.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MantisConfig;
    use crate::storage::InMemoryDocumentStore;
    use std::sync::Arc;

    fn ctx() -> Context {
        Context::new(Arc::new(InMemoryDocumentStore::new()), MantisConfig::default())
    }

    #[test]
    fn test_document_round_trip() {
        let mut model = Model::new("spam", "alice");
        model.add_features([3, 1]);
        model.z.set(1, 0.5);
        model.mantis = Some(RecordId::new());

        let restored = Model::from_document(&model.to_tagged_document()).unwrap();
        assert_eq!(restored, model);
    }

    #[test]
    fn test_add_features_extends_vectors() {
        let mut model = Model::new("spam", "alice");
        model.weights.set(1, 2.0);
        model.add_features([1, 2]);

        assert_eq!(model.weights.get(1), 2.0);
        assert!(model.weights.contains_key(2));
        assert!(model.z.contains_key(1) && model.z.contains_key(2));
        assert_eq!(model.features.len(), 2);
    }

    #[test]
    fn test_predict_is_sigmoid_of_score() {
        let mut model = Model::new("spam", "alice");
        assert!((model.predict(&SparseVector::new()) - 0.5).abs() < 1e-12);

        model.weights.set(1, 10.0);
        let x: SparseVector = vec![(1, 1.0)].into();
        assert!(model.predict(&x) > 0.99);
    }

    #[tokio::test]
    async fn test_get_model_prefers_user_copy() {
        let ctx = ctx();
        let mut shared = Model::new("spam", "alice");
        shared.weights.set(1, 1.0);
        shared.insert(&ctx).await.unwrap();

        // bob has no copy yet
        let weights = shared.get_model(&ctx, "bob").await.unwrap();
        assert_eq!(weights.get(1), 1.0);

        let mut bob = shared.clone_for("bob");
        bob.weights.set(1, -3.0);
        bob.insert(&ctx).await.unwrap();

        let weights = shared.get_model(&ctx, "bob").await.unwrap();
        assert_eq!(weights.get(1), -3.0);

        let found = Model::find(&ctx, "spam", "bob").await.unwrap().unwrap();
        assert_eq!(found.id, bob.id);
    }

    #[tokio::test]
    async fn test_push_and_pull_weights() {
        let ctx = ctx();
        let mut model = Model::new("spam", "alice");
        model.insert(&ctx).await.unwrap();

        model.weights.set(4, 0.25);
        model.push_weights(&ctx).await.unwrap();
        model.weights.clear();
        model.pull_weights(&ctx).await.unwrap();

        assert_eq!(model.weights.get(4), 0.25);
    }

    #[tokio::test]
    async fn test_push_to_missing_model_fails() {
        let ctx = ctx();
        let model = Model::new("spam", "alice");
        let result = model.push_consensus(&ctx, &SparseVector::new()).await;
        assert!(matches!(result, Err(MantisError::StoreWrite(_))));
    }
}
