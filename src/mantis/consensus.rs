//! ADMM consensus steps
//!
//! A round for one user is `train` (dual ascent, local solve, auxiliary
//! update) followed by `merge` of the resulting `dq` into the consensus
//! vector `z` and a `commit` of `mu`, `q` and `dq`.

use crate::error::{MantisError, Result};
use crate::mantis::manager::SessionManager;
use crate::mantis::record::FIELD_DQ;
use crate::model::FIELD_Z;
use crate::storage::FieldPath;
use crate::vector::SparseVector;
use serde_json::json;
use tracing::{debug, error, info, warn};

impl SessionManager {
    /// Consensus vector to train against
    ///
    /// With a leader, `z` is read from the leader's stored model of the same
    /// name; without one the in-memory `z` of this model is used.
    pub async fn checkout(&self, leader: Option<&str>) -> Result<SparseVector> {
        let Some(leader) = leader else {
            return Ok(self.model.read().await.z.clone());
        };

        let doc = self
            .ctx
            .store
            .find_one(
                self.ctx.models(),
                &[("name", json!(self.name)), ("creator", json!(leader))],
                &[FieldPath::new(FIELD_Z)],
            )
            .await?;
        match doc.as_ref().and_then(|d| d.get(FIELD_Z)) {
            Some(raw) => SparseVector::from_external(raw),
            None => {
                warn!("Leader {} has no model {} to check out", leader, self.name);
                Err(MantisError::NotFound(format!("model {} of {}", self.name, leader)))
            }
        }
    }

    /// One local ADMM step for a live user; returns the solver passes made
    pub async fn train(&self, user: &str, leader: Option<&str>) -> Result<usize> {
        let z = self.checkout(leader).await?;
        let r = self.params.mixing_ratio();

        self.with_consensus_session(user, |session, state| {
            // dual ascent
            state.mu.add(&state.q, 1.0);
            state.mu.add(&z, -1.0);

            session.solver.set_model(&z, &state.mu);
            let passes = session.solver.train_model();
            let w = session.solver.weights();

            state.dq = state.q.clone();
            state.q.clear();
            state.q.add(&z, r);
            state.q.add(w, 1.0 - r);
            state.q.add(&state.mu, -r);
            state.dq.add(&state.q, -1.0);

            debug!("Trained {} in {} passes, |dq|^2 = {}", user, passes, state.dq.norm2());
            passes
        })
        .await
    }

    /// Fold a user's `dq` into the consensus vector and persist it
    ///
    /// `m` is the number of users merged before this one in the round. The
    /// creator's own `dq` comes from memory; any other follower's is read
    /// from their stored record of the same model name.
    pub async fn merge(&self, follower: &str, m: usize) -> Result<()> {
        let dq = if follower == self.creator {
            self.consensus.lock().await.dq.clone()
        } else {
            self.follower_dq(follower).await?
        };

        let mut model = self.model.write().await;
        let mut z = model.z.clone();
        z.add(&dq, -1.0 / (m as f64 + 1.0 / self.params.rho));

        model.push_consensus(&self.ctx, &z).await.map_err(|e| {
            error!("Can not store consensus of model {}: {}", self.name, e);
            e
        })?;
        model.z = z;
        info!("Merged {} into model {} (m={})", follower, self.name, m);
        Ok(())
    }

    async fn follower_dq(&self, follower: &str) -> Result<SparseVector> {
        let doc = self
            .ctx
            .store
            .find_one(
                self.ctx.mantis(),
                &[("name", json!(self.name)), ("creator", json!(follower))],
                &[FieldPath::new(FIELD_DQ)],
            )
            .await?;
        match doc.as_ref().and_then(|d| d.get(FIELD_DQ)) {
            Some(raw) => SparseVector::from_external(raw),
            None => {
                warn!("Follower {} has no mantis record for {}", follower, self.name);
                Err(MantisError::NotFound(format!("mantis of {} for {}", self.name, follower)))
            }
        }
    }

    /// Persist the model's feature keys with `z`, then `mu`, `q` and `dq`
    pub async fn commit(&self) -> Result<()> {
        {
            let model = self.model.read().await;
            model.push_features(&self.ctx).await.map_err(|e| {
                error!("Can not store features of model {}: {}", self.name, e);
                e
            })?;
        }
        let state = self.consensus.lock().await;
        self.write_fields(&state.to_fields()).await
    }

    /// Zero `mu`, `q` and `dq` in the store, then in memory
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.consensus.lock().await;
        let mut cleared = state.clone();
        cleared.clear();
        self.write_fields(&cleared.to_fields()).await?;
        *state = cleared;
        info!("Reset consensus state of mantis {}", self.id);
        Ok(())
    }
}
