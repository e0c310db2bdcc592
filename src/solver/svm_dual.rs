//! Dual coordinate descent solver for a consensus-regularized linear SVM
//!
//! Minimizes
//!
//! ```text
//! sum_i c_i * max(0, 1 - y_i w.x_i) + gamma/2 |w|^2 + rho/2 |w - (z - mu)|^2
//! ```
//!
//! The two quadratic terms combine into `(rho + gamma)/2 |w - r v|^2` with
//! `v = z - mu` and `r = rho / (rho + gamma)`, so the primal weights are
//! `w = r v + (1 / (rho + gamma)) sum_i alpha_i y_i x_i` with box constraints
//! `0 <= alpha_i <= c_i`.

use super::{LocalSolver, SolverBuilder, SolverInstance};
use crate::error::{MantisError, Result};
use crate::types::Hyperparameters;
use crate::vector::SparseVector;
use tracing::debug;

#[derive(Debug, Clone)]
struct Slot {
    features: SparseVector,
    label: f64,
    weight: f64,
    sq_norm: f64,
    alpha: f64,
}

/// Default local solver
#[derive(Debug, Clone)]
pub struct SvmDual {
    params: Hyperparameters,
    weights: SparseVector,
    target: SparseVector,
    slots: Vec<Option<Slot>>,
    num_instances: usize,
}

impl SvmDual {
    pub fn new(weights: SparseVector, params: &Hyperparameters) -> Result<Self> {
        if !(params.eps > 0.0) {
            return Err(MantisError::SolverInit(format!(
                "eps must be positive, got {}",
                params.eps
            )));
        }
        if !(params.rho > 0.0) || !(params.gamma >= 0.0) {
            return Err(MantisError::SolverInit(format!(
                "degenerate penalties rho={} gamma={}",
                params.rho, params.gamma
            )));
        }
        if params.max_num_instances == 0 {
            return Err(MantisError::SolverInit(
                "max_num_instances must be at least 1".to_string(),
            ));
        }
        if !weights.is_finite() {
            return Err(MantisError::SolverInit(
                "starting weights contain non-finite values".to_string(),
            ));
        }

        Ok(Self {
            params: *params,
            target: weights.clone(),
            weights,
            slots: Vec::new(),
            num_instances: 0,
        })
    }

    fn curvature(&self) -> f64 {
        self.params.rho + self.params.gamma
    }

    /// Recompute `w = r v + (1/s) sum alpha_i y_i x_i` from the duals
    fn rebuild_weights(&mut self) {
        let s = self.curvature();
        let mut w = SparseVector::new();
        w.add_keys(self.weights.keys());
        w.add(&self.target, self.params.mixing_ratio());
        for slot in self.slots.iter().flatten() {
            if slot.alpha != 0.0 {
                w.add(&slot.features, slot.alpha * slot.label / s);
            }
        }
        self.weights = w;
    }
}

impl LocalSolver for SvmDual {
    fn set_data(
        &mut self,
        features: &SparseVector,
        label: f64,
        weight: f64,
        slot: usize,
    ) -> Result<()> {
        if slot >= self.params.max_num_instances {
            return Err(MantisError::Other(format!(
                "slot {} out of range (max {})",
                slot, self.params.max_num_instances
            )));
        }
        if self.slots.len() <= slot {
            self.slots.resize(slot + 1, None);
        }

        let s = self.curvature();
        if let Some(previous) = self.slots[slot].take() {
            // retract the replaced instance's contribution
            if previous.alpha != 0.0 {
                self.weights
                    .add(&previous.features, -previous.alpha * previous.label / s);
            }
        }

        self.weights.add_keys(features.keys());
        self.slots[slot] = Some(Slot {
            features: features.clone(),
            label,
            weight,
            sq_norm: features.norm2(),
            alpha: 0.0,
        });
        Ok(())
    }

    fn set_model(&mut self, z: &SparseVector, mu: &SparseVector) {
        let mut target = z.clone();
        target.add(mu, -1.0);
        self.target = target;
        self.rebuild_weights();
    }

    fn train_model(&mut self) -> usize {
        let s = self.curvature();
        let mut passes = 0;

        for _ in 0..self.params.max_num_iters {
            passes += 1;
            let mut max_violation: f64 = 0.0;

            for index in 0..self.slots.len() {
                let Some(slot) = self.slots[index].as_ref() else {
                    continue;
                };
                if slot.sq_norm <= 0.0 || slot.weight <= 0.0 {
                    continue;
                }

                let gradient = slot.label * self.weights.dot(&slot.features) - 1.0;
                let projected = if slot.alpha <= 0.0 {
                    gradient.min(0.0)
                } else if slot.alpha >= slot.weight {
                    gradient.max(0.0)
                } else {
                    gradient
                };
                max_violation = max_violation.max(projected.abs());
                if projected.abs() <= self.params.eps {
                    continue;
                }

                let old_alpha = slot.alpha;
                let new_alpha = (old_alpha - gradient * s / slot.sq_norm).clamp(0.0, slot.weight);
                let delta = (new_alpha - old_alpha) * slot.label / s;
                let features = slot.features.clone();

                if let Some(slot) = self.slots[index].as_mut() {
                    slot.alpha = new_alpha;
                }
                self.weights.add(&features, delta);
            }

            if max_violation <= self.params.eps {
                break;
            }
        }

        debug!(
            "Local solve finished after {} passes over {} instances",
            passes, self.num_instances
        );
        passes
    }

    fn num_instances(&self) -> usize {
        self.num_instances
    }

    fn set_num_instances(&mut self, n: usize) {
        self.num_instances = n;
    }

    fn weights(&self) -> &SparseVector {
        &self.weights
    }

    fn instances(&self) -> Vec<SolverInstance> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref().map(|s| SolverInstance {
                    slot: index,
                    features: s.features.clone(),
                    label: s.label,
                    weight: s.weight,
                })
            })
            .collect()
    }
}

/// Builds `SvmDual` solvers
#[derive(Debug, Clone, Copy, Default)]
pub struct SvmDualBuilder;

impl SolverBuilder for SvmDualBuilder {
    fn build(
        &self,
        weights: SparseVector,
        params: &Hyperparameters,
    ) -> Result<Box<dyn LocalSolver>> {
        Ok(Box::new(SvmDual::new(weights, params)?))
    }
}
