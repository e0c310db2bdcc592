//! Local solvers
//!
//! A local solver holds one user's training instances in a bounded set of
//! slots and fits model weights towards an ADMM target. The session manager
//! only talks to the `LocalSolver` trait; `SolverBuilder` is the seam where a
//! different solver can be plugged in through the `Context`.

pub mod svm_dual;

use crate::error::Result;
use crate::types::Hyperparameters;
use crate::vector::SparseVector;

pub use svm_dual::{SvmDual, SvmDualBuilder};

/// Read-only view of one occupied solver slot
#[derive(Debug, Clone, PartialEq)]
pub struct SolverInstance {
    pub slot: usize,
    pub features: SparseVector,
    pub label: f64,
    pub weight: f64,
}

/// Per-user optimizer
pub trait LocalSolver: Send + Sync {
    /// Store a training instance at `slot`, replacing whatever was there
    fn set_data(
        &mut self,
        features: &SparseVector,
        label: f64,
        weight: f64,
        slot: usize,
    ) -> Result<()>;

    /// Set the consensus target `z` and the dual offset `mu` for the next fit
    fn set_model(&mut self, z: &SparseVector, mu: &SparseVector);

    /// Run the bounded local solve; returns the number of passes made
    fn train_model(&mut self) -> usize;

    /// Number of allocated slots
    fn num_instances(&self) -> usize;

    fn set_num_instances(&mut self, n: usize);

    /// Current fitted weights
    fn weights(&self) -> &SparseVector;

    /// Occupied slots in slot order
    fn instances(&self) -> Vec<SolverInstance>;
}

/// Constructs solvers from starting weights and hyperparameters
#[cfg_attr(test, mockall::automock)]
pub trait SolverBuilder: Send + Sync {
    fn build(&self, weights: SparseVector, params: &Hyperparameters)
        -> Result<Box<dyn LocalSolver>>;
}
