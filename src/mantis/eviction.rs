//! Instance eviction when a user's solver is full

use crate::types::{EntityId, UserData};
use rand::seq::IteratorRandom;

/// Chooses which stored entity gives up its solver slot
pub trait EvictionPolicy: Send + Sync {
    fn select_victim(&self, data: &UserData) -> Option<EntityId>;
}

/// Uniformly random replacement
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomEviction;

impl EvictionPolicy for RandomEviction {
    fn select_victim(&self, data: &UserData) -> Option<EntityId> {
        data.keys().choose(&mut rand::thread_rng()).copied()
    }
}
