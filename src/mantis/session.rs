//! In-memory state of one live user
//!
//! A `UserSession` pairs the user's local solver with the map from entity id
//! to solver slot. The map and the solver's slots always describe the same
//! instances: slots are allocated densely from zero, reused for an entity
//! that is added again, and recycled through the eviction policy once the
//! solver holds `max_num_instances` of them.

use crate::error::{MantisError, Result};
use crate::mantis::eviction::EvictionPolicy;
use crate::solver::LocalSolver;
use crate::types::{user_data_to_external, Entity, EntityId, Instance, UserData};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

pub struct UserSession {
    pub(crate) solver: Box<dyn LocalSolver>,
    data: UserData,
}

impl UserSession {
    /// Fresh session with no training data
    pub fn new(solver: Box<dyn LocalSolver>) -> Self {
        Self {
            solver,
            data: UserData::new(),
        }
    }

    /// Rebuild a session from persisted data and the entities it references
    ///
    /// The solver's slot count becomes one past the highest stored slot so
    /// later additions never overwrite a restored instance.
    pub fn restore(
        mut solver: Box<dyn LocalSolver>,
        data: UserData,
        entities: &[Entity],
    ) -> Result<Self> {
        let by_id: HashMap<EntityId, &Entity> = entities.iter().map(|e| (e.id, e)).collect();

        for (id, instance) in &data {
            match by_id.get(id) {
                Some(entity) => {
                    solver.set_data(&entity.features, instance.label, instance.weight, instance.slot)?
                }
                None => warn!("Entity {} referenced by stored data is missing", id),
            }
        }

        let slots = data.values().map(|i| i.slot + 1).max().unwrap_or(0);
        solver.set_num_instances(slots);

        Ok(Self { solver, data })
    }

    pub fn data(&self) -> &UserData {
        &self.data
    }

    /// Persisted form of the training data
    pub fn data_to_external(&self) -> Value {
        user_data_to_external(&self.data)
    }

    /// Record a training instance, returning the slot it occupies
    pub fn add_instance(
        &mut self,
        entity: &Entity,
        label: f64,
        weight: f64,
        max_instances: usize,
        eviction: &dyn EvictionPolicy,
    ) -> Result<usize> {
        let num_instances = self.solver.num_instances();

        let (slot, victim) = if let Some(existing) = self.data.get(&entity.id) {
            (existing.slot, None)
        } else if num_instances < max_instances {
            (num_instances, None)
        } else {
            let victim = eviction.select_victim(&self.data).ok_or_else(|| {
                MantisError::Other(format!(
                    "solver full ({} instances) with nothing to evict",
                    num_instances
                ))
            })?;
            let slot = self.data[&victim].slot;
            (slot, Some(victim))
        };

        self.solver.set_data(&entity.features, label, weight, slot)?;

        if let Some(victim) = victim {
            debug!("Entity {} replaces {} in slot {}", entity.id, victim, slot);
            self.data.remove(&victim);
        } else if slot == num_instances {
            self.solver.set_num_instances(num_instances + 1);
        }
        self.data.insert(
            entity.id,
            Instance {
                slot,
                label,
                weight,
            },
        );

        Ok(slot)
    }
}
