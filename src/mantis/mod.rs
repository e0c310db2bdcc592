//! Optimizer session management
//!
//! A `SessionManager` owns one mantis record: the ADMM state shared by all
//! users training a model, plus the live per-user sessions.

mod consensus;
pub mod eviction;
mod manager;
pub mod record;
pub mod session;

pub use eviction::{EvictionPolicy, RandomEviction};
pub use manager::SessionManager;
pub use record::{ConsensusVectors, MantisRecord, GAMMA_OVERRIDE, MIN_PENALTY};
pub use session::UserSession;
