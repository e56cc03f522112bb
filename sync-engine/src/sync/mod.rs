//! Sync coordination
//!
//! The orchestrator owns header/body generations per scope; the scheduler
//! and the push listener only decide *when* to ask it for one.

pub mod actions;
pub mod folder;
pub mod idle;
pub mod orchestrator;
pub mod power;
pub mod registry;
pub mod retry;
pub mod scheduler;
