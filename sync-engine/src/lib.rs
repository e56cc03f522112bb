//! Eddie Chat - mail sync core
//!
//! Connection pooling and sync orchestration for a local-first mail
//! client. The embedding application supplies the protocol client, the
//! credential store, the local database and the UI event bus through the
//! traits in `adapters/` and `events`.
//!
//! ## Module Organization
//!
//! - `adapters/`: Collaborator seams (sessions, credentials, store, connectivity)
//! - `config/`: Configuration management
//! - `events`: Signals emitted to the UI layer
//! - `pool/`: Per-account connection pool
//! - `state/`: Engine state management
//! - `sync/`: Orchestrator, scheduler, push listener, actions, sleep/wake
//! - `types/`: Data structures and errors

pub mod adapters;
pub mod config;
pub mod events;
pub mod logging;
pub mod pool;
pub mod state;
pub mod sync;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{AccountConfig, EngineConfig};
pub use events::{EventSink, SyncEvent};
pub use pool::{ConnectionPool, PooledConnection};
pub use state::SyncManager;
pub use sync::orchestrator::{SyncOrchestrator, SyncOutcome};
pub use types::error::{Result, SyncError};
