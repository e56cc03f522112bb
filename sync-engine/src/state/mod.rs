//! Engine state management
//!
//! Long-lived, thread-safe state that wires the sync components together
//! for the embedding application.

mod sync_manager;

pub use sync_manager::SyncManager;
