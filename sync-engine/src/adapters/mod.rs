//! Collaborator seams: sessions, credentials, local store, connectivity

pub mod connectivity;
pub mod credentials;
pub mod memory_store;
pub mod session;
pub mod store;
