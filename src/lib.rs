// syncdoc - a syncable JSON document store with revision tracking,
// secondary indexes, and replica-to-replica synchronization.

// Core types and primitives
pub mod core;

// Storage core and index subsystem
pub mod query;
pub mod store;

// Replica synchronization and its HTTP adapter
pub mod remote;
pub mod sync;

// Server wiring
pub mod app_state;
pub mod config;

// Common utilities
pub mod error;
pub mod events;

// Re-exports for convenience
pub use crate::core::{check_doc_id, Document, VectorClockRev};
pub use error::{StoreError, StoreResult};
pub use events::DocChanged;
pub use store::{Database, PutState, SyncOrigin};
pub use sync::{shared, LocalSyncTarget, SharedDatabase, Synchronizer, SyncTarget, TraceState};
