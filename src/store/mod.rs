// Storage core: the per-replica document database and its indexes.

pub mod database;
pub mod indexes;

pub use database::{Database, PutState, SyncOrigin};
