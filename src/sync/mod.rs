// Replica-to-replica synchronization: the target contract and the driver.

pub mod synchronizer;
pub mod target;

pub use synchronizer::Synchronizer;
pub use target::{
    shared, LocalSyncTarget, SharedDatabase, SyncExchange, SyncInfo, SyncTarget, TraceState,
};
