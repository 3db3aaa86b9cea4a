use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::store::Database;
use crate::sync::target::{shared, SharedDatabase};

/// The set of named databases served by one process.
#[derive(Clone, Default)]
pub struct ServerState {
    databases: Arc<RwLock<HashMap<String, SharedDatabase>>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(&self, name: &str) -> Option<SharedDatabase> {
        self.databases.read().get(name).cloned()
    }

    /// Fetch a database, creating it (with a fresh replica uid) on first
    /// use.
    pub fn ensure_database(&self, name: &str) -> SharedDatabase {
        let mut databases = self.databases.write();
        databases
            .entry(name.to_string())
            .or_insert_with(|| shared(Database::new(None)))
            .clone()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }
}
