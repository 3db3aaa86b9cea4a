use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::core::Document;
use crate::error::StoreResult;
use crate::store::{Database, PutState, SyncOrigin};

/// A database handle shared between the sync machinery and its callers.
/// The lock is only held for individual operations, never across hooks or
/// network I/O.
pub type SharedDatabase = Arc<Mutex<Database>>;

pub fn shared(db: Database) -> SharedDatabase {
    Arc::new(Mutex::new(db))
}

/// A target's answer to `get_sync_info`: who it is, where its history
/// stands, and what it last saw from the asking replica.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncInfo {
    pub target_replica_uid: String,
    pub target_generation: u64,
    pub source_generation: u64,
    pub source_transaction_id: String,
}

/// Points inside `sync_exchange`/`record_sync_info` where tests may
/// interleave independent writes. Production targets ignore these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    BeforeWhatsChanged,
    AfterWhatsChanged,
    BeforeGetDocs,
    RecordSyncInfo,
}

pub type TraceHook = Box<dyn Fn(TraceState) + Send + Sync>;

/// Callback receiving each document streamed back from the target, with
/// the target generation and transaction id it was last changed at.
pub type ReturnDocFn<'a> = &'a mut (dyn FnMut(Document, u64, String) -> StoreResult<()> + Send);

/// The server-side half of synchronization.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    async fn get_sync_info(&self, source_replica_uid: &str) -> StoreResult<SyncInfo>;

    async fn record_sync_info(
        &self,
        source_replica_uid: &str,
        source_generation: u64,
        source_transaction_id: &str,
    ) -> StoreResult<()>;

    /// Ingest the source's changed documents, then stream back everything
    /// that changed locally after `last_known_generation` and was not part
    /// of the incoming batch. Returns the target generation the returned
    /// stream is consistent with, plus its transaction id.
    async fn sync_exchange(
        &self,
        docs_by_generation: Vec<(Document, u64, String)>,
        source_replica_uid: &str,
        last_known_generation: u64,
        return_doc_cb: ReturnDocFn<'_>,
    ) -> StoreResult<(u64, String)>;
}

/// One run of the exchange against a local database.
///
/// Tracks which incoming doc ids were taken (the seen set) so the return
/// leg does not echo them back; a doc ingested as `superseded` stays out of
/// the set because the newer local version must be bounced back.
pub struct SyncExchange {
    db: SharedDatabase,
    source_replica_uid: String,
    last_known_generation: u64,
    seen_ids: HashMap<String, u64>,
    changes_to_return: Vec<(String, u64, String)>,
    new_generation: u64,
    new_transaction_id: String,
}

impl SyncExchange {
    pub fn new(db: SharedDatabase, source_replica_uid: &str, last_known_generation: u64) -> Self {
        Self {
            db,
            source_replica_uid: source_replica_uid.to_string(),
            last_known_generation,
            seen_ids: HashMap::new(),
            changes_to_return: Vec::new(),
            new_generation: 0,
            new_transaction_id: String::new(),
        }
    }

    pub fn insert_doc_from_source(
        &mut self,
        doc: &mut Document,
        source_generation: u64,
        trans_id: &str,
    ) -> StoreResult<()> {
        let origin = SyncOrigin {
            replica_uid: &self.source_replica_uid,
            generation: source_generation,
            trans_id,
        };
        let (state, at_gen) = self.db.lock().put_doc_if_newer(doc, true, Some(origin))?;
        match state {
            PutState::Inserted | PutState::Converged => {
                self.seen_ids.insert(doc.doc_id.clone(), at_gen);
            }
            PutState::Superseded => {
                debug!(doc_id = %doc.doc_id, "incoming doc superseded; will bounce back");
            }
            PutState::Conflicted => {
                // The conflict is stored, but the current winner still goes
                // back so both replicas settle on the same revision.
                debug!(doc_id = %doc.doc_id, "incoming doc conflicted; returning winner");
            }
        }
        Ok(())
    }

    /// Figure out what the source is missing. Re-reads the generation
    /// under the lock, so writes interleaved before this point are
    /// included in the answer.
    pub fn find_changes_to_return(&mut self) -> (u64, String) {
        let (generation, trans_id, changes) =
            self.db.lock().whats_changed(self.last_known_generation);
        self.new_generation = generation;
        self.new_transaction_id = trans_id.clone();
        self.changes_to_return = changes
            .into_iter()
            .filter(|(doc_id, gen, _)| match self.seen_ids.get(doc_id) {
                Some(seen_gen) => seen_gen < gen,
                None => true,
            })
            .collect();
        (generation, trans_id)
    }

    pub fn return_docs(&self, return_doc_cb: ReturnDocFn<'_>) -> StoreResult<()> {
        let doc_ids: Vec<&str> = self
            .changes_to_return
            .iter()
            .map(|(doc_id, _, _)| doc_id.as_str())
            .collect();
        let docs = self.db.lock().get_docs(&doc_ids, false, true);
        for (doc, (_, generation, trans_id)) in docs.into_iter().zip(&self.changes_to_return) {
            return_doc_cb(doc, *generation, trans_id.clone())?;
        }
        Ok(())
    }
}

/// A sync target working directly against an in-process database.
pub struct LocalSyncTarget {
    db: SharedDatabase,
    trace_hook: Option<TraceHook>,
}

impl LocalSyncTarget {
    pub fn new(db: SharedDatabase) -> Self {
        Self {
            db,
            trace_hook: None,
        }
    }

    /// Install a test hook; called with the lock released so the hook may
    /// write to the same database.
    pub fn set_trace_hook(&mut self, hook: impl Fn(TraceState) + Send + Sync + 'static) {
        self.trace_hook = Some(Box::new(hook));
    }

    fn trace(&self, state: TraceState) {
        if let Some(hook) = &self.trace_hook {
            hook(state);
        }
    }
}

#[async_trait]
impl SyncTarget for LocalSyncTarget {
    async fn get_sync_info(&self, source_replica_uid: &str) -> StoreResult<SyncInfo> {
        let db = self.db.lock();
        let (source_generation, source_transaction_id) = db.get_sync_gen_info(source_replica_uid);
        Ok(SyncInfo {
            target_replica_uid: db.replica_uid().to_string(),
            target_generation: db.generation(),
            source_generation,
            source_transaction_id,
        })
    }

    async fn record_sync_info(
        &self,
        source_replica_uid: &str,
        source_generation: u64,
        source_transaction_id: &str,
    ) -> StoreResult<()> {
        self.trace(TraceState::RecordSyncInfo);
        self.db
            .lock()
            .set_sync_info(source_replica_uid, source_generation, source_transaction_id);
        Ok(())
    }

    async fn sync_exchange(
        &self,
        docs_by_generation: Vec<(Document, u64, String)>,
        source_replica_uid: &str,
        last_known_generation: u64,
        return_doc_cb: ReturnDocFn<'_>,
    ) -> StoreResult<(u64, String)> {
        let mut exchange = SyncExchange::new(
            Arc::clone(&self.db),
            source_replica_uid,
            last_known_generation,
        );
        for (mut doc, generation, trans_id) in docs_by_generation {
            exchange.insert_doc_from_source(&mut doc, generation, &trans_id)?;
        }
        self.trace(TraceState::BeforeWhatsChanged);
        let (new_generation, new_transaction_id) = exchange.find_changes_to_return();
        self.trace(TraceState::AfterWhatsChanged);
        self.trace(TraceState::BeforeGetDocs);
        exchange.return_docs(return_doc_cb)?;
        Ok((new_generation, new_transaction_id))
    }
}
