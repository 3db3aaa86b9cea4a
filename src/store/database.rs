use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::core::{check_doc_id, Document, VectorClockRev};
use crate::error::{StoreError, StoreResult};
use crate::events::{DocChanged, ObserverRegistry};
use crate::store::indexes::IndexRegistry;

/// One stored version of a document: revision plus content (None = tombstone).
#[derive(Debug, Clone, PartialEq)]
struct StoredDoc {
    rev: String,
    content: Option<Value>,
}

impl StoredDoc {
    fn to_document(&self, doc_id: &str, has_conflicts: bool) -> Document {
        Document {
            doc_id: doc_id.to_string(),
            rev: self.rev.clone(),
            content: self.content.clone(),
            has_conflicts,
        }
    }
}

/// State of one doc id: a single live version, or a conflict set. All
/// members of a conflict set are mutually incomparable; the winner is the
/// member with the greatest rev string, so every replica picks the same one.
enum DocState {
    Live(StoredDoc),
    Conflicted {
        winner: StoredDoc,
        losers: Vec<StoredDoc>,
    },
}

impl DocState {
    fn winner(&self) -> &StoredDoc {
        match self {
            DocState::Live(doc) => doc,
            DocState::Conflicted { winner, .. } => winner,
        }
    }

    fn has_conflicts(&self) -> bool {
        matches!(self, DocState::Conflicted { .. })
    }
}

/// Outcome of the `put_doc_if_newer` decision procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutState {
    /// The document was newer than anything stored and was committed.
    Inserted,
    /// The store already had this or something newer (or the incoming
    /// revision was absorbed while autoresolving).
    Superseded,
    /// The exact revision was already present.
    Converged,
    /// The revisions are incomparable.
    Conflicted,
}

/// Provenance of a document received during synchronization.
#[derive(Debug, Clone, Copy)]
pub struct SyncOrigin<'a> {
    pub replica_uid: &'a str,
    pub generation: u64,
    pub trans_id: &'a str,
}

enum SourceCheck {
    Ok,
    Superseded,
}

/// A single replica of the document store.
///
/// Holds the logical tables of the storage layout: the document table, the
/// transaction log, the conflict sets, the sync-info table, and the
/// secondary indexes. All mutations run through this struct serially.
pub struct Database {
    replica_uid: String,
    docs: BTreeMap<String, DocState>,
    transaction_log: Vec<(String, String)>,
    sync_info: HashMap<String, (u64, String)>,
    indexes: IndexRegistry,
    observers: ObserverRegistry,
}

impl Database {
    pub fn new(replica_uid: Option<&str>) -> Self {
        let replica_uid = replica_uid
            .map(|uid| uid.to_string())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        Self {
            replica_uid,
            docs: BTreeMap::new(),
            transaction_log: Vec::new(),
            sync_info: HashMap::new(),
            indexes: IndexRegistry::new(),
            observers: ObserverRegistry::new(),
        }
    }

    pub fn replica_uid(&self) -> &str {
        &self.replica_uid
    }

    /// The number of locally visible changes so far.
    pub fn generation(&self) -> u64 {
        self.transaction_log.len() as u64
    }

    /// Current generation and the transaction id it corresponds to.
    pub fn generation_info(&self) -> (u64, String) {
        match self.transaction_log.last() {
            Some((_, trans_id)) => (self.generation(), trans_id.clone()),
            None => (0, String::new()),
        }
    }

    pub fn subscribe(&mut self, observer: impl Fn(&DocChanged) + Send + Sync + 'static) {
        self.observers.subscribe(observer);
    }

    fn allocate_doc_id() -> String {
        format!("D-{}", Uuid::new_v4().simple())
    }

    fn allocate_transaction_id() -> String {
        format!("T-{}", Uuid::new_v4().simple())
    }

    fn allocate_doc_rev(&self, old_rev: &str) -> StoreResult<String> {
        let mut vcr = VectorClockRev::parse(old_rev)?;
        vcr.increment(&self.replica_uid);
        Ok(vcr.as_str())
    }

    /// Write a document (winner plus any remaining conflict losers),
    /// rewrite its index rows, log the transaction, and notify observers.
    fn commit(&mut self, doc_id: &str, winner: StoredDoc, losers: Vec<StoredDoc>) {
        self.indexes.update_doc(doc_id, winner.content.as_ref());
        let new_rev = winner.rev.clone();
        let state = if losers.is_empty() {
            DocState::Live(winner)
        } else {
            DocState::Conflicted { winner, losers }
        };
        self.docs.insert(doc_id.to_string(), state);
        self.transaction_log
            .push((doc_id.to_string(), Self::allocate_transaction_id()));
        self.observers.notify(&DocChanged {
            doc_id: doc_id.to_string(),
            new_rev,
        });
    }

    // ------------------------------------------------------------------
    // Document CRUD
    // ------------------------------------------------------------------

    /// Create a document, allocating a doc id when none is given.
    pub fn create_doc(&mut self, content: Value, doc_id: Option<String>) -> StoreResult<Document> {
        let doc_id = match doc_id {
            Some(id) => id,
            None => Self::allocate_doc_id(),
        };
        let mut doc = Document::new(doc_id, "", Some(content));
        self.put_doc(&mut doc)?;
        Ok(doc)
    }

    /// Store a new version of a document. The caller's revision must match
    /// the stored one; the document gets a fresh revision on success.
    pub fn put_doc(&mut self, doc: &mut Document) -> StoreResult<String> {
        check_doc_id(&doc.doc_id)?;
        let (old, conflicted) = match self.docs.get(&doc.doc_id) {
            Some(state) => (Some(state.winner().clone()), state.has_conflicts()),
            None => (None, false),
        };
        if conflicted {
            return Err(StoreError::ConflictedDoc);
        }
        let new_rev = match &old {
            // Putting with no revision over a tombstone resurrects the doc.
            Some(old) if old.content.is_none() && doc.rev.is_empty() => {
                self.allocate_doc_rev(&old.rev)?
            }
            Some(old) => {
                if old.rev != doc.rev {
                    return Err(StoreError::RevisionConflict);
                }
                self.allocate_doc_rev(&doc.rev)?
            }
            None => {
                if !doc.rev.is_empty() {
                    return Err(StoreError::RevisionConflict);
                }
                self.allocate_doc_rev("")?
            }
        };
        doc.rev = new_rev.clone();
        let stored = StoredDoc {
            rev: new_rev.clone(),
            content: doc.content.clone(),
        };
        self.commit(&doc.doc_id, stored, Vec::new());
        Ok(new_rev)
    }

    /// Fetch a document. Tombstones are only returned with `include_deleted`.
    pub fn get_doc(&self, doc_id: &str, include_deleted: bool) -> Option<Document> {
        let state = self.docs.get(doc_id)?;
        let winner = state.winner();
        if winner.content.is_none() && !include_deleted {
            return None;
        }
        Some(winner.to_document(doc_id, state.has_conflicts()))
    }

    /// Fetch several documents in request order. Missing ids are skipped,
    /// as are tombstones unless `include_deleted`.
    pub fn get_docs(
        &self,
        doc_ids: &[&str],
        check_for_conflicts: bool,
        include_deleted: bool,
    ) -> Vec<Document> {
        doc_ids
            .iter()
            .filter_map(|doc_id| {
                let state = self.docs.get(*doc_id)?;
                let winner = state.winner();
                if winner.content.is_none() && !include_deleted {
                    return None;
                }
                let has_conflicts = check_for_conflicts && state.has_conflicts();
                Some(winner.to_document(doc_id, has_conflicts))
            })
            .collect()
    }

    /// All documents plus the generation they are consistent with.
    pub fn get_all_docs(&self, include_deleted: bool) -> (u64, Vec<Document>) {
        let docs = self
            .docs
            .iter()
            .filter_map(|(doc_id, state)| {
                let winner = state.winner();
                if winner.content.is_none() && !include_deleted {
                    return None;
                }
                Some(winner.to_document(doc_id, state.has_conflicts()))
            })
            .collect();
        (self.generation(), docs)
    }

    /// Turn a document into a tombstone. The tombstone keeps a fresh
    /// revision so the deletion propagates through sync.
    pub fn delete_doc(&mut self, doc: &mut Document) -> StoreResult<String> {
        let (old, conflicted) = match self.docs.get(&doc.doc_id) {
            Some(state) => (state.winner().clone(), state.has_conflicts()),
            None => return Err(StoreError::DocumentDoesNotExist),
        };
        if conflicted {
            return Err(StoreError::ConflictedDoc);
        }
        if old.content.is_none() {
            return Err(StoreError::DocumentAlreadyDeleted);
        }
        if old.rev != doc.rev {
            return Err(StoreError::RevisionConflict);
        }
        let new_rev = self.allocate_doc_rev(&doc.rev)?;
        doc.rev = new_rev.clone();
        doc.content = None;
        let stored = StoredDoc {
            rev: new_rev.clone(),
            content: None,
        };
        self.commit(&doc.doc_id, stored, Vec::new());
        Ok(new_rev)
    }

    // ------------------------------------------------------------------
    // Transaction log and sync info
    // ------------------------------------------------------------------

    /// Which documents changed after `old_generation`: the latest
    /// `(doc_id, generation, transaction_id)` per document, ascending by
    /// generation, plus the current generation info.
    pub fn whats_changed(&self, old_generation: u64) -> (u64, String, Vec<(String, u64, String)>) {
        let (generation, trans_id) = self.generation_info();
        let mut latest: HashMap<&str, usize> = HashMap::new();
        for (idx, (doc_id, _)) in self.transaction_log.iter().enumerate() {
            latest.insert(doc_id, idx);
        }
        let mut changes: Vec<(String, u64, String)> = latest
            .into_iter()
            .filter(|(_, idx)| (*idx as u64 + 1) > old_generation)
            .map(|(doc_id, idx)| {
                (
                    doc_id.to_string(),
                    idx as u64 + 1,
                    self.transaction_log[idx].1.clone(),
                )
            })
            .collect();
        changes.sort_by_key(|(_, generation, _)| *generation);
        (generation, trans_id, changes)
    }

    /// Check that `generation` exists locally and carried `trans_id`.
    /// Detects rewound or forked histories claimed by a peer.
    pub fn validate_gen_and_trans_id(&self, generation: u64, trans_id: &str) -> StoreResult<()> {
        if generation == 0 {
            return Ok(());
        }
        match self.transaction_log.get(generation as usize - 1) {
            None => Err(StoreError::InvalidGeneration),
            Some((_, stored)) if stored == trans_id => Ok(()),
            Some(_) => Err(StoreError::InvalidTransactionId),
        }
    }

    /// The highest generation we have accepted from a peer, with its
    /// transaction id.
    pub fn get_sync_gen_info(&self, other_replica_uid: &str) -> (u64, String) {
        self.sync_info
            .get(other_replica_uid)
            .cloned()
            .unwrap_or((0, String::new()))
    }

    pub fn set_sync_info(&mut self, other_replica_uid: &str, generation: u64, trans_id: &str) {
        self.sync_info.insert(
            other_replica_uid.to_string(),
            (generation, trans_id.to_string()),
        );
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// All revisions in a document's conflict set: the winner first, then
    /// the losers, newest first. Empty when the document is unconflicted.
    pub fn get_doc_conflicts(&self, doc_id: &str) -> Vec<Document> {
        match self.docs.get(doc_id) {
            Some(DocState::Conflicted { winner, losers }) => {
                let mut docs = vec![winner.to_document(doc_id, true)];
                docs.extend(losers.iter().map(|loser| loser.to_document(doc_id, true)));
                docs
            }
            _ => Vec::new(),
        }
    }

    /// Replace a conflict set with a resolution. `conflicted_doc_revs`
    /// lists the revisions the resolution supersedes; revisions not listed
    /// stay conflicted. Resolving an already-resolved document is a no-op.
    pub fn resolve_doc(
        &mut self,
        doc: &mut Document,
        conflicted_doc_revs: &[String],
    ) -> StoreResult<()> {
        check_doc_id(&doc.doc_id)?;
        let (cur_winner, losers) = match self.docs.get(&doc.doc_id) {
            Some(DocState::Live(stored)) => (Some(stored.clone()), Vec::new()),
            Some(DocState::Conflicted { winner, losers }) => {
                (Some(winner.clone()), losers.clone())
            }
            None => (None, Vec::new()),
        };
        let superseded: HashSet<&str> = conflicted_doc_revs.iter().map(|r| r.as_str()).collect();
        let cur_rev = cur_winner.as_ref().map(|d| d.rev.as_str()).unwrap_or("");
        if losers.is_empty() && !superseded.contains(cur_rev) {
            doc.has_conflicts = false;
            return Ok(());
        }
        let new_rev = self.ensure_maximal_rev(cur_rev, conflicted_doc_revs)?;
        let remaining: Vec<StoredDoc> = losers
            .into_iter()
            .filter(|loser| !superseded.contains(loser.rev.as_str()))
            .collect();
        doc.rev = new_rev.clone();
        let resolution = StoredDoc {
            rev: new_rev,
            content: doc.content.clone(),
        };
        if superseded.contains(cur_rev) {
            doc.has_conflicts = !remaining.is_empty();
            self.commit(&doc.doc_id, resolution, remaining);
        } else if let Some(winner) = cur_winner {
            // The resolution does not cover the current winner; it joins
            // the conflict set instead of replacing the stored document.
            let mut new_losers = vec![resolution];
            new_losers.extend(remaining);
            self.docs.insert(
                doc.doc_id.clone(),
                DocState::Conflicted {
                    winner,
                    losers: new_losers,
                },
            );
            doc.has_conflicts = true;
        }
        Ok(())
    }

    fn ensure_maximal_rev(&self, cur_rev: &str, extra_revs: &[String]) -> StoreResult<String> {
        let mut vcr = VectorClockRev::parse(cur_rev)?;
        for rev in extra_revs {
            vcr.maximize(&VectorClockRev::parse(rev)?);
        }
        vcr.increment(&self.replica_uid);
        Ok(vcr.as_str())
    }

    /// Drop from the conflict set every revision the incoming document
    /// dominates. A loser carrying identical content is absorbed instead:
    /// the clocks merge, the local counter bumps, and the document's
    /// revision is rewritten (autoresolve).
    fn prune_conflicts(
        &mut self,
        doc: &mut Document,
        doc_vcr: &mut VectorClockRev,
    ) -> StoreResult<Vec<StoredDoc>> {
        let losers = match self.docs.get(&doc.doc_id) {
            Some(DocState::Conflicted { losers, .. }) => losers.clone(),
            _ => return Ok(Vec::new()),
        };
        let mut autoresolved = false;
        let mut remaining = Vec::new();
        for loser in losers {
            let loser_vcr = VectorClockRev::parse(&loser.rev)?;
            if doc_vcr.is_newer(&loser_vcr) {
                continue;
            }
            if doc.content == loser.content {
                doc_vcr.maximize(&loser_vcr);
                autoresolved = true;
                continue;
            }
            remaining.push(loser);
        }
        if autoresolved {
            doc_vcr.increment(&self.replica_uid);
            doc.rev = doc_vcr.as_str();
        }
        Ok(remaining)
    }

    /// Record an incoming incomparable revision as a conflict. The winner
    /// of the resulting set is the member with the greatest rev string.
    fn force_doc_sync_conflict(
        &mut self,
        doc: &mut Document,
        cur: StoredDoc,
    ) -> StoreResult<()> {
        let mut doc_vcr = VectorClockRev::parse(&doc.rev)?;
        let remaining = self.prune_conflicts(doc, &mut doc_vcr)?;
        let mut set = vec![
            StoredDoc {
                rev: doc.rev.clone(),
                content: doc.content.clone(),
            },
            cur,
        ];
        set.extend(remaining);
        let winner_idx = set
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.rev.cmp(&b.rev))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        let winner = set.remove(winner_idx);
        self.commit(&doc.doc_id, winner, set);
        doc.has_conflicts = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync decision procedure
    // ------------------------------------------------------------------

    fn validate_source(
        &self,
        origin: &SyncOrigin<'_>,
        cur_vcr: &VectorClockRev,
        doc_vcr: &VectorClockRev,
    ) -> StoreResult<SourceCheck> {
        let (old_generation, old_trans_id) = self.get_sync_gen_info(origin.replica_uid);
        if origin.generation < old_generation {
            if cur_vcr.is_newer(doc_vcr) {
                return Ok(SourceCheck::Superseded);
            }
            return Err(StoreError::InvalidGeneration);
        }
        if origin.generation > old_generation {
            return Ok(SourceCheck::Ok);
        }
        if origin.trans_id == old_trans_id {
            Ok(SourceCheck::Superseded)
        } else {
            Err(StoreError::InvalidTransactionId)
        }
    }

    /// Decide what to do with a document revision coming from elsewhere.
    ///
    /// Returns the decision plus the generation after any side effects.
    /// When `source` is given, sync progress is recorded for every decided
    /// state, including dropped conflicts, so the same revision is not
    /// received again.
    pub fn put_doc_if_newer(
        &mut self,
        doc: &mut Document,
        save_conflict: bool,
        source: Option<SyncOrigin<'_>>,
    ) -> StoreResult<(PutState, u64)> {
        let cur = self.docs.get(&doc.doc_id).map(|s| s.winner().clone());
        let mut doc_vcr = VectorClockRev::parse(&doc.rev)?;
        let cur_rev = cur.as_ref().map(|c| c.rev.as_str()).unwrap_or("");
        let cur_vcr = VectorClockRev::parse(cur_rev)?;
        if let Some(origin) = &source {
            if let SourceCheck::Superseded = self.validate_source(origin, &cur_vcr, &doc_vcr)? {
                return Ok((PutState::Superseded, self.generation()));
            }
        }
        let state = if doc_vcr.is_newer(&cur_vcr) {
            let rev_before = doc.rev.clone();
            let losers = self.prune_conflicts(doc, &mut doc_vcr)?;
            let state = if doc.rev == rev_before {
                PutState::Inserted
            } else {
                // Prior conflicts were autoresolved against this revision.
                PutState::Superseded
            };
            doc.has_conflicts = !losers.is_empty();
            let stored = StoredDoc {
                rev: doc.rev.clone(),
                content: doc.content.clone(),
            };
            self.commit(&doc.doc_id, stored, losers);
            state
        } else if doc.rev == cur_rev {
            PutState::Converged
        } else if cur_vcr.is_newer(&doc_vcr) {
            // We hold something newer; the peer learns about it on the
            // return leg of the exchange.
            PutState::Superseded
        } else if cur
            .as_ref()
            .map_or(false, |c| c.content == doc.content)
        {
            // Both sides made the same edit; merge the clocks instead of
            // recording a conflict.
            doc_vcr.maximize(&cur_vcr);
            doc_vcr.increment(&self.replica_uid);
            doc.rev = doc_vcr.as_str();
            let losers = match self.docs.get(&doc.doc_id) {
                Some(DocState::Conflicted { losers, .. }) => losers.clone(),
                _ => Vec::new(),
            };
            doc.has_conflicts = !losers.is_empty();
            let stored = StoredDoc {
                rev: doc.rev.clone(),
                content: doc.content.clone(),
            };
            self.commit(&doc.doc_id, stored, losers);
            PutState::Superseded
        } else {
            if save_conflict {
                if let Some(cur) = cur {
                    self.force_doc_sync_conflict(doc, cur)?;
                }
            }
            PutState::Conflicted
        };
        debug!(
            doc_id = %doc.doc_id,
            state = ?state,
            "put_doc_if_newer decided"
        );
        if let Some(origin) = source {
            self.set_sync_info(origin.replica_uid, origin.generation, origin.trans_id);
        }
        Ok((state, self.generation()))
    }

    // ------------------------------------------------------------------
    // Index surface
    // ------------------------------------------------------------------

    pub fn create_index(&mut self, name: &str, expressions: &[&str]) -> StoreResult<()> {
        let docs = &self.docs;
        self.indexes.create(
            name,
            expressions,
            docs.iter()
                .filter_map(|(doc_id, state)| {
                    state.winner().content.as_ref().map(|content| (doc_id, content))
                }),
        )
    }

    pub fn delete_index(&mut self, name: &str) -> StoreResult<()> {
        self.indexes.delete(name)
    }

    pub fn list_indexes(&self) -> Vec<(String, Vec<String>)> {
        self.indexes.list()
    }

    pub fn get_index_keys(&self, name: &str) -> StoreResult<Vec<Vec<String>>> {
        self.indexes.keys(name)
    }

    pub fn get_from_index(&self, name: &str, values: &[&str]) -> StoreResult<Vec<Document>> {
        let doc_ids = self.indexes.query(name, values)?;
        Ok(doc_ids
            .iter()
            .filter_map(|doc_id| self.get_doc(doc_id, false))
            .collect())
    }

    pub fn get_range_from_index(
        &self,
        name: &str,
        start: Option<&[&str]>,
        end: Option<&[&str]>,
    ) -> StoreResult<Vec<Document>> {
        let doc_ids = self.indexes.range(name, start, end)?;
        Ok(doc_ids
            .iter()
            .filter_map(|doc_id| self.get_doc(doc_id, false))
            .collect())
    }

    /// Test-support view of the transaction log.
    pub fn transaction_log(&self) -> Vec<(String, String)> {
        self.transaction_log.clone()
    }
}
