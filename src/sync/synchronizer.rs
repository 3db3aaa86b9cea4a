use std::sync::Arc;

use tracing::debug;

use crate::core::Document;
use crate::error::StoreResult;
use crate::store::{PutState, SyncOrigin};
use crate::sync::target::{SharedDatabase, SyncTarget};

/// The client-side sync driver: pushes local changes to a target and
/// ingests what the target sends back.
pub struct Synchronizer<T: SyncTarget> {
    source: SharedDatabase,
    target: T,
}

impl<T: SyncTarget> Synchronizer<T> {
    pub fn new(source: SharedDatabase, target: T) -> Self {
        Self { source, target }
    }

    /// Run one synchronization pass. Returns the target's post-exchange
    /// generation.
    pub async fn sync(&mut self) -> StoreResult<u64> {
        let source_uid = self.source.lock().replica_uid().to_string();
        let info = self.target.get_sync_info(&source_uid).await?;
        // The target's view of our history must actually be our history.
        self.source
            .lock()
            .validate_gen_and_trans_id(info.source_generation, &info.source_transaction_id)?;

        let (my_generation, changes) = {
            let db = self.source.lock();
            let (generation, _, changes) = db.whats_changed(info.source_generation);
            (generation, changes)
        };
        let (known_generation, _) = self
            .source
            .lock()
            .get_sync_gen_info(&info.target_replica_uid);
        if changes.is_empty() && known_generation == info.target_generation {
            debug!(peer = %info.target_replica_uid, "nothing to sync");
            return Ok(info.target_generation);
        }

        let docs_by_generation: Vec<(Document, u64, String)> = {
            let db = self.source.lock();
            let doc_ids: Vec<&str> = changes.iter().map(|(doc_id, _, _)| doc_id.as_str()).collect();
            db.get_docs(&doc_ids, false, true)
                .into_iter()
                .zip(&changes)
                .map(|(doc, (_, generation, trans_id))| (doc, *generation, trans_id.clone()))
                .collect()
        };
        debug!(
            peer = %info.target_replica_uid,
            sending = docs_by_generation.len(),
            "starting sync exchange"
        );

        let source = Arc::clone(&self.source);
        let target_uid = info.target_replica_uid.clone();
        let mut inserted: u64 = 0;
        let mut ingest = |mut doc: Document, generation: u64, trans_id: String| -> StoreResult<()> {
            let origin = SyncOrigin {
                replica_uid: &target_uid,
                generation,
                trans_id: &trans_id,
            };
            let (state, _) = source.lock().put_doc_if_newer(&mut doc, true, Some(origin))?;
            if state == PutState::Inserted {
                inserted += 1;
            }
            Ok(())
        };
        let (new_generation, new_transaction_id) = self
            .target
            .sync_exchange(
                docs_by_generation,
                &source_uid,
                known_generation,
                &mut ingest,
            )
            .await?;

        self.source.lock().set_sync_info(
            &info.target_replica_uid,
            new_generation,
            &new_transaction_id,
        );

        // Tell the target where we stand, but only when every generation
        // we gained came from a document the target itself returned; an
        // interleaved local write would make the reported generation one
        // the target has not seen, and with nothing pulled the
        // per-document recording during the exchange already covered us.
        let (current_generation, current_trans_id) = self.source.lock().generation_info();
        if inserted > 0 && current_generation == my_generation + inserted {
            self.target
                .record_sync_info(&source_uid, current_generation, &current_trans_id)
                .await?;
        }
        Ok(new_generation)
    }
}
