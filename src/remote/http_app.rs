use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::app_state::ServerState;
use crate::core::Document;
use crate::error::{StoreError, StoreResult};
use crate::remote::stream::{
    parse_sync_stream, StreamDocEntry, SyncStreamWriter, SYNC_STREAM_CONTENT_TYPE,
};
use crate::sync::target::{SharedDatabase, SyncExchange};

/// Build the HTTP surface over a set of named databases:
/// database info and creation, document access, and the three
/// `sync-from` endpoints of the sync-target contract.
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/{db}", get(database_info).put(put_database))
        .route(
            "/{db}/doc/{doc_id}",
            get(get_doc).put(put_doc).delete(delete_doc),
        )
        .route(
            "/{db}/sync-from/{source}",
            get(get_sync_info)
                .put(record_sync_info)
                .post(sync_exchange),
        )
        .with_state(state)
}

fn lookup(state: &ServerState, name: &str) -> StoreResult<SharedDatabase> {
    state
        .database(name)
        .ok_or_else(|| StoreError::DatabaseDoesNotExist(name.to_string()))
}

async fn database_info(
    Path(db_name): Path<String>,
    State(state): State<ServerState>,
) -> StoreResult<Json<Value>> {
    let db = lookup(&state, &db_name)?;
    let replica_uid = db.lock().replica_uid().to_string();
    Ok(Json(json!({"database": db_name, "replica_uid": replica_uid})))
}

async fn put_database(
    Path(db_name): Path<String>,
    State(state): State<ServerState>,
) -> StoreResult<Json<Value>> {
    state.ensure_database(&db_name);
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct DocParams {
    old_rev: Option<String>,
    #[serde(default)]
    include_deleted: bool,
}

async fn get_doc(
    Path((db_name, doc_id)): Path<(String, String)>,
    Query(params): Query<DocParams>,
    State(state): State<ServerState>,
) -> StoreResult<Response> {
    let db = lookup(&state, &db_name)?;
    let doc = db
        .lock()
        .get_doc(&doc_id, params.include_deleted)
        .ok_or(StoreError::DocumentDoesNotExist)?;
    let body = serde_json::to_string(&doc.content)?;
    let response = (
        StatusCode::OK,
        [
            ("content-type", "application/json".to_string()),
            ("x-doc-rev", doc.rev),
            ("x-doc-has-conflicts", doc.has_conflicts.to_string()),
        ],
        body,
    );
    Ok(response.into_response())
}

async fn put_doc(
    Path((db_name, doc_id)): Path<(String, String)>,
    Query(params): Query<DocParams>,
    State(state): State<ServerState>,
    body: String,
) -> StoreResult<Json<Value>> {
    let db = lookup(&state, &db_name)?;
    let content: Value =
        serde_json::from_str(&body).map_err(|e| StoreError::InvalidJson(e.to_string()))?;
    let mut doc = Document::new(
        doc_id,
        params.old_rev.unwrap_or_default(),
        Some(content),
    );
    let new_rev = db.lock().put_doc(&mut doc)?;
    Ok(Json(json!({"rev": new_rev})))
}

async fn delete_doc(
    Path((db_name, doc_id)): Path<(String, String)>,
    Query(params): Query<DocParams>,
    State(state): State<ServerState>,
) -> StoreResult<Json<Value>> {
    let db = lookup(&state, &db_name)?;
    let mut doc = Document::new(doc_id, params.old_rev.unwrap_or_default(), None);
    let new_rev = db.lock().delete_doc(&mut doc)?;
    Ok(Json(json!({"rev": new_rev})))
}

async fn get_sync_info(
    Path((db_name, source_replica_uid)): Path<(String, String)>,
    State(state): State<ServerState>,
) -> StoreResult<Json<Value>> {
    let db = lookup(&state, &db_name)?;
    let db = db.lock();
    let (source_generation, source_transaction_id) =
        db.get_sync_gen_info(&source_replica_uid);
    Ok(Json(json!({
        "target_replica_uid": db.replica_uid(),
        "target_replica_generation": db.generation(),
        "source_replica_generation": source_generation,
        "source_transaction_id": source_transaction_id,
    })))
}

#[derive(Debug, Deserialize)]
struct RecordSyncInfoBody {
    generation: u64,
    transaction_id: String,
}

async fn record_sync_info(
    Path((db_name, source_replica_uid)): Path<(String, String)>,
    State(state): State<ServerState>,
    Json(body): Json<RecordSyncInfoBody>,
) -> StoreResult<Json<Value>> {
    let db = lookup(&state, &db_name)?;
    db.lock()
        .set_sync_info(&source_replica_uid, body.generation, &body.transaction_id);
    Ok(Json(json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct StreamHeader {
    last_known_generation: u64,
}

/// POST handler for the sync stream: ingest the source's documents, then
/// answer with the header object and every document the source is missing.
async fn sync_exchange(
    Path((db_name, source_replica_uid)): Path<(String, String)>,
    State(state): State<ServerState>,
    body: String,
) -> StoreResult<Response> {
    let db = lookup(&state, &db_name)?;
    let mut incoming: Vec<StreamDocEntry> = Vec::new();
    let header = parse_sync_stream(&body, |entry| {
        incoming.push(entry);
        Ok(())
    })
    .map_err(|e| StoreError::BadRequest(e.to_string()))?;
    let header: StreamHeader = serde_json::from_value(header)
        .map_err(|e| StoreError::BadRequest(format!("bad stream header: {}", e)))?;
    debug!(
        db = %db_name,
        source = %source_replica_uid,
        incoming = incoming.len(),
        "sync exchange"
    );

    let mut exchange = SyncExchange::new(db, &source_replica_uid, header.last_known_generation);
    for entry in incoming {
        let generation = entry.gen;
        let trans_id = entry.trans_id.clone();
        let mut doc = entry.into_doc();
        exchange.insert_doc_from_source(&mut doc, generation, &trans_id)?;
    }
    let (new_generation, new_transaction_id) = exchange.find_changes_to_return();

    let mut writer = SyncStreamWriter::new();
    writer.entry(&json!({
        "new_generation": new_generation,
        "new_transaction_id": new_transaction_id,
    }))?;
    let mut send = |doc: Document, generation: u64, trans_id: String| -> StoreResult<()> {
        writer.entry(&StreamDocEntry::from_doc(&doc, generation, &trans_id))
    };
    let body = match exchange.return_docs(&mut send) {
        Ok(()) => writer.finish(),
        // The array is already open; signal the failure in-stream.
        Err(err) => writer.abort(&err),
    };
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, SYNC_STREAM_CONTENT_TYPE)],
        body,
    )
        .into_response())
}
