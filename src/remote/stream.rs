use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Document;
use crate::error::{StoreError, StoreResult};

/// Content type of the line-delimited JSON sync stream.
pub const SYNC_STREAM_CONTENT_TYPE: &str = "application/x-syncdoc-sync-stream";

/// One document entry on the wire, with the generation and transaction id
/// it was last changed at on the sending side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDocEntry {
    pub id: String,
    pub rev: String,
    pub content: Option<Value>,
    pub gen: u64,
    pub trans_id: String,
}

impl StreamDocEntry {
    pub fn from_doc(doc: &Document, generation: u64, trans_id: &str) -> Self {
        Self {
            id: doc.doc_id.clone(),
            rev: doc.rev.clone(),
            content: doc.content.clone(),
            gen: generation,
            trans_id: trans_id.to_string(),
        }
    }

    pub fn into_doc(self) -> Document {
        Document::new(self.id, self.rev, self.content)
    }
}

/// Incremental writer for the framed stream: `[`, entries separated by
/// `,\r\n`, closed with `\r\n]`.
pub struct SyncStreamWriter {
    body: String,
    empty: bool,
}

impl SyncStreamWriter {
    pub fn new() -> Self {
        Self {
            body: "[".to_string(),
            empty: true,
        }
    }

    pub fn entry<T: Serialize>(&mut self, value: &T) -> StoreResult<()> {
        if !self.empty {
            self.body.push(',');
        }
        self.body.push_str("\r\n");
        self.body.push_str(&serde_json::to_string(value)?);
        self.empty = false;
        Ok(())
    }

    pub fn finish(mut self) -> String {
        self.body.push_str("\r\n]");
        self.body
    }

    /// Abort the stream with an error entry; the array is deliberately
    /// left unterminated so the other end cannot mistake it for a
    /// complete exchange.
    pub fn abort(mut self, error: &StoreError) -> String {
        if !self.empty {
            self.body.push(',');
        }
        self.body.push_str("\r\n");
        self.body.push_str(
            &serde_json::json!({"error": error.wire_description()}).to_string(),
        );
        self.body.push_str("\r\n");
        self.body
    }
}

impl Default for SyncStreamWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn broken(msg: &str) -> StoreError {
    StoreError::BrokenSyncStream(msg.to_string())
}

fn strip_comma(line: &str) -> (&str, bool) {
    match line.strip_suffix(',') {
        Some(stripped) => (stripped, true),
        None => (line, false),
    }
}

/// Translate an `{"error": ...}` entry from the peer into a typed error.
fn error_entry(value: &Value) -> Option<StoreError> {
    let error = value.get("error")?.as_str()?;
    Some(match error {
        "unavailable" => StoreError::Unavailable,
        other => broken(&format!("server error in stream: {}", other)),
    })
}

/// Parse a framed sync stream. The first entry (the header object) is
/// returned; every following entry is handed to `on_entry`. Malformed
/// framing raises `BrokenSyncStream`; an error object from the peer is
/// translated to its typed equivalent.
pub fn parse_sync_stream(
    data: &str,
    mut on_entry: impl FnMut(StreamDocEntry) -> StoreResult<()>,
) -> StoreResult<Value> {
    let lines: Vec<&str> = data.lines().collect();
    if lines.first() != Some(&"[") {
        return Err(broken("missing opening bracket"));
    }
    let Some((last, middle)) = lines[1..].split_last() else {
        return Err(broken("empty stream"));
    };
    if *last != "]" {
        // The server may have appended an error object and stopped.
        let (line, _) = strip_comma(last);
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            if let Some(err) = error_entry(&value) {
                return Err(err);
            }
        }
        return Err(broken("missing closing bracket"));
    }
    let Some((first, rest)) = middle.split_first() else {
        return Err(broken("missing stream header"));
    };
    let (line, mut comma) = strip_comma(first);
    let header: Value =
        serde_json::from_str(line).map_err(|e| broken(&format!("bad header: {}", e)))?;
    if let Some(err) = error_entry(&header) {
        return Err(err);
    }
    for entry in rest {
        if !comma {
            return Err(broken("missing comma between entries"));
        }
        let (line, next_comma) = strip_comma(entry);
        comma = next_comma;
        let value: Value =
            serde_json::from_str(line).map_err(|e| broken(&format!("bad entry: {}", e)))?;
        if let Some(err) = error_entry(&value) {
            return Err(err);
        }
        let entry: StreamDocEntry = serde_json::from_value(value)
            .map_err(|e| broken(&format!("bad doc entry: {}", e)))?;
        on_entry(entry)?;
    }
    if comma {
        return Err(broken("trailing comma before closing bracket"));
    }
    Ok(header)
}
