use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

static DOC_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9.%_-]+$").unwrap());

/// Validate a document id: non-empty, no slashes, ASCII word-ish characters.
pub fn check_doc_id(doc_id: &str) -> StoreResult<()> {
    if DOC_ID_RE.is_match(doc_id) {
        Ok(())
    } else {
        Err(StoreError::InvalidDocId(doc_id.to_string()))
    }
}

/// A single document: opaque JSON content plus its revision.
///
/// `content == None` marks a tombstone; tombstones stay in the store so
/// deletions propagate through sync. `rev` is the serialized vector clock,
/// with the empty string meaning "no revision yet". `has_conflicts` is
/// derived from the conflict table when the document is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub rev: String,
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_conflicts: bool,
}

impl Document {
    pub fn new(doc_id: impl Into<String>, rev: impl Into<String>, content: Option<Value>) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev: rev.into(),
            content,
            has_conflicts: false,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.content.is_none()
    }

    /// Whether two documents carry identical content. Tombstones compare
    /// equal to tombstones.
    pub fn same_content_as(&self, other: &Document) -> bool {
        self.content == other.content
    }
}
