//! Shared data-model types: log records, track/file metadata, session
//! identity. These mirror the entities in the data model: every field here
//! is either persisted verbatim or derived once at session-open time.

use crate::value::{FieldMap, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// An append-only log entry. `sequence_number` is unique and strictly
/// increasing within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<Value>,
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
}

/// Metadata describing a track, independent of its data points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub user_metadata: FieldMap,
    /// Monotonically increasing count of points ever appended to this track.
    #[serde(default)]
    pub total_data_points: u64,
}

/// A single logical point read back from a track, addressed by its 0-based
/// insertion index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexedPoint {
    pub index: u64,
    pub data: FieldMap,
}

/// Result of an index-range read: the total number of points currently
/// persisted plus the requested slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeRead {
    pub total: u64,
    pub items: Vec<IndexedPoint>,
}

/// Metadata + content-addressing info for an uploaded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileArtifact {
    #[serde(rename = "fileId")]
    pub file_id: String,
    pub filename: String,
    pub prefix: String,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    pub checksum: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: FieldMap,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Identity + mutable bookkeeping persisted as `session.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub namespace: Option<String>,
    pub workspace: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub folder: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Opaque handle a [`crate::backend::Backend`] hands back from
/// `upsert_session`, passed into every subsequent call for that session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
}

impl SessionHandle {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self { id: id.into() }
    }
}
