//! The `Backend` trait: the storage driver a [`crate::Session`] talks to.
//!
//! Mirrors the teacher's `StorageBackend` trait-plus-two-implementations
//! shape (`MemoryBackend`/`AOFBackend` there, `LocalBackend`/`RemoteBackend`
//! here) — one trait expressing every persistence operation, with the
//! Session owning buffering/sequencing and the backend owning durability.

pub mod local;
#[cfg(feature = "remote")]
pub mod remote;

use crate::error::Result;
use crate::track::EncodedRecord;
use crate::types::{FileArtifact, RangeRead, SessionHandle, TrackMetadata};
use crate::value::FieldMap;
use std::collections::BTreeSet;
use std::path::Path;

pub use local::LocalBackend;
#[cfg(feature = "remote")]
pub use remote::RemoteBackend;

/// Parameters for opening or creating a session's backing state.
#[derive(Debug, Clone, Default)]
pub struct SessionOpenRequest {
    pub namespace: Option<String>,
    pub workspace: String,
    pub name: String,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub folder: Option<String>,
}

/// A batch of log entries already carrying sequence numbers, handed to a
/// backend for append-only persistence.
pub type LogBatch = Vec<crate::types::LogRecord>;

/// The storage driver a [`crate::Session`] delegates every durable operation
/// to. Implementations are not required to buffer; the Session buffers and
/// sequences, the backend persists.
pub trait Backend: Send + Sync {
    /// Create the session if absent, otherwise continue using the existing
    /// one, returning an opaque handle, the parameter map already on record
    /// (empty for a fresh session), and the count of log records already
    /// persisted (0 for a fresh session) so the caller can resume log
    /// sequence numbering without repeating any.
    fn upsert_session(&self, request: SessionOpenRequest) -> Result<(SessionHandle, FieldMap, u64)>;

    /// Append already-sequenced log records.
    fn append_logs(&self, handle: &SessionHandle, records: &LogBatch) -> Result<()>;

    /// Replace the stored flat parameter map wholesale (not a patch).
    fn replace_parameters(&self, handle: &SessionHandle, flat_map: &FieldMap) -> Result<()>;

    /// Ensure a track exists, creating its metadata sidecar if absent.
    fn ensure_track(&self, handle: &SessionHandle, track: &TrackMetadata) -> Result<()>;

    /// Append encoded records (rows or columnar blocks) to a track's stream.
    fn write_track_records(
        &self,
        handle: &SessionHandle,
        track_name: &str,
        records: &[EncodedRecord],
    ) -> Result<()>;

    /// Read `limit` logical points starting at `start_index`.
    fn read_track_range(
        &self,
        handle: &SessionHandle,
        track_name: &str,
        start_index: u64,
        limit: u64,
    ) -> Result<RangeRead>;

    /// Read logical points with `_ts` in `[start_ts, end_ts)`, either bound
    /// optional, oldest-first unless `reverse`.
    #[allow(clippy::too_many_arguments)]
    fn read_track_time(
        &self,
        handle: &SessionHandle,
        track_name: &str,
        start_ts: Option<f64>,
        end_ts: Option<f64>,
        limit: u64,
        reverse: bool,
    ) -> Result<Vec<crate::types::IndexedPoint>>;

    /// List every track's metadata.
    fn list_tracks(&self, handle: &SessionHandle) -> Result<Vec<TrackMetadata>>;

    /// Release whatever the backend holds open for `handle` (a local
    /// single-writer lock, a remote keep-alive). A no-op unless overridden;
    /// remote sessions have nothing process-local to release.
    fn close_session(&self, _handle: &SessionHandle) -> Result<()> {
        Ok(())
    }

    /// Stream a local source file into content-addressed storage and record
    /// its metadata.
    #[allow(clippy::too_many_arguments)]
    fn upload_file(
        &self,
        handle: &SessionHandle,
        local_source_path: &Path,
        prefix: &str,
        description: Option<String>,
        tags: BTreeSet<String>,
        metadata: FieldMap,
    ) -> Result<FileArtifact>;

    /// List previously uploaded files, optionally filtered by prefix and/or
    /// tag membership.
    fn list_files(
        &self,
        handle: &SessionHandle,
        prefix: Option<&str>,
        tags: Option<&BTreeSet<String>>,
    ) -> Result<Vec<FileArtifact>>;
}

/// Default time-range read limit (`spec.md` §4.5).
pub const DEFAULT_TIME_LIMIT: u64 = 1000;
/// Maximum time-range read limit (`spec.md` §4.5).
pub const MAX_TIME_LIMIT: u64 = 10_000;

/// Maximum size of an uploaded file (`spec.md` §4.7).
pub const MAX_FILE_SIZE_BYTES: u64 = 5 * 1024 * 1024 * 1024;
