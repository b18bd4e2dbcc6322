//! The `Session` lifecycle, grounded on `spatio::db::DB`'s clone-handle
//! pattern: a cheap `Clone` wrapper around shared, mutex-guarded state. A
//! `Mutex` is used rather than the teacher's `RwLock` because every public
//! operation here mutates `last_timestamp`, a buffer, the parameter map, or
//! the log sequence counter — reads never outnumber writes enough to
//! justify a reader/writer lock.

use crate::backend::{Backend, SessionOpenRequest, DEFAULT_TIME_LIMIT, MAX_TIME_LIMIT};
use crate::error::{Error, Result};
use crate::params;
use crate::track::{self, TrackBuffer};
use crate::types::{
    FileArtifact, IndexedPoint, LogLevel, LogRecord, RangeRead, SessionHandle, TrackMetadata,
};
use crate::value::{FieldMap, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

struct SessionInner {
    backend: Arc<dyn Backend>,
    handle: SessionHandle,
    open: bool,
    last_timestamp: Option<f64>,
    log_sequence: u64,
    params_map: FieldMap,
    track_buffers: HashMap<String, TrackBuffer>,
    known_tracks: HashSet<String>,
}

impl SessionInner {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::SessionClosed)
        }
    }

    fn ensure_track_known(&mut self, track_name: &str) -> Result<()> {
        if self.known_tracks.contains(track_name) {
            return Ok(());
        }
        self.backend.ensure_track(
            &self.handle,
            &TrackMetadata {
                name: track_name.to_string(),
                ..Default::default()
            },
        )?;
        self.known_tracks.insert(track_name.to_string());
        Ok(())
    }

    /// Merges the buffered points for `track_name`, writes them, and clears
    /// the buffer. On backend failure the points are put back so a retry
    /// can pick up where it left off.
    fn flush_track(&mut self, track_name: &str) -> Result<()> {
        let points = match self.track_buffers.get_mut(track_name) {
            Some(buffer) if !buffer.is_empty() => buffer.take_points(),
            _ => return Ok(()),
        };

        let encoded = track::merge_and_encode(points.clone()).expect("checked non-empty above");
        match self
            .backend
            .write_track_records(&self.handle, track_name, std::slice::from_ref(&encoded))
        {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!(
                    "flush of track '{track_name}' failed ({err}); retaining {} points in buffer",
                    points.len()
                );
                if let Some(buffer) = self.track_buffers.get_mut(track_name) {
                    buffer.restore(points);
                }
                Err(err)
            }
        }
    }

    fn flush_all(&mut self) -> Result<()> {
        let names: Vec<String> = self.track_buffers.keys().cloned().collect();
        for name in names {
            self.flush_track(&name)?;
        }
        Ok(())
    }
}

/// A cheap, `Clone`-able handle to an open experiment-tracking session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
    /// The flat key→value parameter map for this session.
    pub params: Params,
    /// Buffer-flushing operations spanning every track.
    pub tracks: Tracks,
}

impl Session {
    /// Opens (creating if absent) a session against `backend`.
    pub fn open(backend: Arc<dyn Backend>, request: SessionOpenRequest) -> Result<Self> {
        let (handle, params_map, log_count) = backend.upsert_session(request)?;
        let inner = Arc::new(Mutex::new(SessionInner {
            backend,
            handle,
            open: true,
            last_timestamp: None,
            log_sequence: log_count,
            params_map,
            track_buffers: HashMap::new(),
            known_tracks: HashSet::new(),
        }));

        Ok(Session {
            params: Params {
                inner: inner.clone(),
            },
            tracks: Tracks {
                inner: inner.clone(),
            },
            inner,
        })
    }

    /// Appends a log record, assigning the next sequence number.
    pub fn log(&self, message: impl Into<String>, level: LogLevel, metadata: Option<Value>) -> Result<()> {
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        inner.ensure_open()?;

        let record = LogRecord {
            timestamp: chrono::Utc::now(),
            level,
            message: message.into(),
            metadata,
            sequence_number: inner.log_sequence,
        };
        inner.log_sequence += 1;

        let handle = inner.handle.clone();
        inner.backend.append_logs(&handle, &vec![record])
    }

    /// Returns a handle bound to the named track. Calling this twice with
    /// the same name yields handles sharing the same backing buffer.
    pub fn track(&self, name: impl Into<String>) -> Track {
        Track {
            inner: self.inner.clone(),
            name: name.into(),
        }
    }

    /// Uploads a local file under `prefix`, returning the recorded artifact.
    #[allow(clippy::too_many_arguments)]
    pub fn upload_file(
        &self,
        local_source_path: impl AsRef<Path>,
        prefix: &str,
        description: Option<String>,
        tags: BTreeSet<String>,
        metadata: FieldMap,
    ) -> Result<FileArtifact> {
        let (backend, handle) = {
            let inner = self.inner.lock().expect("session mutex poisoned");
            inner.ensure_open()?;
            (inner.backend.clone(), inner.handle.clone())
        };
        backend.upload_file(
            &handle,
            local_source_path.as_ref(),
            prefix,
            description,
            tags,
            metadata,
        )
    }

    /// Lists previously uploaded files, optionally filtered by prefix and/or
    /// tag membership.
    pub fn list_files(
        &self,
        prefix: Option<&str>,
        tags: Option<&BTreeSet<String>>,
    ) -> Result<Vec<FileArtifact>> {
        let (backend, handle) = {
            let inner = self.inner.lock().expect("session mutex poisoned");
            inner.ensure_open()?;
            (inner.backend.clone(), inner.handle.clone())
        };
        backend.list_files(&handle, prefix, tags)
    }

    /// Idempotently flushes every track, writes final metadata, and
    /// releases backend resources. Safe to call more than once; safe to
    /// call from a [`SessionGuard`] on an unwinding stack.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        if !inner.open {
            return Ok(());
        }

        match inner.flush_all() {
            Ok(()) => {}
            Err(err) if err.is_transient() => {
                log::warn!("best-effort flush on close failed: {err}");
            }
            Err(err) => return Err(err),
        }

        let handle = inner.handle.clone();
        inner.backend.close_session(&handle)?;
        inner.open = false;
        Ok(())
    }

    /// Wraps this session in a scope guard that calls [`Session::close`] on
    /// drop, including during stack unwinding.
    pub fn guard(self) -> SessionGuard {
        SessionGuard { session: self }
    }
}

/// The flat parameter map for a [`Session`].
#[derive(Clone)]
pub struct Params {
    inner: Arc<Mutex<SessionInner>>,
}

impl Params {
    /// Flattens `updates` to dotted keys, merges them into the current map
    /// (upsert, no delete), and atomically persists the whole map.
    pub fn set(&self, updates: FieldMap) -> Result<()> {
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        inner.ensure_open()?;

        for (key, value) in params::flatten(updates) {
            inner.params_map.insert(key, value);
        }

        let handle = inner.handle.clone();
        let snapshot = inner.params_map.clone();
        inner.backend.replace_parameters(&handle, &snapshot)
    }

    /// Returns a clone of the current in-memory parameter map.
    pub fn get(&self) -> FieldMap {
        self.inner
            .lock()
            .expect("session mutex poisoned")
            .params_map
            .clone()
    }
}

/// Buffer-flushing operations spanning every track of a [`Session`].
#[derive(Clone)]
pub struct Tracks {
    inner: Arc<Mutex<SessionInner>>,
}

impl Tracks {
    /// Flushes every track's pending buffer.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        inner.ensure_open()?;
        inner.flush_all()
    }
}

/// A handle bound to one named track, sharing its backing buffer with every
/// other handle returned for the same name.
pub struct Track {
    inner: Arc<Mutex<SessionInner>>,
    name: String,
}

impl Track {
    /// Appends one point. `_ts` is resolved per the inheritance table before
    /// the point joins the in-memory buffer; eagerly flushes once the
    /// buffer crosses [`TrackBuffer::DEFAULT_FLUSH_THRESHOLD`].
    pub fn append(&self, fields: FieldMap) -> Result<()> {
        self.append_batch(vec![fields])
    }

    /// Appends N points in one call. Each point's `_ts` is resolved
    /// independently, in order, under the session lock.
    pub fn append_batch(&self, points: Vec<FieldMap>) -> Result<()> {
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        inner.ensure_open()?;
        inner.ensure_track_known(&self.name)?;

        let mut resolved = Vec::with_capacity(points.len());
        for mut point in points {
            track::resolve_timestamp(&mut point, &mut inner.last_timestamp)?;
            resolved.push(point);
        }

        let buffer = inner.track_buffers.entry(self.name.clone()).or_default();
        let len_before = buffer.len();
        buffer.push_many(resolved);

        if buffer.len() >= TrackBuffer::DEFAULT_FLUSH_THRESHOLD && len_before < TrackBuffer::DEFAULT_FLUSH_THRESHOLD {
            inner.flush_track(&self.name)?;
        }
        Ok(())
    }

    /// Flushes this track's pending buffer.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        inner.ensure_open()?;
        inner.flush_track(&self.name)
    }

    /// Flushes, then returns logical points `[start, start+limit)`.
    pub fn read_by_index(&self, start: u64, limit: u64) -> Result<RangeRead> {
        let mut inner = self.inner.lock().expect("session mutex poisoned");
        inner.ensure_open()?;
        inner.flush_track(&self.name)?;
        let handle = inner.handle.clone();
        inner.backend.read_track_range(&handle, &self.name, start, limit)
    }

    /// Flushes, then returns logical points with `_ts` in `[start_ts,
    /// end_ts)`. `limit` defaults to 1000 and is capped at 10000; `None`
    /// means "use the default".
    pub fn read_by_time(
        &self,
        start_ts: Option<f64>,
        end_ts: Option<f64>,
        limit: Option<u64>,
        reverse: bool,
    ) -> Result<Vec<IndexedPoint>> {
        let limit = limit.unwrap_or(DEFAULT_TIME_LIMIT).min(MAX_TIME_LIMIT);

        let mut inner = self.inner.lock().expect("session mutex poisoned");
        inner.ensure_open()?;
        inner.flush_track(&self.name)?;
        let handle = inner.handle.clone();
        inner
            .backend
            .read_track_time(&handle, &self.name, start_ts, end_ts, limit, reverse)
    }
}

/// Scope-guard wrapper grounded on the teacher's Drop-based rewrite-guard
/// cleanup: guarantees [`Session::close`] runs on every exit path, including
/// stack unwinding from a raised error.
pub struct SessionGuard {
    session: Session,
}

impl SessionGuard {
    /// The wrapped session, for calling any operation while the guard is
    /// still alive.
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl std::ops::Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(err) = self.session.close() {
            log::warn!("error closing session during guard drop: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use serde_json::json;

    fn open(tmp: &std::path::Path, name: &str) -> Session {
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(tmp).unwrap());
        Session::open(
            backend,
            SessionOpenRequest {
                workspace: "demo".into(),
                name: name.into(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn single_append_reads_back_with_assigned_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        let session = open(tmp.path(), "s1");

        let mut fields = FieldMap::new();
        fields.insert("value".into(), json!(0.5));
        fields.insert("epoch".into(), json!(1));
        session.track("loss").append(fields).unwrap();
        session.tracks.flush().unwrap();

        let read = session.track("loss").read_by_index(0, 1).unwrap();
        assert_eq!(read.total, 1);
        assert_eq!(read.items[0].index, 0);
        assert_eq!(read.items[0].data.get("value").unwrap(), &json!(0.5));
        assert!(read.items[0].data.get("_ts").unwrap().as_f64().unwrap() > 0.0);
    }

    #[test]
    fn ts_inherit_sentinel_shares_across_tracks() {
        let tmp = tempfile::tempdir().unwrap();
        let session = open(tmp.path(), "s2");

        let mut pose = FieldMap::new();
        pose.insert("position".into(), json!([1, 2, 3]));
        session.track("robot/pose").append(pose).unwrap();

        let mut camera = FieldMap::new();
        camera.insert("width".into(), json!(640));
        camera.insert("_ts".into(), json!(-1.0));
        session.track("camera").append(camera).unwrap();

        session.tracks.flush().unwrap();

        let pose_read = session.track("robot/pose").read_by_index(0, 1).unwrap();
        let camera_read = session.track("camera").read_by_index(0, 1).unwrap();
        assert_eq!(
            pose_read.items[0].data.get("_ts"),
            camera_read.items[0].data.get("_ts")
        );
    }

    #[test]
    fn params_set_merges_and_flattens() {
        let tmp = tempfile::tempdir().unwrap();
        let session = open(tmp.path(), "s3");

        let mut optimizer = FieldMap::new();
        optimizer.insert("lr".into(), json!(0.01));
        let mut update = FieldMap::new();
        update.insert("optimizer".into(), Value::Object(optimizer));
        session.params.set(update).unwrap();

        let mut second = FieldMap::new();
        second.insert("epochs".into(), json!(10));
        session.params.set(second).unwrap();

        let params = session.params.get();
        assert_eq!(params.get("optimizer.lr").unwrap(), &json!(0.01));
        assert_eq!(params.get("epochs").unwrap(), &json!(10));
    }

    #[test]
    fn closed_session_rejects_further_operations() {
        let tmp = tempfile::tempdir().unwrap();
        let session = open(tmp.path(), "s4");
        session.close().unwrap();

        let err = session.log("hi", LogLevel::Info, None).unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
    }

    #[test]
    fn guard_closes_session_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let session = open(tmp.path(), "s5");
        let inner = session.inner.clone();
        {
            let _guard = session.guard();
        }
        assert!(!inner.lock().unwrap().open);
    }

    #[test]
    fn reopening_a_session_resumes_log_sequence_numbering() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let session = open(tmp.path(), "s7");
            session.log("first", LogLevel::Info, None).unwrap();
            session.log("second", LogLevel::Info, None).unwrap();
            session.close().unwrap();
        }

        let session = open(tmp.path(), "s7");
        session.log("third", LogLevel::Info, None).unwrap();

        let path = tmp.path().join("demo").join("s7").join("logs").join("logs.jsonl");
        let contents = std::fs::read_to_string(path).unwrap();
        let sequences: Vec<u64> = contents
            .lines()
            .map(|line| {
                let v: serde_json::Value = serde_json::from_str(line).unwrap();
                v.get("sequenceNumber").unwrap().as_u64().unwrap()
            })
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn batch_becomes_one_columnar_block_but_reads_as_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let session = open(tmp.path(), "s6");

        let points = (1..=3)
            .map(|i| {
                let mut m = FieldMap::new();
                m.insert("v".into(), json!(i * 10));
                m.insert("_ts".into(), json!(i as f64));
                m
            })
            .collect();
        session.track("m").append_batch(points).unwrap();

        let read = session.track("m").read_by_index(0, 10).unwrap();
        assert_eq!(read.items.len(), 3);
        assert_eq!(read.items[0].data.get("v").unwrap(), &json!(10));
        assert_eq!(read.items[2].data.get("_ts").unwrap(), &json!(3.0));
    }
}
