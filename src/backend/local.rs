//! `LocalBackend`: a deterministic on-disk directory tree, grounded on
//! `spatio::storage::AOFBackend` and `spatio::persistence::AOFFile` for the
//! append-only-writer-plus-atomic-rename idioms, trimmed of the teacher's
//! rewrite/compaction machinery since tracks here are never deleted.

use super::{Backend, SessionOpenRequest, MAX_FILE_SIZE_BYTES};
use crate::error::{Error, Result};
use crate::track::{classify_record, expand_record, EncodedRecord};
use crate::types::{FileArtifact, IndexedPoint, RangeRead, SessionHandle, TrackMetadata};
use crate::value::{FieldMap, Value};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Storage backend writing to a local filesystem tree, one directory per
/// session, laid out exactly as documented in the external interface spec.
pub struct LocalBackend {
    root: PathBuf,
    sessions: Mutex<HashMap<String, PathBuf>>,
}

impl LocalBackend {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn session_dir(&self, handle: &SessionHandle) -> Result<PathBuf> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        sessions
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("session '{}' is not open", handle.id)))
    }

    fn lock_path(dir: &Path) -> PathBuf {
        dir.join("session.lock")
    }

    fn safe_track_name(track_name: &str) -> String {
        track_name.replace('/', "__")
    }

    fn track_dir(session_dir: &Path, track_name: &str) -> PathBuf {
        session_dir
            .join("tracks")
            .join(Self::safe_track_name(track_name))
    }

    fn load_track_metadata(track_dir: &Path) -> Result<TrackMetadata> {
        let path = track_dir.join("metadata.json");
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Writes `contents` to `path` by first writing a sibling temp file, then
/// renaming it over the destination — the atomic-replace idiom every
/// metadata write in the spec relies on, grounded on
/// `spatio::persistence::AOFFile::replace_with_shrink`'s rename-based swap.
fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Decodes every MessagePack-framed record concatenated in `bytes`, in the
/// order they were appended. MessagePack values are self-framing, so no
/// additional length prefix is needed to find each record's boundary.
fn decode_track_stream(bytes: &[u8]) -> Result<Vec<EncodedRecord>> {
    let total = bytes.len() as u64;
    let mut cursor = Cursor::new(bytes);
    let mut records = Vec::new();

    while cursor.position() < total {
        let before = cursor.position();
        let mut de = rmp_serde::Deserializer::new(&mut cursor);
        let value: Value = serde::Deserialize::deserialize(&mut de)
            .map_err(|e| Error::corrupt(format!("corrupt track record: {e}")))?;
        if cursor.position() == before {
            return Err(Error::corrupt("track record stream made no progress"));
        }
        records.push(classify_record(value)?);
    }

    Ok(records)
}

/// Counts already-persisted log lines so a reopened session can resume
/// sequence numbering instead of restarting it at zero.
fn count_log_lines(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let contents = fs::read_to_string(path)?;
    Ok(contents.lines().filter(|line| !line.is_empty()).count() as u64)
}

fn read_all_points(data_path: &Path) -> Result<Vec<FieldMap>> {
    if !data_path.exists() {
        return Ok(Vec::new());
    }
    let mut file = BufReader::new(File::open(data_path)?);
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let records = decode_track_stream(&bytes)?;
    Ok(records.into_iter().flat_map(expand_record).collect())
}

impl Backend for LocalBackend {
    fn upsert_session(
        &self,
        request: SessionOpenRequest,
    ) -> Result<(SessionHandle, FieldMap, u64)> {
        let handle = SessionHandle::new(format!("{}/{}", request.workspace, request.name));
        let dir = self.root.join(&request.workspace).join(&request.name);
        fs::create_dir_all(dir.join("logs"))?;
        fs::create_dir_all(dir.join("tracks"))?;
        fs::create_dir_all(dir.join("files"))?;

        let lock_path = Self::lock_path(&dir);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|_| {
                Error::conflict(format!(
                    "session '{}/{}' is already open in another process",
                    request.workspace, request.name
                ))
            })?;

        let now = chrono::Utc::now();
        let session_path = dir.join("session.json");
        let record = match read_json::<crate::types::SessionRecord>(&session_path)? {
            Some(mut existing) => {
                existing.description = request.description.or(existing.description);
                if !request.tags.is_empty() {
                    existing.tags = request.tags;
                }
                existing.folder = request.folder.or(existing.folder);
                existing.updated_at = now;
                existing
            }
            None => crate::types::SessionRecord {
                namespace: request.namespace,
                workspace: request.workspace.clone(),
                name: request.name.clone(),
                description: request.description,
                tags: request.tags,
                folder: request.folder,
                created_at: now,
                updated_at: now,
            },
        };
        atomic_write(&session_path, &serde_json::to_vec_pretty(&record)?)?;

        let params_path = dir.join("parameters.json");
        let params = read_json::<FieldMap>(&params_path)?.unwrap_or_default();
        if !params_path.exists() {
            atomic_write(&params_path, &serde_json::to_vec_pretty(&params)?)?;
        }

        let files_meta_path = dir.join("files").join(".files_metadata.json");
        if !files_meta_path.exists() {
            atomic_write(&files_meta_path, b"[]")?;
        }

        let log_count = count_log_lines(&dir.join("logs").join("logs.jsonl"))?;

        self.sessions
            .lock()
            .expect("session map poisoned")
            .insert(handle.id.clone(), dir);

        Ok((handle, params, log_count))
    }

    fn append_logs(&self, handle: &SessionHandle, records: &super::LogBatch) -> Result<()> {
        let dir = self.session_dir(handle)?;
        let path = dir.join("logs").join("logs.jsonl");
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for record in records {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            file.write_all(&line)?;
        }
        file.sync_data()?;
        Ok(())
    }

    fn replace_parameters(&self, handle: &SessionHandle, flat_map: &FieldMap) -> Result<()> {
        let dir = self.session_dir(handle)?;
        let path = dir.join("parameters.json");
        atomic_write(&path, &serde_json::to_vec_pretty(flat_map)?)
    }

    fn ensure_track(&self, handle: &SessionHandle, track: &TrackMetadata) -> Result<()> {
        let dir = self.session_dir(handle)?;
        let track_dir = Self::track_dir(&dir, &track.name);
        fs::create_dir_all(&track_dir)?;
        let metadata_path = track_dir.join("metadata.json");
        if !metadata_path.exists() {
            atomic_write(&metadata_path, &serde_json::to_vec_pretty(track)?)?;
        }
        Ok(())
    }

    fn write_track_records(
        &self,
        handle: &SessionHandle,
        track_name: &str,
        records: &[EncodedRecord],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let dir = self.session_dir(handle)?;
        let track_dir = Self::track_dir(&dir, track_name);
        fs::create_dir_all(&track_dir)?;

        let data_path = track_dir.join("data.msgpack");
        let mut file = OpenOptions::new().create(true).append(true).open(&data_path)?;
        let mut appended_points: u64 = 0;
        for record in records {
            let bytes = rmp_serde::to_vec(record)?;
            file.write_all(&bytes)?;
            appended_points += match record {
                EncodedRecord::Row(_) => 1,
                EncodedRecord::Columnar(block) => {
                    block.values().next().map(Vec::len).unwrap_or(0) as u64
                }
            };
        }
        file.sync_data()?;

        let metadata_path = track_dir.join("metadata.json");
        let mut metadata = LocalBackend::load_track_metadata(&track_dir)
            .unwrap_or_else(|_| TrackMetadata {
                name: track_name.to_string(),
                ..Default::default()
            });
        metadata.total_data_points += appended_points;
        atomic_write(&metadata_path, &serde_json::to_vec_pretty(&metadata)?)?;

        Ok(())
    }

    fn read_track_range(
        &self,
        handle: &SessionHandle,
        track_name: &str,
        start_index: u64,
        limit: u64,
    ) -> Result<RangeRead> {
        let dir = self.session_dir(handle)?;
        let track_dir = Self::track_dir(&dir, track_name);
        let points = read_all_points(&track_dir.join("data.msgpack"))?;
        let total = points.len() as u64;

        let start = start_index.min(total) as usize;
        let end = start_index.saturating_add(limit).min(total) as usize;

        let items = points[start..end]
            .iter()
            .enumerate()
            .map(|(offset, data)| IndexedPoint {
                index: start_index + offset as u64,
                data: data.clone(),
            })
            .collect();

        Ok(RangeRead { total, items })
    }

    fn read_track_time(
        &self,
        handle: &SessionHandle,
        track_name: &str,
        start_ts: Option<f64>,
        end_ts: Option<f64>,
        limit: u64,
        reverse: bool,
    ) -> Result<Vec<IndexedPoint>> {
        let dir = self.session_dir(handle)?;
        let track_dir = Self::track_dir(&dir, track_name);
        let points = read_all_points(&track_dir.join("data.msgpack"))?;

        let mut matches: Vec<IndexedPoint> = points
            .into_iter()
            .enumerate()
            .filter(|(_, data)| {
                let ts = data.get(crate::value::TS_KEY).and_then(Value::as_f64);
                let ts = match ts {
                    Some(ts) => ts,
                    None => return false,
                };
                start_ts.map_or(true, |s| ts >= s) && end_ts.map_or(true, |e| ts < e)
            })
            .map(|(index, data)| IndexedPoint {
                index: index as u64,
                data,
            })
            .collect();

        if reverse {
            matches.reverse();
        }
        matches.truncate(limit as usize);
        Ok(matches)
    }

    fn close_session(&self, handle: &SessionHandle) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        if let Some(dir) = sessions.remove(&handle.id) {
            let _ = fs::remove_file(Self::lock_path(&dir));
        }
        Ok(())
    }

    fn list_tracks(&self, handle: &SessionHandle) -> Result<Vec<TrackMetadata>> {
        let dir = self.session_dir(handle)?;
        let tracks_dir = dir.join("tracks");
        if !tracks_dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&tracks_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Ok(metadata) = LocalBackend::load_track_metadata(&entry.path()) {
                    out.push(metadata);
                }
            }
        }
        Ok(out)
    }

    fn upload_file(
        &self,
        handle: &SessionHandle,
        local_source_path: &Path,
        prefix: &str,
        description: Option<String>,
        tags: BTreeSet<String>,
        metadata: FieldMap,
    ) -> Result<FileArtifact> {
        if !prefix.starts_with('/') {
            return Err(Error::bad_input(format!(
                "file prefix '{prefix}' must start with '/'"
            )));
        }

        let source_len = fs::metadata(local_source_path)?.len();
        if source_len > MAX_FILE_SIZE_BYTES {
            return Err(Error::bad_input(format!(
                "source file is {source_len} bytes, exceeding the 5 GiB limit"
            )));
        }

        let filename = local_source_path
            .file_name()
            .ok_or_else(|| Error::bad_input("source path has no filename component"))?
            .to_string_lossy()
            .to_string();

        let dir = self.session_dir(handle)?;
        let file_id = uuid::Uuid::new_v4().to_string();
        let prefix_trimmed = prefix.trim_start_matches('/');
        let dest_dir = dir
            .join("files")
            .join(prefix_trimmed)
            .join(&file_id);
        fs::create_dir_all(&dest_dir)?;
        let dest_path = dest_dir.join(&filename);

        let checksum = copy_with_checksum(local_source_path, &dest_path)?;

        let artifact = FileArtifact {
            file_id,
            filename,
            prefix: prefix.to_string(),
            size_bytes: source_len,
            checksum,
            description,
            tags,
            metadata,
            created_at: chrono::Utc::now(),
        };

        let meta_path = dir.join("files").join(".files_metadata.json");
        let mut all: Vec<FileArtifact> = read_json(&meta_path)?.unwrap_or_default();
        all.push(artifact.clone());
        atomic_write(&meta_path, &serde_json::to_vec_pretty(&all)?)?;

        Ok(artifact)
    }

    fn list_files(
        &self,
        handle: &SessionHandle,
        prefix: Option<&str>,
        tags: Option<&BTreeSet<String>>,
    ) -> Result<Vec<FileArtifact>> {
        let dir = self.session_dir(handle)?;
        let meta_path = dir.join("files").join(".files_metadata.json");
        let all: Vec<FileArtifact> = read_json(&meta_path)?.unwrap_or_default();

        Ok(all
            .into_iter()
            .filter(|f| prefix.map_or(true, |p| f.prefix == p))
            .filter(|f| tags.map_or(true, |wanted| wanted.iter().all(|t| f.tags.contains(t))))
            .collect())
    }
}

/// Streams `source` into `dest` while computing a running SHA-256 digest,
/// returning the hex-encoded checksum.
fn copy_with_checksum(source: &Path, dest: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(source)?);
    let mut writer = File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
    }
    writer.sync_all()?;

    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing into a String cannot fail");
    }
    out
}
