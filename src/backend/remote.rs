//! `RemoteBackend`: an HTTP client mapping each [`super::Backend`] operation
//! to one request against a DreamLake server. Grounded on the *shape* of a
//! transport module split (one method per operation, a shared bearer token,
//! blocking I/O) documented as a placeholder in the teacher's client crate.

use super::{Backend, SessionOpenRequest};
use crate::error::{Error, Result};
use crate::track::EncodedRecord;
use crate::types::{FileArtifact, IndexedPoint, RangeRead, SessionHandle, TrackMetadata};
use crate::value::FieldMap;
use reqwest::blocking::{multipart, Client, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// The shared HMAC secret used for *development-mode* token derivation from
/// a bare `user_name`. Never use this path in production: supply `api_key`
/// instead. Mirrors the username-derived-bearer-token pattern used for
/// service-to-service dev auth elsewhere in the ecosystem.
const DEV_SHARED_SECRET: &[u8] = b"dreamlake-dev-insecure-shared-secret";

#[derive(Debug, Serialize)]
struct DevClaims {
    sub: String,
    iat: i64,
}

/// Derives a deterministic, insecure development bearer token from a
/// username. Documented as development-only by `spec.md` §4.3 — real
/// deployments must supply `api_key`.
fn derive_dev_token(user_name: &str) -> Result<String> {
    let claims = DevClaims {
        sub: user_name.to_string(),
        iat: chrono::Utc::now().timestamp(),
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(DEV_SHARED_SECRET),
    )
    .map_err(|e| Error::bad_input(format!("failed to derive dev token: {e}")))
}

pub struct RemoteBackend {
    base_url: String,
    client: Client,
    bearer_token: String,
}

impl RemoteBackend {
    pub fn new(base_url: impl Into<String>, user_name: Option<&str>, api_key: Option<&str>) -> Result<Self> {
        let bearer_token = match (api_key, user_name) {
            (Some(key), _) => key.to_string(),
            (None, Some(name)) => derive_dev_token(name)?,
            (None, None) => {
                return Err(Error::bad_input(
                    "remote backend requires either api_key or user_name",
                ))
            }
        };

        let client = Client::builder()
            .build()
            .map_err(|e| Error::bad_input(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            bearer_token,
        })
    }

    fn url(&self, path: impl std::fmt::Display) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        builder.bearer_auth(&self.bearer_token)
    }

    fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!(
                "remote resource not found: {}",
                response.url()
            )));
        }
        Ok(response.error_for_status()?)
    }
}

#[derive(Serialize)]
struct UpsertSessionBody<'a> {
    namespace: &'a Option<String>,
    name: &'a str,
    description: &'a Option<String>,
    tags: &'a BTreeSet<String>,
    folder: &'a Option<String>,
}

#[derive(Deserialize)]
struct UpsertSessionResponse {
    id: String,
    #[serde(default)]
    parameters: FieldMap,
    #[serde(default)]
    log_count: u64,
}

#[derive(Serialize)]
struct TrackBatchBody<'a> {
    metadata: Option<&'a TrackMetadata>,
    records: &'a [EncodedRecord],
}

impl Backend for RemoteBackend {
    fn upsert_session(
        &self,
        request: SessionOpenRequest,
    ) -> Result<(SessionHandle, FieldMap, u64)> {
        let body = UpsertSessionBody {
            namespace: &request.namespace,
            name: &request.name,
            description: &request.description,
            tags: &request.tags,
            folder: &request.folder,
        };
        let response = self.authed(
            self.client
                .post(self.url(format_args!("/workspaces/{}/sessions", request.workspace)))
                .json(&body),
        )
        .send()?;
        let parsed: UpsertSessionResponse = Self::check_status(response)?.json()?;
        Ok((SessionHandle::new(parsed.id), parsed.parameters, parsed.log_count))
    }

    fn append_logs(&self, handle: &SessionHandle, records: &super::LogBatch) -> Result<()> {
        let response = self.authed(
            self.client
                .post(self.url(format_args!("/sessions/{}/logs", handle.id)))
                .json(records),
        )
        .send()?;
        Self::check_status(response)?;
        Ok(())
    }

    fn replace_parameters(&self, handle: &SessionHandle, flat_map: &FieldMap) -> Result<()> {
        let response = self.authed(
            self.client
                .post(self.url(format_args!("/sessions/{}/parameters", handle.id)))
                .json(flat_map),
        )
        .send()?;
        Self::check_status(response)?;
        Ok(())
    }

    fn ensure_track(&self, handle: &SessionHandle, track: &TrackMetadata) -> Result<()> {
        let body = TrackBatchBody {
            metadata: Some(track),
            records: &[],
        };
        let response = self.authed(
            self.client
                .post(self.url(format_args!(
                    "/sessions/{}/tracks/{}/batch",
                    handle.id, track.name
                )))
                .json(&body),
        )
        .send()?;
        Self::check_status(response)?;
        Ok(())
    }

    fn write_track_records(
        &self,
        handle: &SessionHandle,
        track_name: &str,
        records: &[EncodedRecord],
    ) -> Result<()> {
        let body = TrackBatchBody {
            metadata: None,
            records,
        };
        let response = self.authed(
            self.client
                .post(self.url(format_args!(
                    "/sessions/{}/tracks/{}/batch",
                    handle.id, track_name
                )))
                .json(&body),
        )
        .send()?;
        Self::check_status(response)?;
        Ok(())
    }

    fn read_track_range(
        &self,
        handle: &SessionHandle,
        track_name: &str,
        start_index: u64,
        limit: u64,
    ) -> Result<RangeRead> {
        let response = self.authed(
            self.client
                .get(self.url(format_args!("/sessions/{}/tracks/{}", handle.id, track_name)))
                .query(&[("start", start_index), ("limit", limit)]),
        )
        .send()?;
        Ok(Self::check_status(response)?.json()?)
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
        #[derive(Deserialize)]
        struct TimeRangeResponse {
            items: Vec<IndexedPoint>,
        }

        let mut query: Vec<(&str, String)> = vec![
            ("limit", limit.to_string()),
            ("reverse", reverse.to_string()),
        ];
        if let Some(ts) = start_ts {
            query.push(("startTs", ts.to_string()));
        }
        if let Some(ts) = end_ts {
            query.push(("endTs", ts.to_string()));
        }

        let response = self.authed(
            self.client
                .get(self.url(format_args!("/sessions/{}/tracks/{}", handle.id, track_name)))
                .query(&query),
        )
        .send()?;
        let parsed: TimeRangeResponse = Self::check_status(response)?.json()?;
        Ok(parsed.items)
    }

    fn list_tracks(&self, handle: &SessionHandle) -> Result<Vec<TrackMetadata>> {
        let response = self.authed(
            self.client
                .get(self.url(format_args!("/sessions/{}/tracks", handle.id))),
        )
        .send()?;
        Ok(Self::check_status(response)?.json()?)
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

        let metadata_json = serde_json::json!({
            "prefix": prefix,
            "description": description,
            "tags": tags,
            "metadata": metadata,
        });
        let form = multipart::Form::new()
            .text("metadata", metadata_json.to_string())
            .file("file", local_source_path)
            .map_err(Error::from)?;

        let response = self.authed(
            self.client
                .post(self.url(format_args!("/sessions/{}/files", handle.id)))
                .multipart(form),
        )
        .send()?;
        Ok(Self::check_status(response)?.json()?)
    }

    fn list_files(
        &self,
        handle: &SessionHandle,
        prefix: Option<&str>,
        tags: Option<&BTreeSet<String>>,
    ) -> Result<Vec<FileArtifact>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(p) = prefix {
            query.push(("prefix", p.to_string()));
        }
        if let Some(ts) = tags {
            query.push(("tags", ts.iter().cloned().collect::<Vec<_>>().join(",")));
        }

        let response = self.authed(
            self.client
                .get(self.url(format_args!("/sessions/{}/files", handle.id)))
                .query(&query),
        )
        .send()?;
        Ok(Self::check_status(response)?.json()?)
    }

    // Remote sessions may be reopened concurrently — the server arbitrates,
    // so there is nothing process-local to release here.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_token_requires_api_key_or_user_name() {
        let err = RemoteBackend::new("http://localhost:9", None, None).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn dev_token_derivation_is_deterministic_per_call_shape() {
        let a = derive_dev_token("alice").unwrap();
        let b = derive_dev_token("alice").unwrap();
        // Same subject, but `iat` makes each token unique; both must at
        // least be well-formed three-segment JWTs.
        assert_eq!(a.split('.').count(), 3);
        assert_eq!(b.split('.').count(), 3);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let backend = RemoteBackend::new("http://example.test/", None, Some("k")).unwrap();
        assert_eq!(backend.url(format_args!("/x")), "http://example.test/x");
    }
}
