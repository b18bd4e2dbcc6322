//! `SessionBuilder`: fluent construction mirroring `spatio::builder::DBBuilder`'s
//! `with_*`/bare-method chaining into a single terminal `.open()`.

use crate::backend::{Backend, LocalBackend, SessionOpenRequest};
use crate::error::{Error, Result};
use crate::session::Session;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

const ENV_LOCAL_PATH: &str = "DREAMLAKE_LOCAL_PATH";
const ENV_API_URL: &str = "DREAMLAKE_API_URL";
const ENV_API_KEY: &str = "DREAMLAKE_API_KEY";

/// Builds a [`Session`], choosing between a local directory tree and a
/// remote HTTP service for its backing store.
#[derive(Debug, Default, Clone)]
pub struct SessionBuilder {
    namespace: Option<String>,
    workspace: Option<String>,
    name: Option<String>,
    local_path: Option<PathBuf>,
    remote_url: Option<String>,
    user_name: Option<String>,
    api_key: Option<String>,
    description: Option<String>,
    tags: BTreeSet<String>,
    folder: Option<String>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `local_path`/`remote_url`/`api_key` from `DREAMLAKE_LOCAL_PATH`,
    /// `DREAMLAKE_API_URL`, and `DREAMLAKE_API_KEY` respectively. Any value
    /// set explicitly afterwards on the returned builder overrides it.
    pub fn from_env() -> Self {
        let mut builder = Self::new();
        if let Ok(path) = std::env::var(ENV_LOCAL_PATH) {
            builder.local_path = Some(PathBuf::from(path));
        }
        if let Ok(url) = std::env::var(ENV_API_URL) {
            builder.remote_url = Some(url);
        }
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            builder.api_key = Some(key);
        }
        builder
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Selects [`LocalBackend`], rooted at `path`.
    pub fn local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    /// Selects a remote backend, pointed at `url`. Requires the `remote`
    /// feature.
    pub fn remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    /// Development-mode bearer token derivation source. Ignored if `api_key`
    /// is also set.
    pub fn user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    /// Explicit bearer token for the remote backend.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Validates the accumulated options, builds the selected backend, and
    /// opens the session.
    pub fn open(self) -> Result<Session> {
        let workspace = self
            .workspace
            .ok_or_else(|| Error::bad_input("session requires a workspace"))?;
        let name = self
            .name
            .ok_or_else(|| Error::bad_input("session requires a name"))?;

        let backend: Arc<dyn Backend> = match (self.local_path, self.remote_url) {
            (Some(_), Some(_)) => {
                return Err(Error::bad_input(
                    "supplying both local_path and remote_url is not allowed",
                ))
            }
            (None, None) => {
                return Err(Error::bad_input(
                    "session requires either local_path or remote_url",
                ))
            }
            (Some(path), None) => Arc::new(LocalBackend::new(path)?),
            (None, Some(url)) => {
                new_remote_backend(url, self.user_name.as_deref(), self.api_key.as_deref())?
            }
        };

        Session::open(
            backend,
            SessionOpenRequest {
                namespace: self.namespace,
                workspace,
                name,
                description: self.description,
                tags: self.tags,
                folder: self.folder,
            },
        )
    }
}

#[cfg(feature = "remote")]
fn new_remote_backend(
    url: String,
    user_name: Option<&str>,
    api_key: Option<&str>,
) -> Result<Arc<dyn Backend>> {
    Ok(Arc::new(crate::backend::RemoteBackend::new(
        url, user_name, api_key,
    )?))
}

#[cfg(not(feature = "remote"))]
fn new_remote_backend(
    _url: String,
    _user_name: Option<&str>,
    _api_key: Option<&str>,
) -> Result<Arc<dyn Backend>> {
    Err(Error::bad_input(
        "remote_url requires the 'remote' feature to be enabled",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_name_and_workspace() {
        let err = SessionBuilder::new()
            .local_path(std::env::temp_dir())
            .open()
            .unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn conflicting_backends_is_bad_input() {
        let err = SessionBuilder::new()
            .workspace("demo")
            .name("s1")
            .local_path(std::env::temp_dir())
            .remote_url("http://localhost:9")
            .open()
            .unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn missing_backend_selection_is_bad_input() {
        let err = SessionBuilder::new()
            .workspace("demo")
            .name("s1")
            .open()
            .unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn local_backend_opens_successfully() {
        let tmp = tempfile::tempdir().unwrap();
        let session = SessionBuilder::new()
            .workspace("demo")
            .name("s2")
            .local_path(tmp.path())
            .description("a run")
            .tag("baseline")
            .open()
            .unwrap();
        session.close().unwrap();
    }
}
