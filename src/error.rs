//! Error types returned by every public DreamLake operation.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds a DreamLake operation can fail with.
///
/// Every variant maps directly to one of the error kinds callers are expected
/// to branch on: invalid arguments, a closed session, a missing resource, a
/// local single-writer conflict, a possibly-retryable transport/I/O failure,
/// or persisted data that violates framing/schema invariants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid arguments: non-numeric `_ts`, `_ts=-1` with no prior
    /// timestamp, conflicting session options, an oversized file, a
    /// malformed prefix, and similar caller mistakes.
    #[error("bad input: {0}")]
    BadInput(String),

    /// The session is closed (or was never opened) and cannot be used.
    #[error("session is closed")]
    SessionClosed,

    /// The referenced track, file-id, or session does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A local session lock is already held by another live session.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A network or disk error that may be resolved by retrying.
    #[error("transient error: {0}")]
    Transient(String),

    /// Persisted data violates the framing or schema invariants.
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

impl Error {
    pub(crate) fn bad_input<S: Into<String>>(msg: S) -> Self {
        Error::BadInput(msg.into())
    }

    pub(crate) fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    pub(crate) fn corrupt<S: Into<String>>(msg: S) -> Self {
        Error::Corrupt(msg.into())
    }

    pub(crate) fn conflict<S: Into<String>>(msg: S) -> Self {
        Error::Conflict(msg.into())
    }

    /// True if this error is a best-effort-retryable transport/I/O failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}

#[cfg(feature = "remote")]
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_transient_only_for_transient_variant() {
        assert!(Error::Transient("x".into()).is_transient());
        assert!(!Error::BadInput("x".into()).is_transient());
        assert!(!Error::SessionClosed.is_transient());
    }

    #[test]
    fn io_error_becomes_transient() {
        let io_err = std::io::Error::other("disk full");
        let err: Error = io_err.into();
        assert!(err.is_transient());
    }
}
