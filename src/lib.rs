//! DreamLake: a client SDK for recording machine-learning and robotics
//! experiment telemetry.
//!
//! A [`Session`] is opened against either a local directory tree or a
//! remote HTTP service and then used to emit logs, a flat parameter map,
//! named [`Track`]s of timestamped records, and file artifacts:
//!
//! ```no_run
//! use dreamlake::{SessionBuilder, LogLevel};
//! use serde_json::json;
//!
//! # fn main() -> dreamlake::Result<()> {
//! let session = SessionBuilder::new()
//!     .workspace("demo")
//!     .name("run-1")
//!     .local_path("/tmp/dreamlake")
//!     .open()?;
//!
//! session.log("starting run", LogLevel::Info, None)?;
//! session.track("loss").append(
//!     serde_json::from_value(json!({"value": 0.5, "epoch": 1})).unwrap(),
//! )?;
//! session.params.set(serde_json::from_value(json!({"lr": 0.01})).unwrap())?;
//! session.close()?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod builder;
mod error;
mod params;
mod session;
mod track;
mod types;
mod value;

pub use backend::{Backend, LocalBackend, SessionOpenRequest};
#[cfg(feature = "remote")]
pub use backend::RemoteBackend;
pub use builder::SessionBuilder;
pub use error::{Error, Result};
pub use session::{Params, Session, SessionGuard, Track, Tracks};
pub use track::EncodedRecord;
pub use types::{
    FileArtifact, IndexedPoint, LogLevel, LogRecord, RangeRead, SessionHandle, SessionRecord,
    TrackMetadata,
};
pub use value::{FieldMap, Value};

/// Commonly used types, for a single glob import.
pub mod prelude {
    pub use crate::{
        Error, FieldMap, LogLevel, Result, Session, SessionBuilder, SessionGuard, Track, Value,
    };
}
