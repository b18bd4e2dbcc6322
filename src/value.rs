//! The JSON-shaped value type user field maps are built from.
//!
//! DreamLake already depends on `serde_json` for every on-disk JSON file
//! (`session.json`, `parameters.json`, `logs.jsonl`, metadata sidecars), so
//! rather than hand-roll a parallel `{null, bool, integer, real, string,
//! array, map}` tagged union, the crate re-exports `serde_json::Value`
//! directly as `dreamlake::Value` and uses it everywhere a user-supplied
//! field value is expected.

/// A JSON-shaped value: null, bool, number, string, array, or nested map.
pub use serde_json::Value;

/// An ordered field map supplied by the caller (log metadata, track points,
/// parameter updates). Declared as a type alias rather than a newtype so
/// callers can build one with a plain `serde_json::Map` or the `json!` macro.
pub type FieldMap = serde_json::Map<String, Value>;

/// The reserved key every persisted track point carries.
pub const TS_KEY: &str = "_ts";

/// Sentinel value for `_ts` meaning "inherit the session's most recent
/// resolved timestamp".
pub const TS_INHERIT: f64 = -1.0;
