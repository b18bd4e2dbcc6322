//! Nested-map flattening to dotted keys, grounded on
//! `spatio::namespace::Namespace::key`'s dotted/prefixed key composition.

use crate::value::{FieldMap, Value};

/// Flattens a nested map into dotted-key leaves. A value that is itself a
/// non-empty JSON object descends with its key joined to the accumulated
/// prefix by a dot; every other JSON shape, including arrays and empty
/// objects, terminates the descent and becomes a leaf as-is — an empty
/// object has no keys to join into, so descending into it would silently
/// drop the key the caller set.
pub fn flatten(map: FieldMap) -> FieldMap {
    let mut out = FieldMap::new();
    flatten_into(String::new(), map, &mut out);
    out
}

fn flatten_into(prefix: String, map: FieldMap, out: &mut FieldMap) {
    for (key, value) in map {
        let joined = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(nested) if !nested.is_empty() => flatten_into(joined, nested, out),
            leaf => {
                out.insert(joined, leaf);
            }
        }
    }
}
