//! The track engine: timestamp resolution, in-memory buffering,
//! same-timestamp merging, and the row/columnar encoding policy described in
//! the data model's Track/DataPoint invariants.

use crate::error::{Error, Result};
use crate::value::{FieldMap, Value, TS_INHERIT, TS_KEY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// One record as it is about to be written to a backend: either a single
/// row (one logical point) or a columnar block (N logical points
/// transposed into per-field arrays of length N).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EncodedRecord {
    Row(FieldMap),
    Columnar(ColumnarBlock),
}

/// A columnar block: every value is an array of equal length N, one of whose
/// keys is `_ts`. Point *j* is `{k: block[k][j] for k in block}`.
pub type ColumnarBlock = std::collections::BTreeMap<String, Vec<Value>>;

/// In-memory, per-track append buffer. Owned exclusively by the `Session`
/// that created it; flushed on explicit request, before any read, on
/// session close, or once it crosses [`Self::flush_threshold`] points.
#[derive(Debug, Default)]
pub struct TrackBuffer {
    points: Vec<FieldMap>,
}

impl TrackBuffer {
    /// Points buffered past this size are flushed eagerly by the session.
    pub const DEFAULT_FLUSH_THRESHOLD: usize = 1000;

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push(&mut self, point: FieldMap) {
        self.points.push(point);
    }

    pub fn push_many(&mut self, points: impl IntoIterator<Item = FieldMap>) {
        self.points.extend(points);
    }

    /// Drains the buffer, merging points with identical `_ts` into a single
    /// point each (later appends win on conflicting fields), and returns the
    /// encoding the writer should use: a row for a single merged point, a
    /// columnar block for two or more.
    pub fn drain_encoded(&mut self) -> Option<EncodedRecord> {
        merge_and_encode(self.points.drain(..).collect())
    }

    /// Takes ownership of every buffered point without merging, leaving the
    /// buffer empty. Used by the flush path, which must be able to put the
    /// points back if the backend write fails.
    pub fn take_points(&mut self) -> Vec<FieldMap> {
        std::mem::take(&mut self.points)
    }

    /// Puts previously taken points back at the front of the buffer, ahead
    /// of anything appended in the meantime.
    pub fn restore(&mut self, mut points: Vec<FieldMap>) {
        points.append(&mut self.points);
        self.points = points;
    }
}

/// Merges points with identical `_ts` and encodes the result as a row or
/// columnar block, or `None` if `points` is empty.
pub fn merge_and_encode(points: Vec<FieldMap>) -> Option<EncodedRecord> {
    if points.is_empty() {
        return None;
    }
    Some(encode_points(merge_by_timestamp(points)))
}

/// Groups points by exact `_ts` equality, preserving first-appearance order
/// of each group, and collapses each group into one point where later
/// appends overwrite earlier ones field-by-field.
fn merge_by_timestamp(points: Vec<FieldMap>) -> Vec<FieldMap> {
    let mut order: Vec<u64> = Vec::new();
    let mut groups: std::collections::HashMap<u64, FieldMap> = std::collections::HashMap::new();

    for point in points {
        let ts_bits = ts_bits_of(&point);
        match groups.get_mut(&ts_bits) {
            Some(existing) => {
                for (k, v) in point {
                    existing.insert(k, v);
                }
            }
            None => {
                order.push(ts_bits);
                groups.insert(ts_bits, point);
            }
        }
    }

    order
        .into_iter()
        .map(|bits| groups.remove(&bits).expect("group present for every order entry"))
        .collect()
}

fn ts_bits_of(point: &FieldMap) -> u64 {
    point
        .get(TS_KEY)
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .to_bits()
}

/// A single merged point encodes as a row; two or more encode as one
/// columnar block with the union of field keys across all points, filling
/// gaps with JSON `null`.
fn encode_points(mut points: Vec<FieldMap>) -> EncodedRecord {
    if points.len() == 1 {
        return EncodedRecord::Row(points.pop().expect("checked len == 1"));
    }

    let mut keys: BTreeSet<String> = BTreeSet::new();
    for point in &points {
        keys.extend(point.keys().cloned());
    }

    let mut block: ColumnarBlock = ColumnarBlock::new();
    for key in &keys {
        block.insert(key.clone(), Vec::with_capacity(points.len()));
    }
    for point in &points {
        for key in &keys {
            let value = point.get(key).cloned().unwrap_or(Value::Null);
            block.get_mut(key).expect("key inserted above").push(value);
        }
    }

    EncodedRecord::Columnar(block)
}

/// Classifies a raw JSON value decoded from the MessagePack stream as a row
/// or a columnar block.
///
/// `#[serde(untagged)]` cannot be trusted to make this distinction on its
/// own: a columnar block is structurally just a JSON object whose values
/// happen to be arrays, which a `FieldMap` (`Map<String, Value>`) would also
/// happily deserialize as a row of array-valued fields. The discriminator
/// the format actually relies on is the shape of the `_ts` entry: an array
/// means a transposed block of N points, anything else means one point.
pub fn classify_record(value: Value) -> Result<EncodedRecord> {
    let Value::Object(obj) = value else {
        return Err(Error::corrupt("track record is not a JSON object"));
    };

    match obj.get(TS_KEY) {
        Some(Value::Array(_)) => {
            let mut block = ColumnarBlock::new();
            for (key, value) in obj {
                let Value::Array(column) = value else {
                    return Err(Error::corrupt(format!(
                        "columnar field '{key}' is not an array"
                    )));
                };
                block.insert(key, column);
            }
            Ok(EncodedRecord::Columnar(block))
        }
        Some(_) => Ok(EncodedRecord::Row(obj)),
        None => Err(Error::corrupt("track record missing _ts field")),
    }
}

/// Expands an [`EncodedRecord`] into its logical points, in the order they
/// would have been read back (row order, or row-major iteration of a
/// columnar block).
pub fn expand_record(record: EncodedRecord) -> Vec<FieldMap> {
    match record {
        EncodedRecord::Row(point) => vec![point],
        EncodedRecord::Columnar(block) => {
            let len = block.values().next().map(Vec::len).unwrap_or(0);
            (0..len)
                .map(|j| {
                    block
                        .iter()
                        .map(|(k, column)| (k.clone(), column[j].clone()))
                        .collect()
                })
                .collect()
        }
    }
}

/// Resolves the `_ts` field of an incoming point per the inheritance table:
/// absent -> wall clock now; finite number -> used as-is; exact sentinel
/// `-1` -> inherit `last_ts`; anything else -> `BadInput`.
///
/// `last_ts` is threaded through by the caller, which holds the session
/// mutex for the duration (this function does no locking of its own).
pub fn resolve_timestamp(fields: &mut FieldMap, last_ts: &mut Option<f64>) -> Result<()> {
    let incoming = fields.remove(TS_KEY);

    let resolved = match incoming {
        None => now_secs(),
        Some(Value::Number(n)) => {
            let v = n.as_f64().ok_or_else(|| {
                Error::bad_input(format!("_ts {n} is not representable as a real number"))
            })?;
            if v == TS_INHERIT {
                match *last_ts {
                    Some(prev) => prev,
                    None => {
                        return Err(Error::bad_input("no previous timestamp to inherit"));
                    }
                }
            } else {
                v
            }
        }
        Some(other) => {
            return Err(Error::bad_input(format!(
                "_ts must be a number, got {other}"
            )));
        }
    };

    fields.insert(TS_KEY.to_string(), Value::from(resolved));
    *last_ts = Some(resolved);
    Ok(())
}

pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(ts: f64, extra: &[(&str, Value)]) -> FieldMap {
        let mut m = FieldMap::new();
        m.insert(TS_KEY.to_string(), Value::from(ts));
        for (k, v) in extra {
            m.insert((*k).to_string(), v.clone());
        }
        m
    }

    #[test]
    fn absent_ts_assigns_now_and_updates_last() {
        let mut fields = FieldMap::new();
        fields.insert("value".into(), json!(0.5));
        let mut last = None;
        resolve_timestamp(&mut fields, &mut last).unwrap();
        assert!(last.is_some());
        assert!(fields.get(TS_KEY).unwrap().as_f64().unwrap() > 0.0);
    }

    #[test]
    fn sentinel_inherits_last_timestamp() {
        let mut last = Some(42.0);
        let mut fields = FieldMap::new();
        fields.insert(TS_KEY.into(), json!(-1.0));
        resolve_timestamp(&mut fields, &mut last).unwrap();
        assert_eq!(fields.get(TS_KEY).unwrap().as_f64().unwrap(), 42.0);
    }

    #[test]
    fn sentinel_without_prior_timestamp_fails() {
        let mut last = None;
        let mut fields = FieldMap::new();
        fields.insert(TS_KEY.into(), json!(-1.0));
        let err = resolve_timestamp(&mut fields, &mut last).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn non_numeric_ts_fails() {
        let mut last = None;
        let mut fields = FieldMap::new();
        fields.insert(TS_KEY.into(), json!("not-a-number"));
        let err = resolve_timestamp(&mut fields, &mut last).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn single_point_encodes_as_row() {
        let mut buf = TrackBuffer::default();
        buf.push(point(1.0, &[("value", json!(0.5))]));
        match buf.drain_encoded().unwrap() {
            EncodedRecord::Row(p) => assert_eq!(p.get("value").unwrap(), &json!(0.5)),
            EncodedRecord::Columnar(_) => panic!("expected row encoding"),
        }
    }

    #[test]
    fn merge_collapses_same_timestamp_points() {
        let mut buf = TrackBuffer::default();
        buf.push(point(1.0, &[("q", json!([0.1, 0.2]))]));
        buf.push(point(1.0, &[("v", json!([0.01, 0.02]))]));
        buf.push(point(1.0, &[("e", json!([0.5, 0.6, 0.7]))]));

        match buf.drain_encoded().unwrap() {
            EncodedRecord::Row(p) => {
                assert_eq!(p.get(TS_KEY).unwrap(), &json!(1.0));
                assert_eq!(p.get("q").unwrap(), &json!([0.1, 0.2]));
                assert_eq!(p.get("v").unwrap(), &json!([0.01, 0.02]));
                assert_eq!(p.get("e").unwrap(), &json!([0.5, 0.6, 0.7]));
            }
            EncodedRecord::Columnar(_) => panic!("expected single merged row"),
        }
    }

    #[test]
    fn distinct_timestamps_merge_into_columnar_block() {
        let mut buf = TrackBuffer::default();
        buf.push(point(1.0, &[("v", json!(10))]));
        buf.push(point(2.0, &[("v", json!(20))]));
        buf.push(point(3.0, &[("v", json!(30))]));

        let record = buf.drain_encoded().unwrap();
        match &record {
            EncodedRecord::Columnar(block) => {
                assert_eq!(block.get(TS_KEY).unwrap(), &vec![json!(1.0), json!(2.0), json!(3.0)]);
                assert_eq!(block.get("v").unwrap(), &vec![json!(10), json!(20), json!(30)]);
            }
            EncodedRecord::Row(_) => panic!("expected columnar encoding"),
        }

        let points = expand_record(record);
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].get("v").unwrap(), &json!(10));
        assert_eq!(points[2].get(TS_KEY).unwrap(), &json!(3.0));
    }

    #[test]
    fn columnar_block_fills_missing_fields_with_null() {
        let mut buf = TrackBuffer::default();
        buf.push(point(1.0, &[("a", json!(1))]));
        buf.push(point(2.0, &[("b", json!(2))]));

        let record = buf.drain_encoded().unwrap();
        let points = expand_record(record);
        assert_eq!(points[0].get("b").unwrap(), &Value::Null);
        assert_eq!(points[1].get("a").unwrap(), &Value::Null);
    }

    #[test]
    fn empty_buffer_drains_to_none() {
        let mut buf = TrackBuffer::default();
        assert!(buf.drain_encoded().is_none());
    }

    #[test]
    fn classify_record_distinguishes_row_from_columnar() {
        let row = json!({"_ts": 1.0, "value": 0.5});
        assert!(matches!(classify_record(row).unwrap(), EncodedRecord::Row(_)));

        let columnar = json!({"_ts": [1.0, 2.0], "v": [10, 20]});
        assert!(matches!(
            classify_record(columnar).unwrap(),
            EncodedRecord::Columnar(_)
        ));
    }

    #[test]
    fn classify_record_rejects_missing_ts() {
        let value = json!({"value": 0.5});
        assert!(classify_record(value).is_err());
    }
}
