use chrono::{DateTime, Utc};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::timestamp::format_timestamp;

/// One input element, exactly as it appears on the wire.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RawReading {
    #[serde(rename = "BeaconId")]
    pub beacon_id: i64,
    pub ant_id: i64,
    pub dbm_ant: f64,
    pub timestamp: String,
}

/// A decoded reading plus where it came from in the input.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedReading {
    pub index: u64,
    pub offset: u64,
    pub raw: RawReading,
}

/// Grouping identity. Ordered by beacon, then instant; this is the drain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregationKey {
    pub beacon_id: i64,
    pub timestamp: DateTime<Utc>,
}

impl AggregationKey {
    pub fn new(beacon_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self { beacon_id, timestamp }
    }

    /// `"<beacon>, <ISO-8601 UTC millis>Z"`, the report's `beacon` field.
    pub fn label(&self) -> String {
        format!("{}, {}", self.beacon_id, format_timestamp(&self.timestamp))
    }

    /// Stable byte form, used for shard routing.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.beacon_id.to_le_bytes());
        out[8..].copy_from_slice(&self.timestamp.timestamp_millis().to_le_bytes());
        out
    }
}

/// Accumulated slots for one key. `None` means no antenna reading was seen;
/// the sentinel default is only substituted by the assembler.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialRecord {
    pub key: AggregationKey,
    pub slots: Vec<Option<f64>>,
}

/// A finalized result, ready for a sink.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct VectorRecord {
    #[serde(skip)]
    pub key: AggregationKey,
    pub beacon: String,
    #[serde(serialize_with = "serialize_levels")]
    pub vector: Vec<f64>,
}

/// Whole levels (notably the sentinel) are written as JSON integers.
fn serialize_levels<S: Serializer>(levels: &[f64], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;

    const EXACT_INT: f64 = 9_007_199_254_740_992.0; // 2^53
    let mut seq = serializer.serialize_seq(Some(levels.len()))?;
    for &level in levels {
        if level.is_finite() && level.fract() == 0.0 && level.abs() < EXACT_INT {
            seq.serialize_element(&(level as i64))?;
        } else {
            seq.serialize_element(&level)?;
        }
    }
    seq.end()
}

/// On-disk form of a cold record inside a spill slot.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct SpilledRecord {
    pub beacon_id: i64,
    /// Unix milliseconds, UTC.
    pub timestamp_ms: i64,
    pub slots: Vec<Option<f64>>,
}

impl SpilledRecord {
    pub fn new(key: AggregationKey, slots: Vec<Option<f64>>) -> Self {
        Self {
            beacon_id: key.beacon_id,
            timestamp_ms: key.timestamp.timestamp_millis(),
            slots,
        }
    }

    pub fn into_partial(self) -> Result<PartialRecord> {
        let timestamp = DateTime::from_timestamp_millis(self.timestamp_ms)
            .ok_or_else(|| Error::Spill(format!("corrupt timestamp {} in spilled record", self.timestamp_ms)))?;
        Ok(PartialRecord {
            key: AggregationKey::new(self.beacon_id, timestamp),
            slots: self.slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::parse_timestamp;

    fn key(beacon: i64, ts: &str) -> AggregationKey {
        AggregationKey::new(beacon, parse_timestamp(ts).unwrap())
    }

    #[test]
    fn raw_reading_uses_wire_field_names() {
        let raw: RawReading = serde_json::from_str(
            r#"{"BeaconId":113,"ant_id":202,"dbm_ant":-58.97817436922068,"timestamp":"2016-11-22T09:48:00.00Z"}"#,
        )
        .unwrap();
        assert_eq!(raw.beacon_id, 113);
        assert_eq!(raw.ant_id, 202);
        assert_eq!(raw.dbm_ant, -58.97817436922068);
    }

    #[test]
    fn raw_reading_requires_every_field() {
        let missing = serde_json::from_str::<RawReading>(r#"{"BeaconId":1,"ant_id":2,"timestamp":"x"}"#);
        assert!(missing.is_err());
        let mistyped = serde_json::from_str::<RawReading>(r#"{"BeaconId":"a","ant_id":2,"dbm_ant":1.0,"timestamp":"x"}"#);
        assert!(mistyped.is_err());
    }

    #[test]
    fn keys_order_by_beacon_then_time() {
        let mut keys = vec![
            key(303, "1999-06-17 00:12:00"),
            key(101, "1999-06-17 00:12:00"),
            key(101, "1999-06-17 00:11:00"),
        ];
        keys.sort();
        assert_eq!(keys[0], key(101, "1999-06-17 00:11:00"));
        assert_eq!(keys[2].beacon_id, 303);
    }

    #[test]
    fn label_matches_report_format() {
        assert_eq!(key(101, "1999-06-17 00:11:00").label(), "101, 1999-06-17T00:11:00.000Z");
    }

    #[test]
    fn record_serializes_whole_levels_as_integers() {
        let record = VectorRecord {
            key: key(1, "2000-01-01 00:00:00"),
            beacon: "1, 2000-01-01T00:00:00.000Z".into(),
            vector: vec![-135.0, -77.80792406374334, 0.0],
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"beacon":"1, 2000-01-01T00:00:00.000Z","vector":[-135,-77.80792406374334,0]}"#);
    }

    #[test]
    fn spilled_record_restores_key() {
        let original = key(42, "2010-10-10 10:10:10.123");
        let partial = SpilledRecord::new(original, vec![Some(-1.5), None])
            .into_partial()
            .unwrap();
        assert_eq!(partial.key, original);
        assert_eq!(partial.slots, vec![Some(-1.5), None]);
    }
}
