use std::io;

use thiserror::Error;

use crate::timestamp::TimestampError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The input lost its array/object structure; the stream cannot be resumed.
    #[error("malformed input at byte {offset}: {reason}")]
    Framing { offset: u64, reason: String },

    #[error("record #{index} at byte {offset} is malformed: {source}")]
    Decode {
        index: u64,
        offset: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("record #{index} at byte {offset} has a bad timestamp: {source}")]
    Timestamp {
        index: u64,
        offset: u64,
        #[source]
        source: TimestampError,
    },

    #[error("record #{index} at byte {offset} references unknown antenna {antenna_id}")]
    UnknownAntenna {
        antenna_id: i64,
        index: u64,
        offset: u64,
    },

    #[error("antenna {0} appears more than once in the antenna order")]
    DuplicateAntenna(i64),

    #[error("antenna order is empty")]
    EmptyAntennaIndex,

    #[error("slot {position} out of range for a vector of width {width}")]
    SlotOutOfRange { position: usize, width: usize },

    #[error("spill storage: {0}")]
    Spill(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("shard worker failed: {0}")]
    Worker(String),

    #[error("shard queue closed before ingestion finished")]
    ShardClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Failures confined to a single input record. Only these may be skipped.
    pub fn is_record_local(&self) -> bool {
        matches!(self, Error::Decode { .. } | Error::Timestamp { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_decode_and_timestamp_are_record_local() {
        let decode = serde_json::from_str::<u8>("x").unwrap_err();
        assert!(Error::Decode { index: 0, offset: 0, source: decode }.is_record_local());
        assert!(Error::Timestamp {
            index: 3,
            offset: 9,
            source: TimestampError::Syntax("nope".into()),
        }
        .is_record_local());

        assert!(!Error::UnknownAntenna { antenna_id: 7, index: 0, offset: 0 }.is_record_local());
        assert!(!Error::Framing { offset: 0, reason: "eof".into() }.is_record_local());
        assert!(!Error::SlotOutOfRange { position: 9, width: 6 }.is_record_local());
    }

    #[test]
    fn messages_carry_position_context() {
        let err = Error::UnknownAntenna { antenna_id: 999, index: 12, offset: 340 };
        assert_eq!(
            err.to_string(),
            "record #12 at byte 340 references unknown antenna 999"
        );
    }
}
