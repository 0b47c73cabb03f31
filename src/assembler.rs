use crate::model::{PartialRecord, VectorRecord};

/// Level written for an antenna that produced no reading, in dBm.
pub const DEFAULT_LEVEL: f64 = -135.0;

/// Turns drained partial records into report records. The only place where
/// a missing slot becomes the sentinel level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorAssembler {
    default_level: f64,
}

impl Default for VectorAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl VectorAssembler {
    pub fn new(default_level: f64) -> Self {
        Self { default_level }
    }

    pub fn assemble(&self, record: PartialRecord) -> VectorRecord {
        let vector = record
            .slots
            .into_iter()
            .map(|slot| slot.unwrap_or(self.default_level))
            .collect();

        VectorRecord {
            beacon: record.key.label(),
            key: record.key,
            vector,
        }
    }
}
