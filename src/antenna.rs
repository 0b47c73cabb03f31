use std::collections::HashMap;

use crate::error::{Error, Result};

/// Fixed antenna id <-> vector position mapping for one run.
///
/// Built once from configuration and never mutated, so it can be shared
/// across ingestion workers behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntennaIndex {
    order: Vec<i64>,
    positions: HashMap<i64, usize>,
}

impl AntennaIndex {
    pub fn new(order: Vec<i64>) -> Result<Self> {
        if order.is_empty() {
            return Err(Error::EmptyAntennaIndex);
        }

        let mut positions = HashMap::with_capacity(order.len());
        for (position, &antenna_id) in order.iter().enumerate() {
            if positions.insert(antenna_id, position).is_some() {
                return Err(Error::DuplicateAntenna(antenna_id));
            }
        }

        Ok(Self { order, positions })
    }

    pub fn position(&self, antenna_id: i64) -> Option<usize> {
        self.positions.get(&antenna_id).copied()
    }

    /// Vector width N.
    pub fn count(&self) -> usize {
        self.order.len()
    }

    pub fn ids(&self) -> &[i64] {
        &self.order
    }
}
