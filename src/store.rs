use std::collections::{btree_map, BTreeMap};
use std::iter::Peekable;
use std::mem::size_of;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use lru::LruCache;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::model::{AggregationKey, PartialRecord, SpilledRecord};
use crate::storage::{SpillMap, SpillSegment};

/// Records in ascending key order, each exactly once.
pub type Drain = Box<dyn Iterator<Item = Result<PartialRecord>> + Send>;

/// Key -> fixed-width vector map that absorbs out-of-order readings.
pub trait VectorStore: Send {
    /// Vector width N.
    fn width(&self) -> usize;

    /// Sets one slot of `key`'s vector, creating the vector on first sight.
    /// A repeated (key, position) overwrites: last write wins.
    fn upsert(&mut self, key: AggregationKey, position: usize, level: f64) -> Result<()>;

    /// Distinct keys held, hot or spilled.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> StoreStats {
        StoreStats { keys: self.len() as u64, ..StoreStats::default() }
    }

    /// Consumes the store. Nothing can be upserted once draining starts.
    fn drain(self: Box<Self>) -> Result<Drain>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub keys: u64,
    pub spilled: u64,
    pub reloaded: u64,
    pub peak_on_disk: u64,
}

impl std::ops::AddAssign for StoreStats {
    fn add_assign(&mut self, other: Self) {
        self.keys += other.keys;
        self.spilled += other.spilled;
        self.reloaded += other.reloaded;
        self.peak_on_disk += other.peak_on_disk;
    }
}

fn check_position(position: usize, width: usize) -> Result<()> {
    if position >= width {
        return Err(Error::SlotOutOfRange { position, width });
    }
    Ok(())
}

/// Approximate heap cost of one hot record, used to turn a byte budget into
/// a record count.
pub fn record_footprint(width: usize) -> usize {
    const ENTRY_OVERHEAD: usize = 64;
    2 * size_of::<AggregationKey>() + width * size_of::<Option<f64>>() + ENTRY_OVERHEAD
}

/// How many records fit in `budget` bytes; at least one.
pub fn hot_capacity(budget: usize, width: usize) -> NonZeroUsize {
    NonZeroUsize::new(budget / record_footprint(width)).unwrap_or(NonZeroUsize::MIN)
}

// --- IN-MEMORY ---

/// Unbounded store. Memory grows with distinct keys, never with readings.
#[derive(Debug)]
pub struct MemoryStore {
    width: usize,
    records: BTreeMap<AggregationKey, Vec<Option<f64>>>,
}

impl MemoryStore {
    pub fn new(width: usize) -> Self {
        Self { width, records: BTreeMap::new() }
    }
}

impl VectorStore for MemoryStore {
    fn width(&self) -> usize {
        self.width
    }

    fn upsert(&mut self, key: AggregationKey, position: usize, level: f64) -> Result<()> {
        check_position(position, self.width)?;
        let width = self.width;
        let slots = self.records.entry(key).or_insert_with(|| vec![None; width]);
        slots[position] = Some(level);
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn drain(self: Box<Self>) -> Result<Drain> {
        Ok(Box::new(
            self.records
                .into_iter()
                .map(|(key, slots)| Ok(PartialRecord { key, slots })),
        ))
    }
}

// --- SPILLING ---

/// Memory-bounded store. Keeps at most `capacity` recently updated records
/// in memory; colder ones move to a spill segment and come back when they
/// are updated again or when the store is drained.
///
/// The segment is only created once the capacity is first exceeded.
pub struct SpillingStore {
    width: usize,
    hot: LruCache<AggregationKey, Vec<Option<f64>>>,
    /// Spilled key -> slot. Ordered so the drain can merge it with the hot set.
    spilled: BTreeMap<AggregationKey, u64>,
    segment: Option<SpillSegment>,
    spill_dir: PathBuf,
    stats: StoreStats,
}

impl SpillingStore {
    pub fn new(width: usize, capacity: NonZeroUsize, spill_dir: PathBuf) -> Self {
        Self {
            width,
            hot: LruCache::new(capacity),
            spilled: BTreeMap::new(),
            segment: None,
            spill_dir,
            stats: StoreStats::default(),
        }
    }

    pub fn with_budget(width: usize, budget: usize, spill_dir: PathBuf) -> Self {
        Self::new(width, hot_capacity(budget, width), spill_dir)
    }

    pub fn capacity(&self) -> usize {
        self.hot.cap().get()
    }

    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    pub fn spilled_len(&self) -> usize {
        self.spilled.len()
    }

    pub fn spill_path(&self) -> Option<PathBuf> {
        self.segment.as_ref().map(SpillSegment::path)
    }

    fn segment(&mut self) -> Result<&mut SpillSegment> {
        if self.segment.is_none() {
            info!(
                capacity = self.hot.cap().get(),
                dir = %self.spill_dir.display(),
                "memory budget reached, spilling cold records to disk"
            );
            self.segment = Some(SpillSegment::create(&self.spill_dir, self.width)?);
        }
        self.segment
            .as_mut()
            .ok_or_else(|| Error::Spill("spill segment unavailable".into()))
    }

    fn reload(&mut self, key: &AggregationKey) -> Result<Option<Vec<Option<f64>>>> {
        let Some(slot) = self.spilled.remove(key) else {
            return Ok(None);
        };
        let segment = self
            .segment
            .as_mut()
            .ok_or_else(|| Error::Spill(format!("key {} is spilled but no segment exists", key.label())))?;
        let record = segment.take(slot)?;
        self.stats.reloaded += 1;
        trace!(beacon = key.beacon_id, slot, "reloaded spilled record");
        Ok(Some(record.slots))
    }

    fn spill(&mut self, key: AggregationKey, slots: Vec<Option<f64>>) -> Result<()> {
        let segment = self.segment()?;
        let slot = segment.write(&SpilledRecord::new(key, slots))?;
        let on_disk = segment.live();
        self.spilled.insert(key, slot);
        self.stats.spilled += 1;
        self.stats.peak_on_disk = self.stats.peak_on_disk.max(on_disk);
        trace!(beacon = key.beacon_id, slot, "spilled cold record");
        Ok(())
    }
}

impl VectorStore for SpillingStore {
    fn width(&self) -> usize {
        self.width
    }

    fn upsert(&mut self, key: AggregationKey, position: usize, level: f64) -> Result<()> {
        check_position(position, self.width)?;

        if let Some(slots) = self.hot.get_mut(&key) {
            slots[position] = Some(level);
            return Ok(());
        }

        let mut slots = match self.reload(&key)? {
            Some(slots) => slots,
            None => vec![None; self.width],
        };
        slots[position] = Some(level);

        if let Some((cold_key, cold_slots)) = self.hot.push(key, slots) {
            if cold_key != key {
                self.spill(cold_key, cold_slots)?;
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.hot.len() + self.spilled.len()
    }

    fn stats(&self) -> StoreStats {
        StoreStats { keys: self.len() as u64, ..self.stats }
    }

    fn drain(mut self: Box<Self>) -> Result<Drain> {
        let mut hot = Vec::with_capacity(self.hot.len());
        while let Some(entry) = self.hot.pop_lru() {
            hot.push(entry);
        }
        hot.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let map = match &self.segment {
            Some(segment) => Some(segment.map()?),
            None => None,
        };
        debug!(
            hot = hot.len(),
            spilled = self.spilled.len(),
            "draining aggregation store"
        );

        let this = *self;
        Ok(Box::new(SpillDrain {
            hot: hot.into_iter().peekable(),
            spilled: this.spilled.into_iter().peekable(),
            map,
            _segment: this.segment,
        }))
    }
}

/// Merges the sorted hot records with the sorted spilled index.
struct SpillDrain {
    hot: Peekable<std::vec::IntoIter<(AggregationKey, Vec<Option<f64>>)>>,
    spilled: Peekable<btree_map::IntoIter<AggregationKey, u64>>,
    map: Option<SpillMap>,
    // Held so the segment file outlives the map and is removed with the drain.
    _segment: Option<SpillSegment>,
}

impl SpillDrain {
    fn read_spilled(&self, slot: u64) -> Result<PartialRecord> {
        self.map
            .as_ref()
            .ok_or_else(|| Error::Spill("spilled records without a segment".into()))?
            .read(slot)
    }
}

impl Iterator for SpillDrain {
    type Item = Result<PartialRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let take_hot = match (self.hot.peek(), self.spilled.peek()) {
            (None, None) => return None,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some((hot_key, _)), Some((spilled_key, _))) => hot_key < spilled_key,
        };

        if take_hot {
            self.hot.next().map(|(key, slots)| Ok(PartialRecord { key, slots }))
        } else {
            let (_, slot) = self.spilled.next()?;
            Some(self.read_spilled(slot))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::parse_timestamp;

    fn key(beacon: i64, minute: u32) -> AggregationKey {
        AggregationKey::new(beacon, parse_timestamp(&format!("1999-06-17 00:{:02}:00", minute)).unwrap())
    }

    fn drained(store: Box<dyn VectorStore>) -> Vec<PartialRecord> {
        store.drain().unwrap().collect::<Result<Vec<_>>>().unwrap()
    }

    fn stores(width: usize, dir: &tempfile::TempDir) -> Vec<Box<dyn VectorStore>> {
        vec![
            Box::new(MemoryStore::new(width)),
            Box::new(SpillingStore::new(width, NonZeroUsize::new(2).unwrap(), dir.path().to_path_buf())),
        ]
    }

    #[test]
    fn creates_lazily_and_leaves_unseen_slots_empty() {
        let dir = tempfile::tempdir().unwrap();
        for mut store in stores(4, &dir) {
            store.upsert(key(1, 0), 2, -50.0).unwrap();
            assert_eq!(store.len(), 1);
            let records = drained(store);
            assert_eq!(records, vec![PartialRecord { key: key(1, 0), slots: vec![None, None, Some(-50.0), None] }]);
        }
    }

    #[test]
    fn last_write_wins_per_slot() {
        let dir = tempfile::tempdir().unwrap();
        for mut store in stores(2, &dir) {
            store.upsert(key(1, 0), 0, -10.0).unwrap();
            store.upsert(key(1, 0), 1, -20.0).unwrap();
            store.upsert(key(1, 0), 0, -30.0).unwrap();
            let records = drained(store);
            assert_eq!(records[0].slots, vec![Some(-30.0), Some(-20.0)]);
        }
    }

    #[test]
    fn out_of_range_position_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        for mut store in stores(3, &dir) {
            let err = store.upsert(key(1, 0), 3, -1.0).unwrap_err();
            assert!(matches!(err, Error::SlotOutOfRange { position: 3, width: 3 }));
            assert!(store.is_empty());
        }
    }

    #[test]
    fn drain_is_sorted_by_key() {
        let dir = tempfile::tempdir().unwrap();
        for mut store in stores(1, &dir) {
            for (beacon, minute) in [(5, 1), (2, 9), (5, 0), (2, 3), (9, 0), (1, 59)] {
                store.upsert(key(beacon, minute), 0, -1.0).unwrap();
            }
            let keys: Vec<_> = drained(store).into_iter().map(|r| r.key).collect();
            let mut sorted = keys.clone();
            sorted.sort();
            assert_eq!(keys, sorted);
            assert_eq!(keys.len(), 6);
        }
    }

    #[test]
    fn cold_records_spill_and_reload_on_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SpillingStore::new(2, NonZeroUsize::new(2).unwrap(), dir.path().to_path_buf());

        store.upsert(key(1, 0), 0, -1.0).unwrap();
        store.upsert(key(2, 0), 0, -2.0).unwrap();
        assert!(store.spill_path().is_none());

        // Third key evicts key 1, the least recently updated.
        store.upsert(key(3, 0), 0, -3.0).unwrap();
        assert_eq!((store.hot_len(), store.spilled_len()), (2, 1));
        assert!(store.spill_path().is_some());

        // Updating key 1 brings it back and pushes key 2 out.
        store.upsert(key(1, 0), 1, -1.5).unwrap();
        assert_eq!((store.hot_len(), store.spilled_len()), (2, 1));

        let stats = store.stats();
        assert_eq!((stats.keys, stats.spilled, stats.reloaded), (3, 2, 1));

        let records = drained(Box::new(store));
        assert_eq!(
            records,
            vec![
                PartialRecord { key: key(1, 0), slots: vec![Some(-1.0), Some(-1.5)] },
                PartialRecord { key: key(2, 0), slots: vec![Some(-2.0), None] },
                PartialRecord { key: key(3, 0), slots: vec![Some(-3.0), None] },
            ]
        );
    }

    #[test]
    fn spill_file_is_removed_after_drain() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SpillingStore::new(1, NonZeroUsize::MIN, dir.path().to_path_buf());
        for beacon in 0..10 {
            store.upsert(key(beacon, 0), 0, -1.0).unwrap();
        }
        let path = store.spill_path().unwrap();
        assert!(path.exists());

        let drain = Box::new(store).drain().unwrap();
        assert_eq!(drain.count(), 10);
        assert!(!path.exists());
    }

    #[test]
    fn spill_file_is_removed_when_store_is_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SpillingStore::new(1, NonZeroUsize::MIN, dir.path().to_path_buf());
        store.upsert(key(1, 0), 0, -1.0).unwrap();
        store.upsert(key(2, 0), 0, -1.0).unwrap();
        let path = store.spill_path().unwrap();
        drop(store);
        assert!(!path.exists());
    }

    #[test]
    fn budget_converts_to_record_capacity() {
        assert_eq!(hot_capacity(0, 6).get(), 1);
        let per_record = record_footprint(6);
        assert_eq!(hot_capacity(per_record * 100, 6).get(), 100);
    }
}
