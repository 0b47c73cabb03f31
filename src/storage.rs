use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use rkyv::{AlignedVec, Deserialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{PartialRecord, SpilledRecord};

// Slot header: [payload length (4b)][reserved (4b)]
const HEADER_LEN: usize = 8;
const SLOT_ALIGN: usize = 16;

/// Disk-backed secondary medium for cold aggregation records.
///
/// Every record has the same width, so the file is an array of fixed-size
/// slots. A slot freed by a reload is overwritten by the next spill, so the
/// file only grows to the peak number of records spilled at once. The file
/// is removed when the segment is dropped.
#[derive(Debug)]
pub struct SpillSegment {
    file: NamedTempFile,
    width: usize,
    slot_len: usize,
    high_water: u64,
    free: Vec<u64>,
    live: u64,
}

impl SpillSegment {
    pub fn create(dir: &Path, width: usize) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("beaconvec-")
            .suffix(".spill")
            .tempfile_in(dir)?;
        let slot_len = slot_len_for(width)?;
        debug!(path = %file.path().display(), width, slot_len, "spill segment created");

        Ok(Self {
            file,
            width,
            slot_len,
            high_water: 0,
            free: Vec::new(),
            live: 0,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Records currently held on disk.
    pub fn live(&self) -> u64 {
        self.live
    }

    /// Slots ever allocated; the file is `capacity * slot_len` bytes.
    pub fn capacity(&self) -> u64 {
        self.high_water
    }

    /// Writes a record into a free slot (or a new one) and returns the slot.
    pub fn write(&mut self, record: &SpilledRecord) -> Result<u64> {
        if record.slots.len() != self.width {
            return Err(Error::SlotOutOfRange { position: record.slots.len(), width: self.width });
        }
        let bytes = rkyv::to_bytes::<_, 256>(record).map_err(|e| Error::Spill(e.to_string()))?;
        if HEADER_LEN + bytes.len() > self.slot_len {
            return Err(Error::Spill(format!(
                "encoded record of {} bytes does not fit a {} byte slot",
                bytes.len(),
                self.slot_len
            )));
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.high_water += 1;
                self.high_water - 1
            }
        };

        let mut frame = vec![0u8; self.slot_len];
        frame[..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        frame[HEADER_LEN..HEADER_LEN + bytes.len()].copy_from_slice(&bytes);

        let file = self.file.as_file_mut();
        file.seek(SeekFrom::Start(slot * self.slot_len as u64))?;
        file.write_all(&frame)?;

        self.live += 1;
        Ok(slot)
    }

    /// Reads a record back and frees its slot for reuse.
    pub fn take(&mut self, slot: u64) -> Result<SpilledRecord> {
        let mut frame = vec![0u8; self.slot_len];
        let mut file: &File = self.file.as_file();
        file.seek(SeekFrom::Start(slot * self.slot_len as u64))?;
        file.read_exact(&mut frame)?;

        let record = decode_slot(&frame)?;
        self.free.push(slot);
        self.live -= 1;
        Ok(record)
    }

    /// Read-only view of every slot, for the final drain.
    pub fn map(&self) -> Result<SpillMap> {
        let file = self.file.as_file();
        let mmap = if self.high_water == 0 {
            None
        } else {
            // The segment is owned exclusively by this store and is not
            // written while the map is alive.
            Some(unsafe { Mmap::map(file)? })
        };
        Ok(SpillMap { mmap, slot_len: self.slot_len })
    }
}

/// Memory map over a spill segment.
pub struct SpillMap {
    mmap: Option<Mmap>,
    slot_len: usize,
}

impl SpillMap {
    pub fn read(&self, slot: u64) -> Result<PartialRecord> {
        let start = slot as usize * self.slot_len;
        let frame = self
            .mmap
            .as_ref()
            .and_then(|m| m.get(start..start + self.slot_len))
            .ok_or_else(|| Error::Spill(format!("slot {} is beyond the end of the segment", slot)))?;
        decode_slot(frame)?.into_partial()
    }
}

fn slot_len_for(width: usize) -> Result<usize> {
    let template = SpilledRecord {
        beacon_id: 0,
        timestamp_ms: 0,
        slots: vec![Some(0.0); width],
    };
    let encoded = rkyv::to_bytes::<_, 256>(&template).map_err(|e| Error::Spill(e.to_string()))?;
    Ok((HEADER_LEN + encoded.len()).div_ceil(SLOT_ALIGN) * SLOT_ALIGN)
}

fn decode_slot(frame: &[u8]) -> Result<SpilledRecord> {
    let mut len_buf = [0u8; 4];
    len_buf.copy_from_slice(&frame[..4]);
    let len = u32::from_le_bytes(len_buf) as usize;
    let payload = frame
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or_else(|| Error::Spill(format!("corrupt slot header (length {})", len)))?;

    let mut aligned = AlignedVec::with_capacity(payload.len());
    aligned.extend_from_slice(payload);

    let archived = rkyv::check_archived_root::<SpilledRecord>(&aligned)
        .map_err(|e| Error::Spill(e.to_string()))?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|e| match e {})
}
