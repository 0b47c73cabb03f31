use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::VectorRecord;

/// Receives finalized records. `finish` is called once after the last one.
pub trait ResultSink {
    fn accept(&mut self, record: VectorRecord) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl ResultSink for Vec<VectorRecord> {
    fn accept(&mut self, record: VectorRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

/// Streams records into a JSON array report.
///
/// Records are written to a temporary file next to the target and the file is
/// renamed into place by `finish`. A report that is dropped unfinished leaves
/// nothing behind.
pub struct JsonReport {
    path: PathBuf,
    out: Option<BufWriter<NamedTempFile>>,
    written: u64,
}

impl JsonReport {
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        let tmp = tempfile::Builder::new()
            .prefix(".beaconvec-")
            .suffix(".partial")
            .tempfile_in(dir)?;
        let mut out = BufWriter::new(tmp);
        out.write_all(b"[\n")?;

        let path = dir.join(name);
        debug!(path = %path.display(), "report opened");
        Ok(Self { path, out: Some(out), written: 0 })
    }

    fn writer(&mut self) -> Result<&mut BufWriter<NamedTempFile>> {
        self.out
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::Other, "report already finished")))
    }
}

impl ResultSink for JsonReport {
    fn accept(&mut self, record: VectorRecord) -> Result<()> {
        let first = self.written == 0;
        let out = self.writer()?;
        if !first {
            out.write_all(b",\n")?;
        }
        let mut ser = serde_json::Serializer::with_formatter(&mut *out, PrettyFormatter::with_indent(b"    "));
        record.serialize(&mut ser).map_err(io::Error::from)?;

        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let mut out = self
            .out
            .take()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::Other, "report already finished")))?;
        out.write_all(b"\n]\n")?;
        let tmp = out.into_inner().map_err(|e| e.into_error())?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        info!(path = %self.path.display(), records = self.written, "report written");
        Ok(())
    }
}
