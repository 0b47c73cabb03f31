use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{RawReading, SourcedReading};

pub const DEFAULT_MAX_RECORD_BYTES: usize = 64 * 1024;
const READ_BUFFER: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Start,
    /// Right after `[`.
    ArrayOpen,
    /// After `,`; a value must follow.
    ArrayValue,
    /// After a value; `,` or `]` must follow.
    ArrayNext,
    /// Whitespace separated objects (one per line or otherwise).
    Stream,
    Done,
}

/// Lazy, forward-only sequence of readings from a JSON array (or a stream of
/// JSON objects). Holds at most one record in memory at a time.
///
/// A record that fails to decode yields `Error::Decode` and the source stays
/// usable; structural damage yields `Error::Framing` and ends the sequence.
pub struct ReadingSource<R> {
    reader: R,
    mode: Mode,
    offset: u64,
    index: u64,
    buf: Vec<u8>,
    max_record_bytes: usize,
}

impl ReadingSource<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        debug!(path = %path.display(), "opened input");
        Ok(Self::new(BufReader::with_capacity(READ_BUFFER, file)))
    }
}

impl<R: BufRead> ReadingSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            mode: Mode::Start,
            offset: 0,
            index: 0,
            buf: Vec::new(),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }

    pub fn with_max_record_bytes(mut self, max: usize) -> Self {
        self.max_record_bytes = max;
        self
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Records framed so far, decodable or not.
    pub fn records_seen(&self) -> u64 {
        self.index
    }

    fn peek(&mut self) -> Result<Option<u8>> {
        let buf = self.reader.fill_buf()?;
        Ok(buf.first().copied())
    }

    fn bump(&mut self) {
        self.reader.consume(1);
        self.offset += 1;
    }

    fn skip_whitespace(&mut self) -> Result<()> {
        while let Some(b) = self.peek()? {
            if !b.is_ascii_whitespace() {
                break;
            }
            self.bump();
        }
        Ok(())
    }

    fn skip_bom(&mut self) -> Result<()> {
        let buf = self.reader.fill_buf()?;
        if buf.starts_with(&[0xEF, 0xBB, 0xBF]) {
            self.reader.consume(3);
            self.offset += 3;
        }
        Ok(())
    }

    fn framing(&self, reason: impl Into<String>) -> Error {
        Error::Framing { offset: self.offset, reason: reason.into() }
    }

    fn push(&mut self, b: u8, start: u64) -> Result<()> {
        if self.buf.len() >= self.max_record_bytes {
            return Err(Error::Framing {
                offset: start,
                reason: format!("record exceeds {} bytes", self.max_record_bytes),
            });
        }
        self.buf.push(b);
        self.bump();
        Ok(())
    }

    /// Copies one JSON value into `buf`, returning its starting offset.
    fn capture_value(&mut self) -> Result<u64> {
        self.buf.clear();
        let start = self.offset;
        let first = self.peek()?.ok_or_else(|| self.framing("unexpected end of input"))?;

        match first {
            b'{' | b'[' => {
                let mut depth = 0usize;
                let mut in_string = false;
                let mut escaped = false;
                loop {
                    let b = self.peek()?.ok_or_else(|| Error::Framing {
                        offset: start,
                        reason: "unexpected end of input inside record".into(),
                    })?;
                    self.push(b, start)?;
                    if in_string {
                        if escaped {
                            escaped = false;
                        } else if b == b'\\' {
                            escaped = true;
                        } else if b == b'"' {
                            in_string = false;
                        }
                        continue;
                    }
                    match b {
                        b'"' => in_string = true,
                        b'{' | b'[' => depth += 1,
                        b'}' | b']' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }
            b'"' => {
                self.push(first, start)?;
                let mut escaped = false;
                loop {
                    let b = self.peek()?.ok_or_else(|| Error::Framing {
                        offset: start,
                        reason: "unterminated string".into(),
                    })?;
                    self.push(b, start)?;
                    if escaped {
                        escaped = false;
                    } else if b == b'\\' {
                        escaped = true;
                    } else if b == b'"' {
                        break;
                    }
                }
            }
            _ => {
                while let Some(b) = self.peek()? {
                    if b.is_ascii_whitespace() || matches!(b, b',' | b']' | b'}' | b'[' | b'{') {
                        break;
                    }
                    self.push(b, start)?;
                }
                if self.buf.is_empty() {
                    return Err(self.framing(format!("unexpected byte {:?}", first as char)));
                }
            }
        }
        Ok(start)
    }

    fn decode(&mut self, start: u64) -> Result<SourcedReading> {
        let index = self.index;
        self.index += 1;
        let raw = serde_json::from_slice::<RawReading>(&self.buf)
            .map_err(|source| Error::Decode { index, offset: start, source })?;
        Ok(SourcedReading { index, offset: start, raw })
    }

    fn finish(&mut self) -> Result<()> {
        self.skip_whitespace()?;
        if self.peek()?.is_some() {
            return Err(self.framing("trailing data after the input array"));
        }
        Ok(())
    }

    fn step(&mut self) -> Result<Option<SourcedReading>> {
        loop {
            match self.mode {
                Mode::Done => return Ok(None),
                Mode::Start => {
                    self.skip_bom()?;
                    self.skip_whitespace()?;
                    match self.peek()? {
                        None => self.mode = Mode::Done,
                        Some(b'[') => {
                            self.bump();
                            self.mode = Mode::ArrayOpen;
                        }
                        Some(b'{') => self.mode = Mode::Stream,
                        Some(_) => return Err(self.framing("expected a JSON array or object")),
                    }
                }
                Mode::ArrayOpen | Mode::ArrayValue => {
                    self.skip_whitespace()?;
                    match self.peek()? {
                        None => return Err(self.framing("unterminated array")),
                        Some(b']') if self.mode == Mode::ArrayOpen => {
                            self.bump();
                            self.finish()?;
                            self.mode = Mode::Done;
                        }
                        Some(b']') => return Err(self.framing("trailing comma before ']'")),
                        Some(_) => {
                            let start = self.capture_value()?;
                            self.mode = Mode::ArrayNext;
                            return self.decode(start).map(Some);
                        }
                    }
                }
                Mode::ArrayNext => {
                    self.skip_whitespace()?;
                    match self.peek()? {
                        None => return Err(self.framing("unterminated array")),
                        Some(b',') => {
                            self.bump();
                            self.mode = Mode::ArrayValue;
                        }
                        Some(b']') => {
                            self.bump();
                            self.finish()?;
                            self.mode = Mode::Done;
                        }
                        Some(_) => return Err(self.framing("expected ',' or ']' between records")),
                    }
                }
                Mode::Stream => {
                    self.skip_whitespace()?;
                    if self.peek()?.is_none() {
                        self.mode = Mode::Done;
                        continue;
                    }
                    let start = self.capture_value()?;
                    return self.decode(start).map(Some);
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for ReadingSource<R> {
    type Item = Result<SourcedReading>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(reading) => reading.map(Ok),
            Err(e) => {
                if !e.is_record_local() {
                    self.mode = Mode::Done;
                }
                Some(Err(e))
            }
        }
    }
}
