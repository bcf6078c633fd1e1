//! Cursor over a single sealed run.

use std::io;

use log::debug;

use crate::error::{Result, SortMergeError};
use crate::posting::{DocId, Posting, Term};
use crate::segment::{
    MIN_RECORD_LEN, RUN_FORMAT_VERSION, RUN_HEADER_LEN, RUN_MAGIC, RUN_TRAILER_LEN, RunHandle,
};
use crate::storage::StorageInput;
use crate::storage::structured::StructReader;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CursorState {
    Unstarted,
    Positioned,
    Exhausted,
    Failed { reason: String, corrupt: bool },
}

/// Pull-based cursor over one sealed run.
///
/// [`advance`](SegmentReader::advance) decodes the next posting and
/// returns `Ok(false)` once the run is consumed and its checksum verified.
/// Truncated or malformed data is reported as
/// [`SortMergeError::CorruptSegment`], never as exhaustion, and a failed
/// reader keeps failing on every later call.
pub struct SegmentReader {
    name: String,
    input: StructReader<Box<dyn StorageInput>>,
    size: u64,
    len: u64,
    read: u64,
    current: Posting,
    state: CursorState,
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("read", &self.read)
            .field("state", &self.state)
            .finish()
    }
}

impl SegmentReader {
    /// Open the run described by `handle`.
    ///
    /// The record count stored in the run must match the handle.
    pub fn open(handle: &RunHandle, input: Box<dyn StorageInput>) -> Result<Self> {
        let reader = Self::open_named(handle.name(), input)?;
        if reader.len != handle.postings {
            return Err(SortMergeError::corrupt(
                handle.name(),
                format!(
                    "run holds {} postings but its handle expects {}",
                    reader.len, handle.postings
                ),
            ));
        }
        Ok(reader)
    }

    /// Open a run by name, trusting the record count in its header.
    pub fn open_named<S: Into<String>>(name: S, input: Box<dyn StorageInput>) -> Result<Self> {
        let name = name.into();
        let size = input.size()?;
        if size < RUN_HEADER_LEN + RUN_TRAILER_LEN {
            return Err(SortMergeError::corrupt(
                name,
                format!("{size} bytes is too short for a run"),
            ));
        }

        let mut input = StructReader::new(input);
        let header = (|| -> io::Result<(u32, u8, u64)> {
            Ok((input.read_u32()?, input.read_u8()?, input.read_u64()?))
        })();
        let (magic, version, len) = header.map_err(|e| classify(&name, "header", e))?;

        if magic != RUN_MAGIC {
            return Err(SortMergeError::corrupt(name, format!("bad magic {magic:#010x}")));
        }
        if version != RUN_FORMAT_VERSION {
            return Err(SortMergeError::corrupt(
                name,
                format!("unsupported format version {version}"),
            ));
        }

        let payload = size - RUN_HEADER_LEN - RUN_TRAILER_LEN;
        if len > payload / MIN_RECORD_LEN {
            return Err(SortMergeError::corrupt(
                name,
                format!("{len} postings cannot fit in {payload} payload bytes"),
            ));
        }

        debug!("Opened run {name} ({len} postings, {size} bytes)");

        Ok(SegmentReader {
            name,
            input,
            size,
            len,
            read: 0,
            current: Posting::new(0, 0),
            state: CursorState::Unstarted,
        })
    }

    /// Decode the next posting.
    ///
    /// Returns `Ok(true)` when a posting is available through
    /// [`current`](Self::current), `Ok(false)` once the run is exhausted.
    /// Calling again after exhaustion keeps returning `Ok(false)`.
    pub fn advance(&mut self) -> Result<bool> {
        match &self.state {
            CursorState::Exhausted => return Ok(false),
            CursorState::Failed { reason, corrupt } => {
                return Err(if *corrupt {
                    SortMergeError::corrupt(&self.name, reason.clone())
                } else {
                    SortMergeError::storage(format!("run {}: {reason}", self.name))
                });
            }
            CursorState::Unstarted | CursorState::Positioned => {}
        }

        if self.read == self.len {
            return self.finish().map(|_| false);
        }

        match self.decode_record() {
            Ok(posting) => {
                self.current = posting;
                self.read += 1;
                self.state = CursorState::Positioned;
                Ok(true)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Advance and return the new current posting, or `None` at the end.
    pub fn next_posting(&mut self) -> Result<Option<Posting>> {
        if self.advance()? {
            Ok(Some(self.current))
        } else {
            Ok(None)
        }
    }

    /// The posting decoded by the last successful `advance`.
    pub fn current(&self) -> Option<Posting> {
        match self.state {
            CursorState::Positioned => Some(self.current),
            _ => None,
        }
    }

    /// Term of the current posting.
    pub fn current_term(&self) -> Option<Term> {
        self.current().map(|p| p.term)
    }

    /// Document of the current posting.
    pub fn current_doc(&self) -> Option<DocId> {
        self.current().map(|p| p.doc)
    }

    /// Storage name of the run.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of postings in the run.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the run holds no postings.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Postings not yet decoded.
    pub fn remaining(&self) -> u64 {
        self.len - self.read
    }

    /// Whether the run has been fully consumed and verified.
    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted
    }

    fn decode_record(&mut self) -> std::result::Result<Posting, SortMergeError> {
        let record = self.read;
        let term_delta = self
            .input
            .read_varint()
            .map_err(|e| classify(&self.name, &format!("record {record}"), e))?;
        let doc_part = self
            .input
            .read_varint()
            .map_err(|e| classify(&self.name, &format!("record {record}"), e))?;

        let term = self.current.term.checked_add(term_delta).ok_or_else(|| {
            SortMergeError::corrupt(&self.name, format!("term overflows in record {record}"))
        })?;
        let doc = if term_delta == 0 {
            self.current.doc.checked_add(doc_part).ok_or_else(|| {
                SortMergeError::corrupt(&self.name, format!("doc overflows in record {record}"))
            })?
        } else {
            doc_part
        };

        Ok(Posting::new(term, doc))
    }

    /// Verify the trailer once every record has been decoded.
    fn finish(&mut self) -> Result<()> {
        let computed = self.input.checksum();
        let stored = match self.input.read_trailer() {
            Ok(stored) => stored,
            Err(e) => return Err(self.fail(classify(&self.name, "checksum trailer", e))),
        };

        if stored != computed {
            let err = SortMergeError::corrupt(
                &self.name,
                format!("checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"),
            );
            return Err(self.fail(err));
        }

        let consumed = self.input.position();
        if consumed != self.size {
            let err = SortMergeError::corrupt(
                &self.name,
                format!("{} trailing bytes after checksum", self.size - consumed),
            );
            return Err(self.fail(err));
        }

        debug!("Run {} exhausted after {} postings", self.name, self.read);
        self.state = CursorState::Exhausted;
        Ok(())
    }

    /// Record a failure so every later call reports it again.
    fn fail(&mut self, err: SortMergeError) -> SortMergeError {
        let (reason, corrupt) = match &err {
            SortMergeError::CorruptSegment { reason, .. } => (reason.clone(), true),
            other => (other.to_string(), false),
        };
        self.state = CursorState::Failed { reason, corrupt };
        err
    }
}

/// Map a decode error onto corruption when the bytes themselves are at fault.
fn classify(name: &str, what: &str, err: io::Error) -> SortMergeError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => SortMergeError::corrupt(name, format!("truncated {what}")),
        io::ErrorKind::InvalidData => {
            SortMergeError::corrupt(name, format!("malformed {what}: {err}"))
        }
        _ => SortMergeError::Io(err),
    }
}

impl Iterator for SegmentReader {
    type Item = Result<Posting>;

    /// Yields each posting, then at most one error.
    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, CursorState::Failed { .. }) {
            return None;
        }
        self.next_posting().transpose()
    }
}
