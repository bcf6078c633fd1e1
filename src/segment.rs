//! Sealed runs: their on-storage format, writer, reader and store.
//!
//! A run is an immutable, sorted sequence of postings persisted as one
//! storage file:
//!
//! ```text
//! magic    u32 LE   "SMR1"
//! version  u8
//! count    u64 LE   number of records
//! records  count x (term delta varint, doc varint)
//! crc32    u32 LE   over every byte above
//! ```
//!
//! Document ids are delta-coded within a term and absolute at each term
//! change. Both deltas start from (0, 0).

use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::posting::Posting;
use crate::storage::structured::StructWriter;

pub mod reader;
pub mod store;
pub mod writer;

pub use reader::SegmentReader;
pub use store::{MemoryRuns, RunStore};
pub use writer::{SealHandler, SegmentWriter, SegmentWriterConfig};

/// Magic number at the start of every run.
pub const RUN_MAGIC: u32 = u32::from_le_bytes(*b"SMR1");

/// Current run format version.
pub const RUN_FORMAT_VERSION: u8 = 1;

/// Bytes taken by magic, version and count.
pub const RUN_HEADER_LEN: u64 = 4 + 1 + 8;

/// Bytes taken by the checksum trailer.
pub const RUN_TRAILER_LEN: u64 = 4;

/// Smallest possible encoded record (two one-byte varints).
pub const MIN_RECORD_LEN: u64 = 2;

/// File extension used for runs.
pub const RUN_EXTENSION: &str = "smr";

/// Identifies a sealed run and how many postings it holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunHandle {
    /// Storage file name of the run.
    pub name: String,
    /// Number of postings in the run.
    pub postings: u64,
}

impl RunHandle {
    /// Create a new handle.
    pub fn new<S: Into<String>>(name: S, postings: u64) -> Self {
        RunHandle {
            name: name.into(),
            postings,
        }
    }

    /// Storage file name of the run.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of postings in the run.
    pub fn len(&self) -> u64 {
        self.postings
    }

    /// Whether the run holds no postings.
    pub fn is_empty(&self) -> bool {
        self.postings == 0
    }
}

/// Encode `postings` as a complete run into `out`.
///
/// `postings` must be sorted by (term, doc); an out-of-order posting is
/// rejected with `InvalidInput` before anything past it is written.
pub fn encode_run<W: Write>(postings: &[Posting], out: W) -> io::Result<W> {
    let mut writer = StructWriter::new(out);
    writer.write_u32(RUN_MAGIC)?;
    writer.write_u8(RUN_FORMAT_VERSION)?;
    writer.write_u64(postings.len() as u64)?;

    let mut prev = Posting::new(0, 0);
    for posting in postings {
        if *posting < prev {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("posting {posting} follows {prev}"),
            ));
        }

        let term_delta = posting.term - prev.term;
        writer.write_varint(term_delta)?;
        if term_delta == 0 {
            writer.write_varint(posting.doc - prev.doc)?;
        } else {
            writer.write_varint(posting.doc)?;
        }
        prev = *posting;
    }

    writer.finish()
}
