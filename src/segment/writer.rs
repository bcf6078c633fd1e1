//! Bounded in-memory buffer that seals postings into sorted runs.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SortMergeError};
use crate::posting::{DocId, Posting, Term};
use crate::segment::RunHandle;

/// Persists a full buffer as a new run.
///
/// The writer calls [`seal`](SealHandler::seal) with its buffer already
/// sorted by (term, doc). Implementations may drain the buffer; the writer
/// clears whatever is left once the call succeeds. On error the buffer is
/// left with the writer untouched.
pub trait SealHandler {
    /// Durably write `buffer` as a new run and return its handle.
    fn seal(&mut self, buffer: &mut Vec<Posting>) -> Result<RunHandle>;

    /// Remove a run sealed earlier. Called when a writer is aborted.
    fn discard(&mut self, _run: &RunHandle) -> Result<()> {
        Ok(())
    }
}

/// Configuration for a [`SegmentWriter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentWriterConfig {
    /// Maximum number of postings buffered before a run is sealed.
    pub capacity: usize,

    /// Seal the buffer whenever the incoming term differs from the last one.
    ///
    /// With this off, runs mix terms and are sorted when sealed.
    pub seal_on_term_change: bool,
}

impl Default for SegmentWriterConfig {
    fn default() -> Self {
        SegmentWriterConfig {
            capacity: 65536,
            seal_on_term_change: true,
        }
    }
}

impl SegmentWriterConfig {
    /// Configuration with the given capacity and default seal rules.
    pub fn with_capacity(capacity: usize) -> Self {
        SegmentWriterConfig {
            capacity,
            ..Default::default()
        }
    }

    /// Check the configuration, rejecting a zero capacity.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(SortMergeError::InvalidCapacity(self.capacity));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Finished,
    Aborted,
}

/// Accumulates postings and seals them into runs through a [`SealHandler`].
///
/// Before each posting is buffered, the buffer is sealed if it is full, or,
/// with `seal_on_term_change`, if the posting starts a new term. At most one
/// seal happens per posting even when both conditions hold.
///
/// Capacity is a hard bound: when it is reached in the middle of a term, the
/// term continues in the next run. Merging tolerates split terms.
///
/// Nothing is flushed implicitly: call [`finish`](Self::finish) to seal the
/// trailing buffer, or its postings are lost.
pub struct SegmentWriter<H: SealHandler> {
    config: SegmentWriterConfig,
    handler: H,
    buffer: Vec<Posting>,
    sealed: Vec<RunHandle>,
    added: u64,
    state: WriterState,
}

impl<H: SealHandler> SegmentWriter<H> {
    /// Configure a writer. Fails with `InvalidCapacity` for a zero capacity.
    pub fn new(config: SegmentWriterConfig, handler: H) -> Result<Self> {
        config.validate()?;

        Ok(SegmentWriter {
            buffer: Vec::with_capacity(config.capacity.min(4096)),
            config,
            handler,
            sealed: Vec::new(),
            added: 0,
            state: WriterState::Open,
        })
    }

    /// Configure a writer with the given capacity and default seal rules.
    pub fn with_capacity(capacity: usize, handler: H) -> Result<Self> {
        Self::new(SegmentWriterConfig::with_capacity(capacity), handler)
    }

    /// Add a posting, sealing the current buffer first if required.
    pub fn add(&mut self, term: Term, doc: DocId) -> Result<()> {
        self.add_posting(Posting::new(term, doc))
    }

    /// Add a posting, sealing the current buffer first if required.
    pub fn add_posting(&mut self, posting: Posting) -> Result<()> {
        self.ensure_open("add")?;

        if self.should_seal_before(posting.term) {
            self.seal_buffer()?;
        }

        self.buffer.push(posting);
        self.added += 1;
        Ok(())
    }

    fn should_seal_before(&self, term: Term) -> bool {
        match self.buffer.last() {
            None => false,
            Some(last) => {
                self.buffer.len() >= self.config.capacity
                    || (self.config.seal_on_term_change && last.term != term)
            }
        }
    }

    /// Seal the buffered postings, if any, into a new run.
    pub fn seal(&mut self) -> Result<Option<RunHandle>> {
        self.ensure_open("seal")?;
        self.seal_buffer()
    }

    fn seal_buffer(&mut self) -> Result<Option<RunHandle>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        if !self.buffer.is_sorted() {
            self.buffer.sort_unstable();
        }

        let count = self.buffer.len();
        let handle = self.handler.seal(&mut self.buffer)?;
        self.buffer.clear();

        debug!("Sealed run {} ({count} postings)", handle.name());
        self.sealed.push(handle.clone());
        Ok(Some(handle))
    }

    /// Seal the trailing buffer and finalize the writer.
    ///
    /// Returns every run sealed by this writer, in sealing order.
    pub fn finish(&mut self) -> Result<Vec<RunHandle>> {
        self.ensure_open("finish")?;
        self.seal_buffer()?;
        self.state = WriterState::Finished;
        Ok(self.sealed.clone())
    }

    /// Drop buffered postings and discard every run sealed so far.
    ///
    /// All discards are attempted; the first failure is returned.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_open("abort")?;
        self.state = WriterState::Aborted;
        self.buffer.clear();

        let mut first_error = None;
        for run in self.sealed.drain(..) {
            if let Err(e) = self.handler.discard(&run) {
                warn!("Failed to discard run {}: {e}", run.name());
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Finished => Err(SortMergeError::misuse(format!(
                "{operation} called on a finished segment writer"
            ))),
            WriterState::Aborted => Err(SortMergeError::misuse(format!(
                "{operation} called on an aborted segment writer"
            ))),
        }
    }

    /// The writer configuration.
    pub fn config(&self) -> &SegmentWriterConfig {
        &self.config
    }

    /// Number of postings waiting to be sealed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total number of postings added.
    pub fn postings_added(&self) -> u64 {
        self.added
    }

    /// Runs sealed so far.
    pub fn sealed_runs(&self) -> &[RunHandle] {
        &self.sealed
    }

    /// Whether `finish` or `abort` has been called.
    pub fn is_finalized(&self) -> bool {
        self.state != WriterState::Open
    }

    /// The seal handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: SealHandler> Drop for SegmentWriter<H> {
    fn drop(&mut self) {
        if self.state == WriterState::Open && !self.buffer.is_empty() {
            warn!(
                "Segment writer dropped with {} unsealed postings",
                self.buffer.len()
            );
        }
    }
}
