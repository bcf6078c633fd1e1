//! Seal handlers: storage-backed runs and an in-memory collector.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::error::{Result, SortMergeError};
use crate::posting::Posting;
use crate::segment::reader::SegmentReader;
use crate::segment::writer::SealHandler;
use crate::segment::{RUN_EXTENSION, RunHandle, encode_run};
use crate::storage::{Storage, StorageOutput};

/// Persists runs as files in a [`Storage`] and opens readers over them.
///
/// Run files are named `<prefix>_<sequence>.smr`. Clones share the sequence
/// counter, so independent writers over clones of one store never pick the
/// same name.
#[derive(Debug, Clone)]
pub struct RunStore {
    storage: Arc<dyn Storage>,
    prefix: String,
    next_id: Arc<AtomicU64>,
}

impl RunStore {
    /// Create a store writing runs named after `prefix`.
    pub fn new<S: Into<String>>(storage: Arc<dyn Storage>, prefix: S) -> Self {
        RunStore {
            storage,
            prefix: prefix.into(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Whether `name` looks like a run created by this store.
    pub fn owns(&self, name: &str) -> bool {
        name.strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|rest| rest.strip_suffix(RUN_EXTENSION))
            .and_then(|rest| rest.strip_suffix('.'))
            .is_some_and(|seq| !seq.is_empty() && seq.bytes().all(|b| b.is_ascii_digit()))
    }

    fn next_name(&self) -> String {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let name = format!("{}_{id:06}.{RUN_EXTENSION}", self.prefix);
            if !self.storage.file_exists(&name) {
                return name;
            }
        }
    }

    /// Write sorted `postings` as a new run.
    pub fn write_run(&self, postings: &[Posting]) -> Result<RunHandle> {
        let name = self.next_name();
        let output = self.storage.create_output(&name)?;
        let mut output = encode_run(postings, output).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidInput {
                SortMergeError::invalid_argument(format!("run {name}: {e}"))
            } else {
                SortMergeError::Io(e)
            }
        })?;
        output.close()?;

        debug!("Wrote run {name} ({} postings)", postings.len());
        Ok(RunHandle::new(name, postings.len() as u64))
    }

    /// Open a reader over a run written by any store on the same storage.
    pub fn open_reader(&self, handle: &RunHandle) -> Result<SegmentReader> {
        let input = self.storage.open_input(handle.name())?;
        SegmentReader::open(handle, input)
    }

    /// Open a reader over a run by name, trusting its header.
    pub fn open_named(&self, name: &str) -> Result<SegmentReader> {
        let input = self.storage.open_input(name)?;
        SegmentReader::open_named(name, input)
    }

    /// Delete a run.
    pub fn delete(&self, handle: &RunHandle) -> Result<()> {
        self.storage.delete_file(handle.name())
    }

    /// Names of every run in storage created under this prefix, sorted.
    pub fn list_runs(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .list_files()?
            .into_iter()
            .filter(|name| self.owns(name))
            .collect())
    }
}

impl SealHandler for RunStore {
    fn seal(&mut self, buffer: &mut Vec<Posting>) -> Result<RunHandle> {
        let handle = self.write_run(buffer)?;
        buffer.clear();
        Ok(handle)
    }

    fn discard(&mut self, run: &RunHandle) -> Result<()> {
        self.delete(run)
    }
}

/// Keeps sealed runs in memory.
///
/// Useful for tests and for callers that only want the run boundaries.
#[derive(Debug, Default, Clone)]
pub struct MemoryRuns {
    runs: Vec<Vec<Posting>>,
    names: Vec<String>,
    next_id: u64,
}

impl MemoryRuns {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs sealed so far, in sealing order.
    pub fn runs(&self) -> &[Vec<Posting>] {
        &self.runs
    }
}

impl SealHandler for MemoryRuns {
    fn seal(&mut self, buffer: &mut Vec<Posting>) -> Result<RunHandle> {
        let name = format!("memory_{:06}", self.next_id);
        self.next_id += 1;

        let run = std::mem::take(buffer);
        let handle = RunHandle::new(name.clone(), run.len() as u64);
        self.runs.push(run);
        self.names.push(name);
        Ok(handle)
    }

    fn discard(&mut self, run: &RunHandle) -> Result<()> {
        if let Some(index) = self.names.iter().position(|name| name == run.name()) {
            self.names.remove(index);
            self.runs.remove(index);
        }
        Ok(())
    }
}
