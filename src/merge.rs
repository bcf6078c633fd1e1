//! K-way merge of sealed runs into one globally sorted posting stream.
//!
//! The engine keeps one heap entry per live run: the run's current posting
//! and its ordinal. Each step pops the smallest entry, emits the posting into
//! the output [`SegmentWriter`], advances that run and pushes it back unless
//! it is exhausted. Re-inserting after the advance, instead of fixing the
//! entry in place, means the heap never holds a posting that has already
//! been emitted and needs no back-references into the reader list.
//!
//! A failure in any run aborts the whole merge: the output writer is aborted
//! so no finalized output exists, and the error names the offending run.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use sortmerge::merge::{MergeConfig, MergeEngine};
//! use sortmerge::posting::Posting;
//! use sortmerge::segment::{MemoryRuns, RunStore, SegmentWriter};
//! use sortmerge::storage::memory::MemoryStorage;
//!
//! # fn main() -> sortmerge::error::Result<()> {
//! let store = RunStore::new(Arc::new(MemoryStorage::new_default()), "run");
//! let a = store.write_run(&[Posting::new(1, 5), Posting::new(1, 9), Posting::new(2, 1)])?;
//! let b = store.write_run(&[Posting::new(1, 7), Posting::new(2, 0), Posting::new(2, 2)])?;
//!
//! let mut output = SegmentWriter::with_capacity(16, MemoryRuns::new())?;
//! let engine = MergeEngine::new(store, MergeConfig::default());
//! let outcome = engine.merge(&[a, b], &mut output)?;
//!
//! assert_eq!(outcome.stats.postings_merged, 6);
//! let merged: Vec<Posting> = output.handler().runs().concat();
//! assert_eq!(merged[0], Posting::new(1, 5));
//! assert_eq!(merged[5], Posting::new(2, 2));
//! # Ok(())
//! # }
//! ```

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SortMergeError};
use crate::posting::Posting;
use crate::segment::{RunHandle, RunStore, SealHandler, SegmentReader, SegmentWriter};

/// Configuration for merge operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Delete the input runs once the merge has completed successfully.
    pub delete_inputs: bool,
}

/// Statistics about a merge operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Number of input runs.
    pub runs_merged: usize,

    /// Input runs that held no postings and never entered the heap.
    pub empty_runs_skipped: usize,

    /// Postings emitted into the output.
    pub postings_merged: u64,

    /// Runs sealed by the output writer.
    pub output_runs: usize,

    /// Wall-clock time of the merge in milliseconds.
    pub elapsed_ms: u64,
}

/// Result of a successful merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Runs produced by the output writer, in order.
    pub runs: Vec<RunHandle>,

    /// Statistics about the merge.
    pub stats: MergeStats,
}

/// Merges sealed runs with a min-heap over their current postings.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    store: RunStore,
    config: MergeConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl MergeEngine {
    /// Create an engine opening input runs through `store`.
    pub fn new(store: RunStore, config: MergeConfig) -> Self {
        MergeEngine {
            store,
            config,
            cancel: None,
        }
    }

    /// Abandon the merge at the next heap pop once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// The merge configuration.
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge `runs` into `output` and finalize it.
    ///
    /// Merging zero runs finalizes an empty output.
    pub fn merge<H: SealHandler>(
        &self,
        runs: &[RunHandle],
        output: &mut SegmentWriter<H>,
    ) -> Result<MergeOutcome> {
        let mut readers = Vec::with_capacity(runs.len());
        for handle in runs {
            match self.store.open_reader(handle) {
                Ok(reader) => readers.push(reader),
                Err(e) => {
                    let err = SortMergeError::merge_failed(handle.name(), e);
                    abort_output(output, &err);
                    return Err(err);
                }
            }
        }

        let outcome = self.merge_readers(readers, output)?;

        // The output is already final here, so a failed delete must not
        // turn the merge into an error.
        if self.config.delete_inputs {
            let mut deleted = 0;
            for handle in runs {
                match self.store.delete(handle) {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!("Failed to delete merged input run {}: {e}", handle.name()),
                }
            }
            debug!("Deleted {deleted} of {} merged input runs", runs.len());
        }

        Ok(outcome)
    }

    /// Merge already-open readers into `output` and finalize it.
    pub fn merge_readers<H: SealHandler>(
        &self,
        mut readers: Vec<SegmentReader>,
        output: &mut SegmentWriter<H>,
    ) -> Result<MergeOutcome> {
        let start = Instant::now();
        let mut stats = MergeStats {
            runs_merged: readers.len(),
            ..Default::default()
        };

        let result = self
            .drain(&mut readers, output, &mut stats)
            .and_then(|()| output.finish());

        let runs = match result {
            Ok(runs) => runs,
            Err(e) => {
                abort_output(output, &e);
                return Err(e);
            }
        };

        stats.output_runs = runs.len();
        stats.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            "Merged {} runs ({} empty) into {} output runs: {} postings in {} ms",
            stats.runs_merged,
            stats.empty_runs_skipped,
            stats.output_runs,
            stats.postings_merged,
            stats.elapsed_ms
        );

        Ok(MergeOutcome { runs, stats })
    }

    fn drain<H: SealHandler>(
        &self,
        readers: &mut [SegmentReader],
        output: &mut SegmentWriter<H>,
        stats: &mut MergeStats,
    ) -> Result<()> {
        let mut heap: BinaryHeap<Reverse<(Posting, usize)>> =
            BinaryHeap::with_capacity(readers.len());

        for (ordinal, reader) in readers.iter_mut().enumerate() {
            match next_from(reader)? {
                Some(posting) => heap.push(Reverse((posting, ordinal))),
                None => {
                    debug!("Skipping empty run {}", reader.name());
                    stats.empty_runs_skipped += 1;
                }
            }
        }

        loop {
            self.check_cancelled()?;

            let Some(Reverse((posting, ordinal))) = heap.pop() else {
                break;
            };

            output.add_posting(posting)?;
            stats.postings_merged += 1;

            let reader = &mut readers[ordinal];
            match next_from(reader)? {
                Some(next) => heap.push(Reverse((next, ordinal))),
                None => debug!("Run {} exhausted", reader.name()),
            }
        }

        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => {
                Err(SortMergeError::cancelled("merge cancelled"))
            }
            _ => Ok(()),
        }
    }
}

/// Advance `reader`, attributing any failure to its run.
fn next_from(reader: &mut SegmentReader) -> Result<Option<Posting>> {
    reader
        .next_posting()
        .map_err(|e| SortMergeError::merge_failed(reader.name(), e))
}

fn abort_output<H: SealHandler>(output: &mut SegmentWriter<H>, cause: &SortMergeError) {
    warn!("Merge aborted: {cause}");
    if output.is_finalized() {
        return;
    }
    if let Err(e) = output.abort() {
        warn!("Failed to discard partial merge output: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::segment::MemoryRuns;
    use crate::storage::{Storage, StorageOutput};
    use crate::storage::memory::MemoryStorage;

    fn postings(pairs: &[(u64, u64)]) -> Vec<Posting> {
        pairs.iter().copied().map(Posting::from).collect()
    }

    fn setup() -> (RunStore, MergeEngine) {
        let store = RunStore::new(Arc::new(MemoryStorage::new_default()), "run");
        let engine = MergeEngine::new(store.clone(), MergeConfig::default());
        (store, engine)
    }

    fn output(capacity: usize) -> SegmentWriter<MemoryRuns> {
        SegmentWriter::with_capacity(capacity, MemoryRuns::new()).unwrap()
    }

    #[test]
    fn test_merges_two_runs() {
        let (store, engine) = setup();
        let a = store.write_run(&postings(&[(1, 5), (1, 9), (2, 1)])).unwrap();
        let b = store.write_run(&postings(&[(1, 7), (2, 0), (2, 2)])).unwrap();

        let mut out = output(100);
        let outcome = engine.merge(&[a, b], &mut out).unwrap();

        assert_eq!(
            out.handler().runs().concat(),
            postings(&[(1, 5), (1, 7), (1, 9), (2, 0), (2, 1), (2, 2)])
        );
        // One output run per term.
        assert_eq!(outcome.runs.len(), 2);
        assert_eq!(outcome.stats.runs_merged, 2);
        assert_eq!(outcome.stats.postings_merged, 6);
        assert_eq!(outcome.stats.output_runs, 2);
    }

    #[test]
    fn test_zero_runs_produce_empty_output() {
        let (_, engine) = setup();
        let mut out = output(4);

        let outcome = engine.merge(&[], &mut out).unwrap();
        assert!(outcome.runs.is_empty());
        assert_eq!(outcome.stats.postings_merged, 0);
        assert!(out.is_finalized());
    }

    #[test]
    fn test_empty_runs_are_skipped() {
        let (store, engine) = setup();
        let empty = store.write_run(&[]).unwrap();
        let a = store.write_run(&postings(&[(3, 1), (4, 4)])).unwrap();
        let also_empty = store.write_run(&[]).unwrap();

        let mut out = output(8);
        let outcome = engine.merge(&[empty, a, also_empty], &mut out).unwrap();

        assert_eq!(out.handler().runs().concat(), postings(&[(3, 1), (4, 4)]));
        assert_eq!(outcome.stats.empty_runs_skipped, 2);
    }

    #[test]
    fn test_duplicates_are_kept() {
        let (store, engine) = setup();
        let a = store.write_run(&postings(&[(1, 1), (2, 2)])).unwrap();
        let b = store.write_run(&postings(&[(1, 1), (2, 2)])).unwrap();

        let mut out = output(8);
        engine.merge(&[a, b], &mut out).unwrap();
        assert_eq!(
            out.handler().runs().concat(),
            postings(&[(1, 1), (1, 1), (2, 2), (2, 2)])
        );
    }

    #[test]
    fn test_split_terms_merge_back_in_order() {
        let (store, engine) = setup();
        // The same term split across runs by a capacity cutoff.
        let a = store.write_run(&postings(&[(5, 1), (5, 4)])).unwrap();
        let b = store.write_run(&postings(&[(5, 2), (5, 3), (6, 0)])).unwrap();

        let mut out = output(2);
        engine.merge(&[a, b], &mut out).unwrap();
        assert_eq!(
            out.handler().runs(),
            &[
                postings(&[(5, 1), (5, 2)]),
                postings(&[(5, 3), (5, 4)]),
                postings(&[(6, 0)]),
            ]
        );
    }

    #[test]
    fn test_corrupt_run_fails_merge_and_discards_output() {
        let (store, engine) = setup();
        let good = store.write_run(&postings(&[(1, 1), (2, 1), (3, 1)])).unwrap();
        let bad = store.write_run(&postings(&[(1, 2), (2, 2), (3, 2)])).unwrap();

        // Flip the checksum of the second run.
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut store.storage().open_input(bad.name()).unwrap(), &mut bytes)
            .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut output_file = store.storage().create_output(bad.name()).unwrap();
        output_file.write_all(&bytes).unwrap();
        output_file.close().unwrap();

        let out_store = RunStore::new(Arc::clone(store.storage()), "out");
        let mut out = SegmentWriter::with_capacity(1, out_store.clone()).unwrap();
        let err = engine.merge(&[good, bad.clone()], &mut out).unwrap_err();

        match &err {
            SortMergeError::MergeFailed { run, source } => {
                assert_eq!(run, bad.name());
                assert!(source.is_corruption());
            }
            other => panic!("expected MergeFailed, got {other}"),
        }
        assert!(out.is_finalized());
        assert!(out_store.list_runs().unwrap().is_empty());
        assert!(matches!(out.finish(), Err(SortMergeError::WriterMisuse(_))));
    }

    #[test]
    fn test_missing_run_fails_merge() {
        let (store, engine) = setup();
        let a = store.write_run(&postings(&[(1, 1)])).unwrap();
        let missing = RunHandle::new("run_999999.smr", 4);

        let mut out = output(4);
        let err = engine.merge(&[a, missing], &mut out).unwrap_err();
        assert!(matches!(
            err,
            SortMergeError::MergeFailed { ref run, .. } if run == "run_999999.smr"
        ));
        assert!(out.is_finalized());
    }

    #[test]
    fn test_cancelled_merge_aborts_output() {
        let (store, engine) = setup();
        let a = store.write_run(&postings(&[(1, 1), (2, 2)])).unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let engine = engine.with_cancel_flag(Arc::clone(&flag));

        let mut out = output(4);
        let err = engine.merge(&[a], &mut out).unwrap_err();
        assert!(matches!(err, SortMergeError::OperationCancelled(_)));
        assert!(out.handler().runs().is_empty());
    }

    #[test]
    fn test_delete_inputs_after_success() {
        let store = RunStore::new(Arc::new(MemoryStorage::new_default()), "run");
        let engine = MergeEngine::new(
            store.clone(),
            MergeConfig {
                delete_inputs: true,
            },
        );
        let a = store.write_run(&postings(&[(1, 1)])).unwrap();
        let b = store.write_run(&postings(&[(1, 2)])).unwrap();

        let mut out = output(4);
        engine.merge(&[a, b], &mut out).unwrap();
        assert!(store.list_runs().unwrap().is_empty());
    }

    /// Memory storage that refuses to delete files with a given prefix.
    #[derive(Debug)]
    struct UndeletableStorage {
        inner: MemoryStorage,
        locked_prefix: &'static str,
    }

    impl Storage for UndeletableStorage {
        fn open_input(&self, name: &str) -> Result<Box<dyn crate::storage::StorageInput>> {
            self.inner.open_input(name)
        }

        fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
            self.inner.create_output(name)
        }

        fn file_exists(&self, name: &str) -> bool {
            self.inner.file_exists(name)
        }

        fn delete_file(&self, name: &str) -> Result<()> {
            if name.starts_with(self.locked_prefix) {
                return Err(SortMergeError::storage(format!("{name} is locked")));
            }
            self.inner.delete_file(name)
        }

        fn list_files(&self) -> Result<Vec<String>> {
            self.inner.list_files()
        }

        fn sync(&self) -> Result<()> {
            self.inner.sync()
        }
    }

    #[test]
    fn test_failed_input_delete_keeps_merge_result() {
        let storage: Arc<dyn Storage> = Arc::new(UndeletableStorage {
            inner: MemoryStorage::new_default(),
            locked_prefix: "run_",
        });
        let store = RunStore::new(Arc::clone(&storage), "run");
        let engine = MergeEngine::new(
            store.clone(),
            MergeConfig {
                delete_inputs: true,
            },
        );
        let a = store.write_run(&postings(&[(1, 1), (2, 5)])).unwrap();
        let b = store.write_run(&postings(&[(1, 2)])).unwrap();

        let out_store = RunStore::new(Arc::clone(&storage), "out");
        let mut out = SegmentWriter::with_capacity(8, out_store.clone()).unwrap();
        let outcome = engine.merge(&[a, b], &mut out).unwrap();

        // The inputs survive, and the output stays valid and reported.
        assert_eq!(store.list_runs().unwrap().len(), 2);
        let names: Vec<String> = outcome.runs.iter().map(|h| h.name().to_string()).collect();
        assert_eq!(out_store.list_runs().unwrap(), names);

        let merged: Vec<Posting> = outcome
            .runs
            .iter()
            .flat_map(|handle| out_store.open_reader(handle).unwrap())
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(merged, postings(&[(1, 1), (1, 2), (2, 5)]));
    }

    #[test]
    fn test_many_runs_preserve_cardinality_and_order() {
        let (store, engine) = setup();
        let mut handles = Vec::new();
        let mut expected = Vec::new();

        for run in 0..17u64 {
            let mut run_postings: Vec<Posting> = (0..(run * 3 % 11))
                .map(|i| Posting::new((i * 5 + run) % 7, i * 17 + run))
                .collect();
            run_postings.sort();
            expected.extend_from_slice(&run_postings);
            handles.push(store.write_run(&run_postings).unwrap());
        }
        expected.sort();

        let config = crate::segment::SegmentWriterConfig {
            capacity: 5,
            seal_on_term_change: false,
        };
        let mut out = SegmentWriter::new(config, MemoryRuns::new()).unwrap();
        let outcome = engine.merge(&handles, &mut out).unwrap();

        let merged = out.handler().runs().concat();
        assert_eq!(merged, expected);
        assert_eq!(outcome.stats.postings_merged, expected.len() as u64);
    }
}
