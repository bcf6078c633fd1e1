//! End-to-end construction of a sorted posting index.
//!
//! Building runs in two phases. The spill phase pushes the input through a
//! [`SegmentWriter`] that seals bounded runs into storage; with
//! [`IndexBuilder::build_sharded`] every shard gets its own writer on a
//! rayon pool. The merge phase combines all spilled runs with the
//! [`MergeEngine`] into output runs under a second prefix, then records them
//! in `manifest.json`. Intermediate runs are removed unless
//! [`BuilderConfig::keep_runs`] is set.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use log::{debug, info, warn};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SortMergeError};
use crate::merge::{MergeConfig, MergeEngine, MergeStats};
use crate::posting::Posting;
use crate::segment::{RunHandle, RunStore, SegmentReader, SegmentWriter, SegmentWriterConfig};
use crate::storage::{Storage, StorageOutput};

/// Name of the file recording the output runs of a build.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Current manifest format version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Configuration for an [`IndexBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Writer used in the spill phase.
    pub run_writer: SegmentWriterConfig,

    /// Writer receiving the merged output.
    pub output_writer: SegmentWriterConfig,

    /// Merge settings.
    pub merge: MergeConfig,

    /// Name prefix of intermediate runs.
    pub run_prefix: String,

    /// Name prefix of output runs.
    pub output_prefix: String,

    /// Keep intermediate runs after the build.
    pub keep_runs: bool,

    /// Threads used to spill shards. `None` uses the global rayon pool.
    pub threads: Option<usize>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            run_writer: SegmentWriterConfig::default(),
            output_writer: SegmentWriterConfig::default(),
            merge: MergeConfig::default(),
            run_prefix: "run".to_string(),
            output_prefix: "postings".to_string(),
            keep_runs: false,
            threads: None,
        }
    }
}

impl BuilderConfig {
    /// Check writer capacities, prefixes, run retention and the thread
    /// count.
    pub fn validate(&self) -> Result<()> {
        self.run_writer.validate()?;
        self.output_writer.validate()?;

        for prefix in [&self.run_prefix, &self.output_prefix] {
            if prefix.is_empty()
                || !prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(SortMergeError::invalid_argument(format!(
                    "invalid run prefix {prefix:?}"
                )));
            }
        }
        if self.run_prefix == self.output_prefix {
            return Err(SortMergeError::invalid_argument(
                "run and output prefixes must differ",
            ));
        }
        if self.keep_runs && self.merge.delete_inputs {
            return Err(SortMergeError::invalid_argument(
                "keep_runs conflicts with merge.delete_inputs",
            ));
        }
        if self.threads == Some(0) {
            return Err(SortMergeError::invalid_argument(
                "thread count must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Record of a completed build, stored as `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub format_version: u32,
    pub output_prefix: String,
    pub input_runs: usize,
    pub postings: u64,
    pub runs: Vec<RunHandle>,
}

/// Summary of a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub input_postings: u64,
    pub shards: usize,
    pub input_runs: usize,
    pub output_runs: usize,
    pub spill_ms: u64,
    pub merge: MergeStats,
    pub elapsed_ms: u64,
}

/// Summary of a verified index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub runs: usize,
    pub postings: u64,
    pub distinct_terms: u64,
}

/// Spills postings into runs and merges them into a finished index.
#[derive(Debug)]
pub struct IndexBuilder {
    storage: Arc<dyn Storage>,
    config: BuilderConfig,
    cancel: Option<Arc<AtomicBool>>,
}

impl IndexBuilder {
    /// Create a builder writing into `storage`.
    pub fn new(storage: Arc<dyn Storage>, config: BuilderConfig) -> Result<Self> {
        config.validate()?;
        Ok(IndexBuilder {
            storage,
            config,
            cancel: None,
        })
    }

    /// Abandon the merge phase once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// The builder configuration.
    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// The storage the index is written to.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn run_store(&self) -> RunStore {
        RunStore::new(Arc::clone(&self.storage), self.config.run_prefix.as_str())
    }

    /// Build an index from a single posting stream.
    pub fn build<I>(&self, postings: I) -> Result<BuildReport>
    where
        I: IntoIterator<Item = Posting>,
    {
        self.try_build(postings.into_iter().map(Ok))
    }

    /// Build an index from a fallible posting stream.
    ///
    /// The first input error aborts the build and removes every run written
    /// so far.
    pub fn try_build<I>(&self, postings: I) -> Result<BuildReport>
    where
        I: IntoIterator<Item = Result<Posting>>,
    {
        self.ensure_fresh()?;
        let start = Instant::now();
        let store = self.run_store();

        let runs = self.spill(store.clone(), postings)?;
        let spill_ms = start.elapsed().as_millis() as u64;
        info!("Spilled {} runs in {spill_ms} ms", runs.len());

        self.finish_build(&store, runs, 1, spill_ms, start)
    }

    /// Build an index from independent shards spilled in parallel.
    ///
    /// Each shard gets its own writer; the shared run store only hands out
    /// distinct run names. The merge phase runs once all shards are sealed.
    pub fn build_sharded(&self, shards: Vec<Vec<Posting>>) -> Result<BuildReport> {
        self.ensure_fresh()?;
        let start = Instant::now();
        let store = self.run_store();
        let shard_count = shards.len();

        let spill_all = || {
            shards
                .into_par_iter()
                .map(|shard| self.spill(store.clone(), shard.into_iter().map(Ok)))
                .collect::<Vec<_>>()
        };

        let results = match self.config.threads {
            Some(threads) => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("sortmerge-spill-{i}"))
                    .build()
                    .map_err(|e| {
                        SortMergeError::other(format!("Failed to create thread pool: {e}"))
                    })?;
                pool.install(spill_all)
            }
            None => spill_all(),
        };

        let mut runs = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(shard_runs) => runs.extend(shard_runs),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            self.remove_runs(&store, &runs);
            return Err(e);
        }

        let spill_ms = start.elapsed().as_millis() as u64;
        info!(
            "Spilled {shard_count} shards into {} runs in {spill_ms} ms",
            runs.len()
        );

        self.finish_build(&store, runs, shard_count, spill_ms, start)
    }

    fn ensure_fresh(&self) -> Result<()> {
        if self.storage.file_exists(MANIFEST_NAME) {
            return Err(SortMergeError::invalid_argument(
                "storage already holds a built index",
            ));
        }
        Ok(())
    }

    fn spill<I>(&self, store: RunStore, postings: I) -> Result<Vec<RunHandle>>
    where
        I: IntoIterator<Item = Result<Posting>>,
    {
        let mut writer = SegmentWriter::new(self.config.run_writer.clone(), store)?;

        let result = postings
            .into_iter()
            .try_for_each(|posting| writer.add_posting(posting?))
            .and_then(|()| writer.finish());

        if result.is_err()
            && !writer.is_finalized()
            && let Err(e) = writer.abort()
        {
            warn!("Failed to discard spilled runs: {e}");
        }
        result
    }

    fn finish_build(
        &self,
        store: &RunStore,
        runs: Vec<RunHandle>,
        shards: usize,
        spill_ms: u64,
        start: Instant,
    ) -> Result<BuildReport> {
        let input_postings: u64 = runs.iter().map(RunHandle::len).sum();
        let output_store = RunStore::new(
            Arc::clone(&self.storage),
            self.config.output_prefix.as_str(),
        );
        let mut output = SegmentWriter::new(self.config.output_writer.clone(), output_store.clone())?;

        let mut engine = MergeEngine::new(store.clone(), self.config.merge.clone());
        if let Some(flag) = &self.cancel {
            engine = engine.with_cancel_flag(Arc::clone(flag));
        }

        let outcome = engine.merge(&runs, &mut output);
        if !self.config.keep_runs {
            self.remove_runs(store, &runs);
        }
        let outcome = outcome?;

        let manifest = BuildManifest {
            format_version: MANIFEST_FORMAT_VERSION,
            output_prefix: self.config.output_prefix.clone(),
            input_runs: runs.len(),
            postings: outcome.stats.postings_merged,
            runs: outcome.runs,
        };
        // The index only counts as built once its files and names are durable.
        let published =
            write_manifest(self.storage.as_ref(), &manifest).and_then(|()| self.storage.sync());
        if let Err(e) = published {
            if let Err(e) = self.storage.delete_file(MANIFEST_NAME) {
                warn!("Failed to delete manifest: {e}");
            }
            self.remove_runs(&output_store, &manifest.runs);
            return Err(e);
        }

        let report = BuildReport {
            input_postings,
            shards,
            input_runs: runs.len(),
            output_runs: manifest.runs.len(),
            spill_ms,
            merge: outcome.stats,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            "Built index: {} postings in {} output runs ({} ms)",
            report.input_postings, report.output_runs, report.elapsed_ms
        );
        Ok(report)
    }

    fn remove_runs(&self, store: &RunStore, runs: &[RunHandle]) {
        for run in runs {
            if let Err(e) = store.delete(run) {
                warn!("Failed to delete run {}: {e}", run.name());
            }
        }
        debug!("Removed {} runs", runs.len());
    }

    /// Read the manifest of a built index.
    pub fn load_manifest(storage: &dyn Storage) -> Result<BuildManifest> {
        let mut input = storage.open_input(MANIFEST_NAME)?;
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;

        let manifest: BuildManifest = serde_json::from_slice(&bytes)?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(SortMergeError::invalid_argument(format!(
                "unsupported manifest version {}",
                manifest.format_version
            )));
        }
        Ok(manifest)
    }

    /// Stream every posting of a built index in order.
    pub fn open_postings(storage: Arc<dyn Storage>) -> Result<MergedPostings> {
        let manifest = Self::load_manifest(storage.as_ref())?;
        let store = RunStore::new(storage, manifest.output_prefix);
        Ok(MergedPostings {
            store,
            runs: manifest.runs.into_iter(),
            current: None,
            failed: false,
        })
    }

    /// Decode every output run and check that the index is globally sorted
    /// and matches its manifest.
    pub fn verify(storage: Arc<dyn Storage>) -> Result<VerifyReport> {
        let manifest = Self::load_manifest(storage.as_ref())?;
        let store = RunStore::new(storage, manifest.output_prefix.as_str());

        let mut prev: Option<Posting> = None;
        let mut postings = 0u64;
        let mut distinct_terms = 0u64;

        for handle in &manifest.runs {
            for posting in store.open_reader(handle)? {
                let posting = posting?;
                match prev {
                    Some(p) if posting < p => {
                        return Err(SortMergeError::corrupt(
                            handle.name(),
                            format!("posting {posting} follows {p}"),
                        ));
                    }
                    Some(p) if posting.term == p.term => {}
                    _ => distinct_terms += 1,
                }
                prev = Some(posting);
                postings += 1;
            }
        }

        if postings != manifest.postings {
            return Err(SortMergeError::corrupt(
                MANIFEST_NAME,
                format!(
                    "manifest records {} postings, runs hold {postings}",
                    manifest.postings
                ),
            ));
        }

        Ok(VerifyReport {
            runs: manifest.runs.len(),
            postings,
            distinct_terms,
        })
    }
}

fn write_manifest(storage: &dyn Storage, manifest: &BuildManifest) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    let mut output = storage.create_output(MANIFEST_NAME)?;
    output.write_all(&bytes)?;
    output.close()
}

/// Iterator over the postings of a built index, run after run.
///
/// Stops after the first error.
#[derive(Debug)]
pub struct MergedPostings {
    store: RunStore,
    runs: std::vec::IntoIter<RunHandle>,
    current: Option<SegmentReader>,
    failed: bool,
}

impl Iterator for MergedPostings {
    type Item = Result<Posting>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed {
            if let Some(reader) = self.current.as_mut() {
                match reader.next_posting() {
                    Ok(Some(posting)) => return Some(Ok(posting)),
                    Ok(None) => self.current = None,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
                continue;
            }

            let handle = self.runs.next()?;
            match self.store.open_reader(&handle) {
                Ok(reader) => self.current = Some(reader),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn storage() -> Arc<dyn Storage> {
        Arc::new(MemoryStorage::new_default())
    }

    fn small_config() -> BuilderConfig {
        BuilderConfig {
            run_writer: SegmentWriterConfig {
                capacity: 3,
                seal_on_term_change: false,
            },
            output_writer: SegmentWriterConfig::with_capacity(4),
            ..Default::default()
        }
    }

    fn sample() -> Vec<Posting> {
        [(3u64, 1u64), (1, 9), (2, 4), (1, 2), (3, 0), (2, 4), (1, 5)]
            .into_iter()
            .map(Posting::from)
            .collect()
    }

    #[test]
    fn test_config_validation() {
        assert!(BuilderConfig::default().validate().is_ok());

        let same_prefix = BuilderConfig {
            output_prefix: "run".to_string(),
            ..Default::default()
        };
        assert!(same_prefix.validate().is_err());

        let bad_prefix = BuilderConfig {
            run_prefix: "../run".to_string(),
            ..Default::default()
        };
        assert!(bad_prefix.validate().is_err());

        let zero_capacity = BuilderConfig {
            run_writer: SegmentWriterConfig::with_capacity(0),
            ..Default::default()
        };
        assert!(matches!(
            zero_capacity.validate(),
            Err(SortMergeError::InvalidCapacity(0))
        ));
    }

    #[test]
    fn test_keep_runs_conflicts_with_deleting_inputs() {
        let config = BuilderConfig {
            keep_runs: true,
            merge: MergeConfig {
                delete_inputs: true,
            },
            ..small_config()
        };
        assert!(matches!(
            config.validate(),
            Err(SortMergeError::InvalidArgument(_))
        ));

        let storage = storage();
        let err = IndexBuilder::new(Arc::clone(&storage), config).unwrap_err();
        assert!(err.to_string().contains("keep_runs"), "{err}");
        assert!(storage.list_files().unwrap().is_empty());

        // Deleting inputs during the merge is fine when runs are not kept.
        let config = BuilderConfig {
            merge: MergeConfig {
                delete_inputs: true,
            },
            ..small_config()
        };
        let builder = IndexBuilder::new(Arc::clone(&storage), config).unwrap();
        builder.build(sample()).unwrap();
        let run_store = RunStore::new(storage, "run");
        assert!(run_store.list_runs().unwrap().is_empty());
    }

    #[test]
    fn test_build_sorts_and_cleans_up() {
        let storage = storage();
        let builder = IndexBuilder::new(Arc::clone(&storage), small_config()).unwrap();

        let report = builder.build(sample()).unwrap();
        assert_eq!(report.input_postings, 7);
        assert_eq!(report.input_runs, 3);
        assert_eq!(report.merge.postings_merged, 7);

        let mut expected = sample();
        expected.sort();
        let merged: Vec<Posting> = IndexBuilder::open_postings(Arc::clone(&storage))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(merged, expected);

        let run_store = RunStore::new(Arc::clone(&storage), "run");
        assert!(run_store.list_runs().unwrap().is_empty());

        let manifest = IndexBuilder::load_manifest(storage.as_ref()).unwrap();
        assert_eq!(manifest.postings, 7);
        assert_eq!(manifest.runs.len(), report.output_runs);
    }

    #[test]
    fn test_keep_runs() {
        let storage = storage();
        let config = BuilderConfig {
            keep_runs: true,
            ..small_config()
        };
        let builder = IndexBuilder::new(Arc::clone(&storage), config).unwrap();
        builder.build(sample()).unwrap();

        let run_store = RunStore::new(storage, "run");
        assert_eq!(run_store.list_runs().unwrap().len(), 3);
    }

    #[test]
    fn test_refuses_to_overwrite_an_index() {
        let storage = storage();
        let builder = IndexBuilder::new(Arc::clone(&storage), small_config()).unwrap();
        builder.build(sample()).unwrap();

        let err = builder.build(sample()).unwrap_err();
        assert!(matches!(err, SortMergeError::InvalidArgument(_)));
    }

    #[test]
    fn test_empty_input_builds_empty_index() {
        let storage = storage();
        let builder = IndexBuilder::new(Arc::clone(&storage), small_config()).unwrap();

        let report = builder.build(Vec::new()).unwrap();
        assert_eq!(report.output_runs, 0);

        let verified = IndexBuilder::verify(storage).unwrap();
        assert_eq!(verified.postings, 0);
        assert_eq!(verified.distinct_terms, 0);
    }

    #[test]
    fn test_input_error_removes_spilled_runs() {
        let storage = storage();
        let builder = IndexBuilder::new(Arc::clone(&storage), small_config()).unwrap();

        let input = sample()
            .into_iter()
            .map(Ok)
            .chain(std::iter::once(Err(SortMergeError::invalid_argument(
                "line 8: bad posting",
            ))));
        let err = builder.try_build(input).unwrap_err();

        assert!(matches!(err, SortMergeError::InvalidArgument(_)));
        assert!(storage.list_files().unwrap().is_empty());
    }

    #[test]
    fn test_build_sharded_matches_single_stream() {
        let storage = storage();
        let config = BuilderConfig {
            threads: Some(2),
            ..small_config()
        };
        let builder = IndexBuilder::new(Arc::clone(&storage), config).unwrap();

        let all = sample();
        let shards = vec![all[..2].to_vec(), all[2..5].to_vec(), Vec::new(), all[5..].to_vec()];
        let report = builder.build_sharded(shards).unwrap();
        assert_eq!(report.shards, 4);
        assert_eq!(report.input_postings, 7);

        let mut expected = all;
        expected.sort();
        let merged: Vec<Posting> = IndexBuilder::open_postings(Arc::clone(&storage))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(merged, expected);

        let verified = IndexBuilder::verify(storage).unwrap();
        assert_eq!(verified.postings, 7);
        assert_eq!(verified.distinct_terms, 3);
    }

    #[test]
    fn test_verify_detects_missing_run() {
        let storage = storage();
        let builder = IndexBuilder::new(Arc::clone(&storage), small_config()).unwrap();
        builder.build(sample()).unwrap();

        let manifest = IndexBuilder::load_manifest(storage.as_ref()).unwrap();
        storage.delete_file(manifest.runs[0].name()).unwrap();

        assert!(IndexBuilder::verify(storage).is_err());
    }

    #[test]
    fn test_cancelled_build_leaves_no_output() {
        let storage = storage();
        let flag = Arc::new(AtomicBool::new(true));
        let builder = IndexBuilder::new(Arc::clone(&storage), small_config())
            .unwrap()
            .with_cancel_flag(flag);

        let err = builder.build(sample()).unwrap_err();
        assert!(matches!(err, SortMergeError::OperationCancelled(_)));
        assert!(storage.list_files().unwrap().is_empty());
    }

    /// Memory storage whose sync always fails.
    #[derive(Debug)]
    struct UnsyncableStorage {
        inner: MemoryStorage,
    }

    impl Storage for UnsyncableStorage {
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
            self.inner.delete_file(name)
        }

        fn list_files(&self) -> Result<Vec<String>> {
            self.inner.list_files()
        }

        fn sync(&self) -> Result<()> {
            Err(SortMergeError::storage("device gone"))
        }
    }

    #[test]
    fn test_failed_sync_leaves_no_index() {
        let storage: Arc<dyn Storage> = Arc::new(UnsyncableStorage {
            inner: MemoryStorage::new_default(),
        });
        let builder = IndexBuilder::new(Arc::clone(&storage), small_config()).unwrap();

        let err = builder.build(sample()).unwrap_err();
        assert!(err.to_string().contains("device gone"), "{err}");
        assert!(!storage.file_exists(MANIFEST_NAME));
        assert!(storage.list_files().unwrap().is_empty());
    }
}
