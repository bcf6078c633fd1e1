//! # sortmerge
//!
//! External sort-merge construction of inverted-index postings.
//!
//! Postings `(term, doc)` arrive unordered. A [`SegmentWriter`](segment::SegmentWriter)
//! buffers them under a fixed memory bound and seals the buffer into sorted,
//! immutable runs. A [`MergeEngine`](merge::MergeEngine) then combines any
//! number of runs into one globally ordered stream with a k-way heap merge,
//! feeding it into another writer.
//!
//! ## Features
//!
//! - Bounded memory while spilling: capacity is a hard bound
//! - Compact checksummed run format with delta-coded varints
//! - Corruption is always an error, never a silent end of run
//! - Failed or cancelled merges leave no output behind
//! - Pluggable storage: in-memory or one file per run
//! - Parallel spilling of independent shards with rayon
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use sortmerge::prelude::*;
//!
//! # fn main() -> sortmerge::error::Result<()> {
//! let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
//! let builder = IndexBuilder::new(Arc::clone(&storage), BuilderConfig::default())?;
//!
//! let report = builder.build([(2u64, 7u64), (1, 3), (2, 1)].into_iter().map(Posting::from))?;
//! assert_eq!(report.input_postings, 3);
//!
//! let postings = IndexBuilder::open_postings(storage)?.collect::<Result<Vec<_>>>()?;
//! assert_eq!(postings, vec![Posting::new(1, 3), Posting::new(2, 1), Posting::new(2, 7)]);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cli;
pub mod error;
pub mod merge;
pub mod posting;
pub mod segment;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::builder::{BuildManifest, BuildReport, BuilderConfig, IndexBuilder};
    pub use crate::error::{Result, SortMergeError};
    pub use crate::merge::{MergeConfig, MergeEngine, MergeOutcome, MergeStats};
    pub use crate::posting::{DocId, Posting, Term};
    pub use crate::segment::{
        MemoryRuns, RunHandle, RunStore, SealHandler, SegmentReader, SegmentWriter,
        SegmentWriterConfig,
    };
    pub use crate::storage::file::{FileStorage, FileStorageConfig};
    pub use crate::storage::memory::MemoryStorage;
    pub use crate::storage::{Storage, StorageConfig, StorageFactory};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
