use std::fs;
use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use sortmerge::builder::{BuilderConfig, IndexBuilder, MANIFEST_NAME};
use sortmerge::cli::args::SortMergeArgs;
use sortmerge::cli::commands::execute_command;
use sortmerge::error::{Result, SortMergeError};
use sortmerge::merge::{MergeConfig, MergeEngine};
use sortmerge::posting::Posting;
use sortmerge::segment::{RunStore, SegmentWriter, SegmentWriterConfig};
use sortmerge::storage::file::{FileStorage, FileStorageConfig};
use sortmerge::storage::{Storage, StorageOutput};
use tempfile::TempDir;

fn file_storage(dir: &TempDir) -> Arc<dyn Storage> {
    Arc::new(FileStorage::new(FileStorageConfig::new(dir.path())).unwrap())
}

fn sample_postings() -> Vec<Posting> {
    (0..400u64)
        .map(|i| Posting::new((i * 7) % 23, (i * 31) % 101))
        .collect()
}

fn tmp_files(dir: &TempDir) -> Vec<String> {
    fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect()
}

#[test]
fn test_build_on_disk() {
    let dir = TempDir::new().unwrap();
    let storage = file_storage(&dir);
    let config = BuilderConfig {
        run_writer: SegmentWriterConfig {
            capacity: 32,
            seal_on_term_change: false,
        },
        output_writer: SegmentWriterConfig::with_capacity(50),
        ..Default::default()
    };

    let builder = IndexBuilder::new(Arc::clone(&storage), config).unwrap();
    let report = builder.build(sample_postings()).unwrap();
    assert_eq!(report.input_postings, 400);
    assert_eq!(report.input_runs, 13);

    assert!(dir.path().join(MANIFEST_NAME).exists());
    assert!(tmp_files(&dir).is_empty());
    assert!(RunStore::new(Arc::clone(&storage), "run").list_runs().unwrap().is_empty());

    let mut expected = sample_postings();
    expected.sort();
    let merged = IndexBuilder::open_postings(Arc::clone(&storage))
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(merged, expected);

    let verified = IndexBuilder::verify(storage).unwrap();
    assert_eq!(verified.postings, 400);
    assert_eq!(verified.distinct_terms, 23);
}

#[test]
fn test_unclosed_output_is_never_published() {
    let dir = TempDir::new().unwrap();
    let storage = file_storage(&dir);

    {
        let mut output = storage.create_output("partial.smr").unwrap();
        output.write_all(b"half a run").unwrap();
        assert!(!storage.file_exists("partial.smr"));
    }

    assert!(!storage.file_exists("partial.smr"));
    assert!(tmp_files(&dir).is_empty());
    assert!(storage.list_files().unwrap().is_empty());
}

#[test]
fn test_corrupt_run_on_disk_fails_merge_without_output() {
    let dir = TempDir::new().unwrap();
    let storage = file_storage(&dir);
    let store = RunStore::new(Arc::clone(&storage), "run");

    let good = store
        .write_run(&[Posting::new(1, 1), Posting::new(2, 2)])
        .unwrap();
    let bad = store
        .write_run(&[Posting::new(1, 3), Posting::new(1, 4), Posting::new(3, 9)])
        .unwrap();

    // Flip a byte inside the records.
    let path = dir.path().join(bad.name());
    let mut bytes = fs::read(&path).unwrap();
    bytes[14] ^= 0x01;
    fs::write(&path, bytes).unwrap();

    let output_store = RunStore::new(Arc::clone(&storage), "postings");
    let mut output = SegmentWriter::with_capacity(1, output_store.clone()).unwrap();
    let engine = MergeEngine::new(store, MergeConfig::default());
    let err = engine.merge(&[good, bad.clone()], &mut output).unwrap_err();

    match err {
        SortMergeError::MergeFailed { run, source } => {
            assert_eq!(run, bad.name());
            assert!(source.is_corruption());
        }
        other => panic!("expected MergeFailed, got {other}"),
    }
    assert!(output_store.list_runs().unwrap().is_empty());
    assert!(tmp_files(&dir).is_empty());
}

#[test]
fn test_verify_detects_tampered_run() {
    let dir = TempDir::new().unwrap();
    let storage = file_storage(&dir);
    let builder = IndexBuilder::new(Arc::clone(&storage), BuilderConfig::default()).unwrap();
    builder.build(sample_postings()).unwrap();

    let manifest = IndexBuilder::load_manifest(storage.as_ref()).unwrap();
    let path = dir.path().join(manifest.runs[0].name());
    let mut bytes = fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 2);
    fs::write(&path, bytes).unwrap();

    let err = IndexBuilder::verify(storage).unwrap_err();
    assert!(err.is_corruption(), "{err}");
}

#[test]
fn test_cli_build_dump_verify() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("postings.txt");
    let index = dir.path().join("index");

    let mut file = fs::File::create(&input).unwrap();
    writeln!(file, "# term doc").unwrap();
    for posting in sample_postings() {
        writeln!(file, "{} {}", posting.term, posting.doc).unwrap();
    }
    drop(file);

    let run = |args: &[&str]| execute_command(SortMergeArgs::try_parse_from(args).unwrap());

    let input_arg = input.to_string_lossy().into_owned();
    let index_arg = index.to_string_lossy().into_owned();
    run(&[
        "sortmerge",
        "-q",
        "build",
        input_arg.as_str(),
        index_arg.as_str(),
        "--run-capacity",
        "16",
        "--shards",
        "3",
        "--threads",
        "2",
    ])
    .unwrap();

    run(&["sortmerge", "-q", "--format", "json", "verify", index_arg.as_str()]).unwrap();
    run(&["sortmerge", "-q", "dump", index_arg.as_str(), "--limit", "5"]).unwrap();

    let storage = Arc::new(FileStorage::new(FileStorageConfig::new(&index)).unwrap());
    let verified = IndexBuilder::verify(storage).unwrap();
    assert_eq!(verified.postings, 400);

    // A second build into the same directory is refused.
    let err = run(&["sortmerge", "-q", "build", input_arg.as_str(), index_arg.as_str()]).unwrap_err();
    assert!(matches!(err, SortMergeError::InvalidArgument(_)));
}

#[test]
fn test_cli_rejects_malformed_input() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("postings.txt");
    fs::write(&input, "1 2\n3 four\n").unwrap();
    let index = dir.path().join("index");

    let args = SortMergeArgs::try_parse_from([
        "sortmerge",
        "-q",
        "build",
        input.to_str().unwrap(),
        index.to_str().unwrap(),
    ])
    .unwrap();
    let err = execute_command(args).unwrap_err();

    assert!(err.to_string().contains("line 2"), "{err}");
    assert!(!index.join(MANIFEST_NAME).exists());
}

#[test]
fn test_cli_missing_index_dir() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nowhere");

    let args =
        SortMergeArgs::try_parse_from(["sortmerge", "verify", missing.to_str().unwrap()]).unwrap();
    assert!(matches!(
        execute_command(args),
        Err(SortMergeError::InvalidArgument(_))
    ));
}
