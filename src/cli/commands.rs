//! Command implementations for the sortmerge CLI.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::builder::{BuilderConfig, IndexBuilder};
use crate::cli::args::*;
use crate::cli::output::*;
use crate::error::{Result, SortMergeError};
use crate::posting::Posting;
use crate::storage::file::FileStorageConfig;
use crate::storage::{Storage, StorageConfig, StorageFactory};

/// Execute a CLI command.
pub fn execute_command(args: SortMergeArgs) -> Result<()> {
    match &args.command {
        Command::Build(build_args) => build_index(build_args, &args),
        Command::Dump(dump_args) => dump_index(dump_args, &args),
        Command::Verify(verify_args) => verify_index(verify_args, &args),
    }
}

/// Build an index from a text file of postings.
fn build_index(args: &BuildArgs, cli_args: &SortMergeArgs) -> Result<()> {
    let config = builder_config(args)?;
    let storage = open_storage(&args.index_dir, args.sync_writes)?;
    let builder = IndexBuilder::new(storage, config)?;

    let reader: Box<dyn BufRead> = if args.input.as_os_str() == "-" {
        Box::new(io::stdin().lock())
    } else {
        Box::new(BufReader::new(File::open(&args.input)?))
    };
    let postings = parse_postings(reader);

    let report = match args.shards {
        Some(shards) if shards > 1 => {
            let all = postings.collect::<Result<Vec<_>>>()?;
            builder.build_sharded(split_shards(all, shards))?
        }
        _ => builder.try_build(postings)?,
    };

    output_result(
        &format!("Index built at {}", args.index_dir.display()),
        &report,
        cli_args,
    )
}

/// Print the postings of an index.
fn dump_index(args: &DumpArgs, cli_args: &SortMergeArgs) -> Result<()> {
    let storage = open_existing(&args.index_dir)?;
    let limit = args.limit.unwrap_or(usize::MAX);

    let mut postings = Vec::new();
    let mut iter = IndexBuilder::open_postings(storage)?;
    for posting in iter.by_ref().take(limit) {
        postings.push(posting?);
    }
    let truncated = postings.len() == limit && iter.next().is_some();

    match cli_args.output_format {
        OutputFormat::Human => {
            output_postings(&postings);
            Ok(())
        }
        OutputFormat::Json => output_result(
            "Postings",
            &DumpResult {
                postings,
                truncated,
            },
            cli_args,
        ),
    }
}

/// Verify an index.
fn verify_index(args: &VerifyArgs, cli_args: &SortMergeArgs) -> Result<()> {
    let storage = open_existing(&args.index_dir)?;
    let report = IndexBuilder::verify(storage)?;
    output_result("Index verified", &report, cli_args)
}

/// Load the builder configuration and apply flag overrides.
fn builder_config(args: &BuildArgs) -> Result<BuilderConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            serde_json::from_reader(BufReader::new(File::open(path)?))?
        }
        None => BuilderConfig::default(),
    };

    if let Some(capacity) = args.run_capacity {
        config.run_writer.capacity = capacity;
    }
    if let Some(capacity) = args.output_capacity {
        config.output_writer.capacity = capacity;
    }
    if args.mixed_runs {
        config.run_writer.seal_on_term_change = false;
    }
    if args.keep_runs {
        config.keep_runs = true;
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }

    config.validate()?;
    Ok(config)
}

fn open_storage(dir: &Path, sync_writes: bool) -> Result<Arc<dyn Storage>> {
    let config = FileStorageConfig {
        sync_writes,
        ..FileStorageConfig::new(dir)
    };
    StorageFactory::create(StorageConfig::File(config))
}

fn open_existing(dir: &Path) -> Result<Arc<dyn Storage>> {
    if !dir.is_dir() {
        return Err(SortMergeError::invalid_argument(format!(
            "index directory {} does not exist",
            dir.display()
        )));
    }
    open_storage(dir, false)
}

/// Parse `term doc` lines into postings.
///
/// Blank lines and `#` comments are skipped.
pub fn parse_postings<R: BufRead>(reader: R) -> impl Iterator<Item = Result<Posting>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(index, line)| match line {
            Ok(line) => parse_posting_line(&line, index + 1).transpose(),
            Err(e) => Some(Err(e.into())),
        })
}

/// Parse one input line. Returns `None` for blank and comment lines.
pub fn parse_posting_line(line: &str, line_number: usize) -> Result<Option<Posting>> {
    let content = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };

    let mut fields = content.split_whitespace();
    let (term, doc) = match (fields.next(), fields.next(), fields.next()) {
        (None, _, _) => return Ok(None),
        (Some(term), Some(doc), None) => (term, doc),
        _ => {
            return Err(SortMergeError::invalid_argument(format!(
                "line {line_number}: expected `term doc`, got {:?}",
                line.trim()
            )));
        }
    };

    let parse = |field: &str, what: &str| {
        field.parse::<u64>().map_err(|e| {
            SortMergeError::invalid_argument(format!(
                "line {line_number}: invalid {what} {field:?}: {e}"
            ))
        })
    };

    Ok(Some(Posting::new(parse(term, "term")?, parse(doc, "doc")?)))
}

/// Split postings into `count` contiguous shards of near-equal size.
fn split_shards(postings: Vec<Posting>, count: usize) -> Vec<Vec<Posting>> {
    let chunk = postings.len().div_ceil(count).max(1);
    postings.chunks(chunk).map(<[Posting]>::to_vec).collect()
}
