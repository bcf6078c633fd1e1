//! Command line argument parsing for the sortmerge CLI using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

/// sortmerge - build sorted posting lists with an external sort-merge
#[derive(Parser, Debug, Clone)]
#[command(name = "sortmerge")]
#[command(about = "Build sorted inverted-index postings with an external sort-merge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct SortMergeArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human", global = true)]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl SortMergeArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n.saturating_add(1),
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build an index from a file of `term doc` lines
    Build(BuildArgs),

    /// Print the postings of an index in order
    Dump(DumpArgs),

    /// Check that an index decodes and is globally sorted
    Verify(VerifyArgs),
}

/// Arguments for building an index
#[derive(Parser, Debug, Clone)]
pub struct BuildArgs {
    /// Input file with one `term doc` pair per line (`-` for stdin)
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Directory receiving the index
    #[arg(value_name = "INDEX_DIR")]
    pub index_dir: PathBuf,

    /// Builder configuration file (JSON); flags override its fields
    #[arg(short, long, value_name = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Postings buffered per intermediate run
    #[arg(long, value_name = "N")]
    pub run_capacity: Option<usize>,

    /// Postings per output run
    #[arg(long, value_name = "N")]
    pub output_capacity: Option<usize>,

    /// Let intermediate runs mix terms instead of sealing on each new term
    #[arg(long)]
    pub mixed_runs: bool,

    /// Split the input into N shards spilled in parallel
    #[arg(short, long, value_name = "N")]
    pub shards: Option<usize>,

    /// Threads used for sharded spilling
    #[arg(short, long, value_name = "N")]
    pub threads: Option<usize>,

    /// Keep intermediate runs after merging
    #[arg(long)]
    pub keep_runs: bool,

    /// Sync every run to disk when it is closed
    #[arg(long)]
    pub sync_writes: bool,
}

/// Arguments for dumping an index
#[derive(Parser, Debug, Clone)]
pub struct DumpArgs {
    /// Directory holding the index
    #[arg(value_name = "INDEX_DIR")]
    pub index_dir: PathBuf,

    /// Maximum number of postings to print
    #[arg(short, long)]
    pub limit: Option<usize>,
}

/// Arguments for verifying an index
#[derive(Parser, Debug, Clone)]
pub struct VerifyArgs {
    /// Directory holding the index
    #[arg(value_name = "INDEX_DIR")]
    pub index_dir: PathBuf,
}

/// Output formats
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_command() {
        let args = SortMergeArgs::try_parse_from([
            "sortmerge",
            "build",
            "postings.txt",
            "/tmp/index",
            "--run-capacity",
            "128",
            "--mixed-runs",
            "--shards",
            "4",
        ])
        .unwrap();

        if let Command::Build(build_args) = args.command {
            assert_eq!(build_args.input, PathBuf::from("postings.txt"));
            assert_eq!(build_args.index_dir, PathBuf::from("/tmp/index"));
            assert_eq!(build_args.run_capacity, Some(128));
            assert_eq!(build_args.output_capacity, None);
            assert!(build_args.mixed_runs);
            assert_eq!(build_args.shards, Some(4));
            assert!(!build_args.keep_runs);
        } else {
            panic!("Expected Build command");
        }
    }

    #[test]
    fn test_dump_command_with_limit() {
        let args =
            SortMergeArgs::try_parse_from(["sortmerge", "dump", "/tmp/index", "--limit", "10"])
                .unwrap();

        if let Command::Dump(dump_args) = args.command {
            assert_eq!(dump_args.limit, Some(10));
        } else {
            panic!("Expected Dump command");
        }
    }

    #[test]
    fn test_global_flags() {
        let args = SortMergeArgs::try_parse_from([
            "sortmerge",
            "verify",
            "/tmp/index",
            "--format",
            "json",
            "--pretty",
            "-vv",
        ])
        .unwrap();

        assert_eq!(args.output_format, OutputFormat::Json);
        assert!(args.pretty);
        assert_eq!(args.verbosity(), 3);
        assert!(matches!(args.command, Command::Verify(_)));
    }

    #[test]
    fn test_quiet_overrides_verbose() {
        let args =
            SortMergeArgs::try_parse_from(["sortmerge", "-q", "-v", "verify", "/tmp/index"])
                .unwrap();
        assert_eq!(args.verbosity(), 0);
    }

    #[test]
    fn test_missing_index_dir_is_rejected() {
        assert!(SortMergeArgs::try_parse_from(["sortmerge", "build", "postings.txt"]).is_err());
    }
}
