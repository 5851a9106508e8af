//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Segmented HTTP download manager.
///
/// Downloads each URL with several concurrent range requests and merges the
/// chunks into the destination file. URLs (or JSON request objects, one per
/// line) are read from stdin when none are given.
#[derive(Parser, Debug)]
#[command(name = "downloader")]
#[command(author, version, about)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub download: DownloadArgs,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List finished downloads
    History(HistoryArgs),
}

#[derive(Args, Debug, Default)]
pub struct HistoryArgs {
    /// Remove all history records
    #[arg(long)]
    pub clear: bool,
}

#[derive(Args, Debug, Default)]
pub struct DownloadArgs {
    /// URLs to download
    #[arg(value_name = "URLS")]
    pub urls: Vec<String>,

    /// Chunks per download (1-32, default from config)
    #[arg(short = 't', long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub threads: Option<u8>,

    /// Directory for downloads without an explicit save path
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,
}
