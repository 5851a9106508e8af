//! CLI entry point for the downloader tool.

use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use downloader_core::{
    DownloadRequest, DownloadTask, HistoryStore, RegistryEvent, Settings, TaskContext,
    TaskRegistry, TaskStatus,
};
use tracing::{debug, error, info, warn};

mod cli;
mod progress;

use cli::{Cli, Command, DownloadArgs};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?cli, "CLI arguments parsed");

    let mut settings = Settings::load().context("failed to load settings")?;
    if let Some(dir) = &cli.download.output_dir {
        settings.download_dir.clone_from(dir);
    }
    if let Some(threads) = cli.download.threads {
        settings.chunk_count = usize::from(threads);
    }
    debug!(?settings, "settings resolved");

    let history = settings
        .open_history()
        .await
        .with_context(|| format!("failed to open history at {}", settings.history_path().display()))?;

    match cli.command {
        Some(Command::History(args)) => run_history(history.as_ref(), args.clear).await,
        None => run_downloads(settings, history, &cli.download, cli.quiet).await,
    }
}

async fn run_history(history: &dyn HistoryStore, clear: bool) -> Result<ExitCode> {
    if clear {
        history.clear_history().await?;
        info!("History cleared");
        return Ok(ExitCode::SUCCESS);
    }

    let records = history.get_history().await?;
    if records.is_empty() {
        info!("No downloads in history");
    }
    for record in records {
        let finished = record
            .finish_time
            .map_or_else(|| "-".to_string(), |time| time.to_rfc3339());
        println!(
            "{:<9} {:>12} {} {} {}",
            record.status,
            record.file_size,
            finished,
            record.file_path.display(),
            record.url
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn read_requests(args: &DownloadArgs) -> Result<Vec<DownloadRequest>> {
    let input_text = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        return Ok(Vec::new());
    };

    let mut requests = Vec::new();
    for line in input_text.lines() {
        match DownloadRequest::from_line(line) {
            Some(Ok(request)) => requests.push(request),
            Some(Err(e)) => warn!(line, error = %e, "Skipped malformed request"),
            None => {}
        }
    }
    Ok(requests)
}

async fn run_downloads(
    settings: Settings,
    history: Arc<dyn HistoryStore>,
    args: &DownloadArgs,
    quiet: bool,
) -> Result<ExitCode> {
    let requests = read_requests(args)?;
    if requests.is_empty() {
        info!("No input provided. Pipe URLs via stdin or pass as arguments.");
        info!("Example: echo 'https://example.com/file.iso' | downloader");
        return Ok(ExitCode::SUCCESS);
    }

    let registry = Arc::new(TaskRegistry::new(TaskContext::new(history), settings));
    let mut events = registry.subscribe();
    let multi = progress::multi_progress(quiet);

    let mut tasks: Vec<DownloadTask> = Vec::new();
    let mut rejected = 0usize;
    for request in &requests {
        match registry.create_task_from_request(request, None) {
            Ok(task) => tasks.push(task),
            Err(e) => {
                error!(url = %request.url, error = %e, "Rejected download request");
                rejected += 1;
            }
        }
    }

    let bars: Vec<_> = tasks
        .iter()
        .map(|task| progress::track_task(&multi, task))
        .collect();

    let interrupt = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling downloads (part files are kept)");
                registry.cancel_all(false);
            }
        })
    };

    for task in &tasks {
        registry.start_task(task);
    }

    let mut remaining = tasks.len();
    while remaining > 0 {
        match events.recv().await {
            Some(RegistryEvent::TaskFinished { id }) => {
                debug!(task_id = id, "task finished");
                remaining -= 1;
            }
            Some(RegistryEvent::TaskError { id, message }) => {
                error!(task_id = id, error = %message, "Download failed");
            }
            Some(RegistryEvent::TaskAdded(_)) => {}
            None => break,
        }
    }
    interrupt.abort();
    for bar in bars {
        let _ = bar.await;
    }

    let completed = tasks
        .iter()
        .filter(|task| task.status() == TaskStatus::Completed)
        .count();
    let failed = tasks.len() - completed + rejected;

    for task in tasks.iter().filter(|task| task.status() == TaskStatus::Completed) {
        println!("{}", task.file_path().display());
    }

    info!(
        completed,
        failed,
        total = requests.len(),
        "Download complete"
    );

    if failed > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
