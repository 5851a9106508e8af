//! Progress bars for running downloads.

use std::io::{self, IsTerminal};

use downloader_core::{DownloadTask, TaskEvent, TaskStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::task::JoinHandle;

const BAR_TEMPLATE: &str =
    "{prefix:>11.bold} {msg:24!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {binary_bytes_per_sec} {eta}";

/// Creates the bar container; hidden when quiet or stderr is not a terminal.
pub(crate) fn multi_progress(quiet: bool) -> MultiProgress {
    if quiet || !io::stderr().is_terminal() {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new()
    }
}

/// Adds a bar for `task` and drives it from the task's events until the
/// task finishes.
pub(crate) fn track_task(multi: &MultiProgress, task: &DownloadTask) -> JoinHandle<()> {
    let bar = multi.add(ProgressBar::new(0));
    bar.set_style(
        ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.set_prefix(task.status().to_string());
    bar.set_message(task.file_name().to_string());

    let mut events = task.subscribe();
    let task = task.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TaskEvent::StatusChanged(status) => bar.set_prefix(status.to_string()),
                TaskEvent::Progress(progress) => {
                    if let Some(total) = progress.total {
                        bar.set_length(total);
                    }
                    bar.set_position(progress.downloaded);
                }
                TaskEvent::Error(message) => {
                    bar.set_message(format!("{}: {message}", task.file_name()));
                }
                TaskEvent::Finished => break,
            }
        }

        if task.status() == TaskStatus::Completed {
            bar.finish();
        } else {
            bar.abandon();
        }
    })
}
