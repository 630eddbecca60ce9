pub mod backup;
pub mod install;
pub mod ls;
pub mod restore;
pub mod versions;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use revsnap_core::{Progress, RunControl};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Progress display and Ctrl-C handling around one medium run.
pub struct RunUi {
    pub control: RunControl,
    display: JoinHandle<()>,
}

impl RunUi {
    pub fn start(quiet: bool) -> Result<Self> {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, discarding the run in progress");
                interrupt.cancel();
            }
        });

        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        bar.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
        bar.set_message("Scanning...");
        let bar_style =
            ProgressStyle::default_bar().template("{bar:40.cyan/blue} {pos:>7}/{len:7} {wide_msg}")?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let display = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    Progress::Scanned { entries } => {
                        bar.set_style(bar_style.clone());
                        bar.set_length(entries as u64);
                    }
                    Progress::Processing { path, done, total } | Progress::Restored { path, done, total } => {
                        bar.set_length(total as u64);
                        bar.set_position(done as u64);
                        bar.set_message(path);
                    }
                    Progress::Committed { version } => {
                        bar.finish_with_message(format!("Committed version {}", version));
                    }
                }
            }
            if !bar.is_finished() {
                bar.finish_and_clear();
            }
        });

        Ok(Self {
            control: RunControl::new().with_progress(tx).with_cancellation(cancel),
            display,
        })
    }

    /// Closes the progress channel and waits for the display to settle.
    pub async fn finish(self) {
        let RunUi { control, display } = self;
        drop(control);
        let _ = display.await;
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
