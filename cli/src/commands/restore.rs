use super::{RunUi, format_size};
use anyhow::{Result, anyhow};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Target directory for restore")]
    target: PathBuf,

    #[arg(long, help = "Version to restore (defaults to the latest)")]
    version: Option<u64>,

    #[arg(long, help = "Only restore this file or directory")]
    path: Option<String>,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let target = cli.target()?;
        let medium = target.open_medium().await?;

        let version = match self.version {
            Some(version) => version,
            None => medium
                .versions()
                .await?
                .last()
                .map(|v| v.version)
                .ok_or_else(|| anyhow!("The medium has no versions yet"))?,
        };
        info!(version, target = %self.target.display(), "Restoring");

        let ui = RunUi::start(cli.quiet())?;
        let result = medium
            .restore(version, &self.target, self.path.as_deref(), &ui.control)
            .await;
        ui.finish().await;
        let report = result?;

        println!(
            "Restored {} files and {} directories ({}) from version {} into {}",
            report.restored.len(),
            report.directories,
            format_size(report.bytes_restored),
            report.version,
            self.target.display()
        );

        if report.is_complete() {
            return Ok(());
        }
        for failure in &report.failures {
            eprintln!("FAILED {}: {}", failure.path, failure.message);
        }
        Err(anyhow!("{} entries could not be restored", report.failures.len()))
    }
}
