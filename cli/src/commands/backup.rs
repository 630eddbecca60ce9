use super::{RunUi, format_size};
use anyhow::{Result, anyhow};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Source tree (defaults to the target's source)")]
    source: Option<PathBuf>,

    #[arg(long, help = "Print the backup report as JSON")]
    json: bool,
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let target = cli.target()?;
        let source = self
            .source
            .clone()
            .or_else(|| target.source.clone())
            .ok_or_else(|| anyhow!("No source given and the target configuration names none"))?;

        let medium = target.open_medium().await?;
        info!(source = %source.display(), storage = %target.storage, "Backing up");

        let ui = RunUi::start(cli.quiet() || self.json)?;
        let result = medium.backup(&source, &ui.control).await;
        ui.finish().await;
        let report = result?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!("Version:     {}", report.version);
        println!(
            "Entries:     {} stored, {} unchanged, {} deleted, {} directories",
            report.stored, report.not_stored, report.deleted, report.directories
        );
        println!(
            "Payloads:    {} full, {} delta",
            report.full_payloads, report.delta_payloads
        );
        println!(
            "Written:     {} for {} of changed content",
            format_size(report.bytes_written),
            format_size(report.source_bytes)
        );
        if report.delta_payloads > 0 {
            println!(
                "Delta:       {} matched, {} literal",
                format_size(report.delta.matched_bytes),
                format_size(report.delta.literal_bytes)
            );
        }
        Ok(())
    }
}
