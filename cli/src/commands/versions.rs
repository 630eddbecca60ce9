use super::format_size;
use anyhow::{Result, anyhow};
use clap::Args;

#[derive(Args)]
pub struct VersionsCommand {
    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,

    #[arg(long, help = "Show only the latest N versions")]
    latest: Option<usize>,
}

impl VersionsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let target = cli.target()?;
        let medium = target.open_medium().await?;
        let mut versions = medium.versions().await?;

        if let Some(latest) = self.latest {
            let skip = versions.len().saturating_sub(latest);
            versions.drain(..skip);
        }

        match self.format.as_deref().unwrap_or("table") {
            "table" => {
                if versions.is_empty() {
                    println!("No versions found");
                    return Ok(());
                }
                println!(
                    "{:<8} {:<20} {:<15} {:>8} {:>8} {:>8} {:>12}",
                    "Version", "Date", "Host", "Stored", "Same", "Deleted", "Size"
                );
                println!("{:-<85}", "");
                for info in versions {
                    println!(
                        "{:<8} {:<20} {:<15} {:>8} {:>8} {:>8} {:>12}",
                        info.version,
                        info.created_at.format("%Y-%m-%d %H:%M:%S"),
                        info.hostname,
                        info.stored,
                        info.not_stored,
                        info.deleted,
                        format_size(info.stored_bytes)
                    );
                }
            }
            "json" => println!("{}", serde_json::to_string_pretty(&versions)?),
            other => return Err(anyhow!("Unsupported format: {}", other)),
        }
        Ok(())
    }
}
