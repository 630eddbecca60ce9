use super::format_size;
use anyhow::{Result, anyhow};
use clap::Args;
use revsnap_core::{EntryStatus, PayloadEncoding, RecoveryEntry};

#[derive(Args)]
pub struct LsCommand {
    #[arg(help = "Version to list (defaults to the latest)")]
    version: Option<u64>,

    #[arg(help = "Only list entries at or below this path")]
    path: Option<String>,

    #[arg(long, help = "Include deleted entries")]
    all: bool,
}

impl LsCommand {
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

        let manifest = medium.manifest(version).await?;
        let prefix = self.path.as_deref().map(|p| p.trim_matches('/')).unwrap_or("");
        for entry in manifest.entries() {
            if !self.all && entry.status == EntryStatus::Deleted {
                continue;
            }
            if !prefix.is_empty() && entry.path != prefix && !entry.path.starts_with(&format!("{}/", prefix)) {
                continue;
            }

            println!("{}", format_entry(entry));
        }
        Ok(())
    }
}

/// One listing line: status, size, short content hash, path and payload origin.
fn format_entry(entry: &RecoveryEntry) -> String {
    let origin = match &entry.payload {
        Some(payload) => match payload.encoding {
            PayloadEncoding::Full => format!("v{} full", payload.version),
            PayloadEncoding::Delta { base, depth } => {
                format!("v{} delta on v{} (depth {})", payload.version, base, depth)
            }
        },
        None => String::new(),
    };
    let hash = entry
        .content_hash
        .map(|h| h.short_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<10} {:>12}  {:<8}  {}{}  {}",
        entry.status,
        format_size(entry.size),
        hash,
        entry.path,
        if entry.symlink { " (link)" } else { "" },
        origin
    )
    .trim_end()
    .to_string()
}
