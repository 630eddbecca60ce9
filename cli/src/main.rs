mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    backup::BackupCommand, install::InstallCommand, ls::LsCommand, restore::RestoreCommand,
    versions::VersionsCommand,
};
use config::{TargetConfig, default_config_path};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "revsnap",
    version,
    about = "Incremental, delta-encoded backups",
    long_about = "Revsnap keeps an append-only history of versions of a directory tree, storing only \
                  what changed since the previous version as rsync-style deltas"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "REVSNAP_CONFIG", help = "Target configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "REVSNAP_KEY", hide_env_values = true, help = "Encryption key")]
    key: Option<String>,

    #[arg(
        long,
        global = true,
        env = "REVSNAP_STORAGE_PASSWORD",
        hide_env_values = true,
        help = "Remote storage password"
    )]
    storage_password: Option<String>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Only print warnings and errors")]
    quiet: bool,
}

impl Cli {
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => default_config_path(),
        }
    }

    /// Loads the target file with its secrets resolved.
    pub fn target(&self) -> Result<TargetConfig> {
        let path = self.config_path()?;
        let mut target = TargetConfig::load(&path)?;
        target.resolve_secrets(self.key.as_deref(), self.storage_password.as_deref())?;
        Ok(target)
    }

    pub fn quiet(&self) -> bool {
        self.quiet
    }
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create or open the medium of a target")]
    Install(InstallCommand),

    #[command(about = "Back up the source tree as a new version")]
    Backup(BackupCommand),

    #[command(about = "Restore a version into a directory")]
    Restore(RestoreCommand),

    #[command(about = "List committed versions")]
    Versions(VersionsCommand),

    #[command(about = "List the entries of a version")]
    Ls(LsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;
    debug!("Starting revsnap");

    match &cli.command {
        Commands::Install(cmd) => cmd.run(&cli).await,
        Commands::Backup(cmd) => cmd.run(&cli).await,
        Commands::Restore(cmd) => cmd.run(&cli).await,
        Commands::Versions(cmd) => cmd.run(&cli).await,
        Commands::Ls(cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("revsnap={level},revsnap_core={level},revsnap_backends={level}"))
    });
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
