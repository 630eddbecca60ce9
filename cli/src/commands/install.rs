use crate::config::TargetConfig;
use anyhow::{Result, anyhow};
use clap::Args;
use revsnap_backends::{RemotePolicy, Security, StoragePolicy};
use revsnap_core::{EncryptionAlgorithm, EncryptionPolicy, MediumConfig, MediumLayout};
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct InstallCommand {
    #[arg(long, help = "Source tree backed up by default")]
    source: Option<PathBuf>,

    #[arg(long, help = "Store the medium under a local directory")]
    local: Option<PathBuf>,

    #[arg(long, help = "Remote storage host", conflicts_with = "local")]
    host: Option<String>,

    #[arg(long, help = "Remote storage port", requires = "host")]
    port: Option<u16>,

    #[arg(long, help = "Remote login", requires = "host")]
    login: Option<String>,

    #[arg(long, help = "Remote directory, starting with the bucket", requires = "host")]
    remote_dir: Option<String>,

    #[arg(long, value_parser = parse_security, default_value = "none", help = "Transport security (none, explicit, implicit)")]
    security: Security,

    #[arg(long, help = "Use path-style (passive) addressing")]
    passive: bool,

    #[arg(long, value_parser = parse_layout, default_value = "directory", help = "Layout (directory, container, container64, tar.gz)")]
    layout: MediumLayout,

    #[arg(long, help = "Encrypt payloads and manifests")]
    encrypt: bool,

    #[arg(long, value_parser = parse_algorithm, default_value = "chacha20-poly1305", help = "Cipher (chacha20-poly1305, aes-256-gcm)")]
    algorithm: EncryptionAlgorithm,

    #[arg(long, help = "Overwrite an existing target configuration")]
    force: bool,
}

fn parse_security(value: &str) -> std::result::Result<Security, String> {
    match value.to_ascii_lowercase().as_str() {
        "none" => Ok(Security::None),
        "explicit" => Ok(Security::Explicit),
        "implicit" => Ok(Security::Implicit),
        other => Err(format!("unknown security mode: {}", other)),
    }
}

fn parse_layout(value: &str) -> std::result::Result<MediumLayout, String> {
    match value.to_ascii_lowercase().as_str() {
        "directory" => Ok(MediumLayout::Directory),
        "container" => Ok(MediumLayout::Container),
        "container64" => Ok(MediumLayout::Container64),
        "tar.gz" | "targz" | "tar_gz" => Ok(MediumLayout::TarGz),
        other => Err(format!("unknown layout: {}", other)),
    }
}

fn parse_algorithm(value: &str) -> std::result::Result<EncryptionAlgorithm, String> {
    match value.to_ascii_lowercase().replace('_', "-").as_str() {
        "chacha20-poly1305" | "chacha20" => Ok(EncryptionAlgorithm::ChaCha20Poly1305),
        "aes-256-gcm" | "aes256-gcm" | "aes" => Ok(EncryptionAlgorithm::Aes256Gcm),
        other => Err(format!("unknown algorithm: {}", other)),
    }
}

impl InstallCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let path = cli.config_path()?;
        if let Some(target) = self.target()? {
            if path.exists() && !self.force {
                return Err(anyhow!(
                    "{} already exists; pass --force to replace it",
                    path.display()
                ));
            }
            target.save(&path)?;
            info!(path = %path.display(), "Wrote target configuration");
        }

        let target = cli.target()?;
        let medium = target.open_medium().await?;
        let descriptor = medium.descriptor().await?;
        let versions = medium.versions().await?;

        println!("Medium:      {}", descriptor.id);
        println!("Storage:     {}", target.storage);
        println!("Layout:      {}", descriptor.layout);
        println!("Block size:  {}", descriptor.block_size);
        match descriptor.encryption {
            Some(algorithm) => println!("Encryption:  {}", algorithm),
            None => println!("Encryption:  none"),
        }
        println!("Versions:    {}", versions.len());
        Ok(())
    }

    /// Target described by the command line, if any storage flag was given.
    fn target(&self) -> Result<Option<TargetConfig>> {
        let storage = match (&self.local, &self.host) {
            (Some(base_path), None) => StoragePolicy::Local {
                base_path: base_path.clone(),
            },
            (None, Some(host)) => StoragePolicy::Remote(RemotePolicy {
                host: host.clone(),
                port: self.port,
                passive: self.passive,
                security: self.security,
                login: self.login.clone().ok_or_else(|| anyhow!("--login is required with --host"))?,
                password: String::new(),
                remote_directory: self
                    .remote_dir
                    .clone()
                    .ok_or_else(|| anyhow!("--remote-dir is required with --host"))?,
                region: "us-east-1".to_string(),
            }),
            _ => return Ok(None),
        };

        let encryption = EncryptionPolicy {
            enabled: self.encrypt,
            algorithm: self.algorithm,
            key: None,
        };
        Ok(Some(TargetConfig {
            source: self.source.clone(),
            storage,
            medium: MediumConfig {
                layout: self.layout,
                encryption,
                ..Default::default()
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_parsers() {
        assert_eq!(parse_layout("tar.gz").unwrap(), MediumLayout::TarGz);
        assert_eq!(parse_layout("Container64").unwrap(), MediumLayout::Container64);
        assert!(parse_layout("zip").is_err());
        assert_eq!(parse_algorithm("AES_256_GCM").unwrap(), EncryptionAlgorithm::Aes256Gcm);
        assert_eq!(parse_security("implicit").unwrap(), Security::Implicit);
    }
}
