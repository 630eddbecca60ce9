use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use revsnap_backends::StoragePolicy;
use revsnap_core::{IncrementalMedium, MediumConfig};
use serde::{Deserialize, Serialize};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One backup target: what to back up, where, and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Default source tree for `backup`.
    pub source: Option<PathBuf>,
    pub storage: StoragePolicy,
    #[serde(default)]
    pub medium: MediumConfig,
}

pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("org", "revsnap", "revsnap")
        .ok_or_else(|| anyhow!("Could not determine a configuration directory; pass --config"))?;
    Ok(dirs.config_dir().join("target.toml"))
}

impl TargetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read target configuration {}", path.display()))?;
        let config: TargetConfig =
            toml::from_str(&text).with_context(|| format!("Invalid target configuration {}", path.display()))?;
        debug!(path = %path.display(), "Loaded target configuration");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Fills in secrets that are never stored in the file: the encryption
    /// key and the remote storage password.
    pub fn resolve_secrets(&mut self, key: Option<&str>, storage_password: Option<&str>) -> Result<()> {
        let encryption = &mut self.medium.encryption;
        if encryption.enabled && encryption.key.is_none() {
            encryption.key = Some(match key {
                Some(key) => key.to_string(),
                None => prompt("Encryption key: ")?,
            });
        }

        if let StoragePolicy::Remote(remote) = &mut self.storage {
            if remote.password.is_empty() {
                remote.password = match storage_password {
                    Some(password) => password.to_string(),
                    None => prompt(&format!("Password for {}@{}: ", remote.login, remote.host))?,
                };
            }
        }
        Ok(())
    }

    pub async fn open_medium(&self) -> Result<IncrementalMedium> {
        let backend = self.storage.connect().await?;
        let medium = IncrementalMedium::new(backend, self.medium.clone())?;
        medium
            .install()
            .await
            .with_context(|| format!("Failed to open medium at {}", self.storage))?;
        Ok(medium)
    }
}

fn prompt(label: &str) -> Result<String> {
    if !io::stdin().is_terminal() {
        return Err(anyhow!("{}required but no terminal is attached", label.trim_end_matches(' ')));
    }
    print!("{}", label);
    io::stdout().flush()?;
    let secret = rpassword::read_password()?;
    if secret.is_empty() {
        return Err(anyhow!("Empty secret entered"));
    }
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use revsnap_core::{EncryptionAlgorithm, MediumLayout};

    const SAMPLE: &str = r#"
source = "/srv/www"

[storage]
type = "remote"
host = "backup.example.com"
port = 9000
passive = true
security = "implicit"
login = "web"
remote_directory = "archive/www"

[medium]
layout = "tar_gz"
verify_content = true

[medium.encryption]
enabled = true
algorithm = "aes256_gcm"

[[medium.filters]]
kind = "extension"
exclude = true
extensions = ["tmp", "swp"]
"#;

    #[test]
    fn test_parse_target_file() {
        let mut config: TargetConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.source, Some(PathBuf::from("/srv/www")));
        assert_eq!(config.medium.layout, MediumLayout::TarGz);
        assert_eq!(config.medium.encryption.algorithm, EncryptionAlgorithm::Aes256Gcm);
        assert_eq!(config.medium.filters.len(), 1);

        config.resolve_secrets(Some("k3y"), Some("pa55")).unwrap();
        assert_eq!(config.medium.encryption.key.as_deref(), Some("k3y"));
        match &config.storage {
            StoragePolicy::Remote(remote) => {
                assert_eq!(remote.password, "pa55");
                assert_eq!(remote.bucket(), "archive");
            }
            other => panic!("unexpected storage {other:?}"),
        }
    }

    #[test]
    fn test_saved_file_keeps_no_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/target.toml");
        let mut config: TargetConfig = toml::from_str(SAMPLE).unwrap();
        config.resolve_secrets(Some("k3y"), Some("pa55")).unwrap();
        config.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("k3y"));
        assert!(!text.contains("pa55"));
        let reloaded = TargetConfig::load(&path).unwrap();
        assert_eq!(reloaded.medium.encryption.key, None);
        assert_eq!(reloaded.medium.layout, config.medium.layout);
        assert_eq!(reloaded.medium.filters, config.medium.filters);
    }
}
