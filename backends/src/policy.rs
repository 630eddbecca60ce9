//! Storage placement policies.
//!
//! A [`StoragePolicy`] is the serializable description of where a medium
//! lives; [`StoragePolicy::connect`] realizes it as a [`Backend`].

use crate::local::LocalBackend;
use crate::remote::RemoteBackend;
use crate::retry::RetryConfig;
use revsnap_core::{Backend, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoragePolicy {
    Local { base_path: PathBuf },
    Remote(RemotePolicy),
}

/// Transport security of a remote connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    #[default]
    None,
    /// TLS negotiated on the plain port.
    Explicit,
    /// TLS from the first byte.
    Implicit,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RemotePolicy {
    pub host: String,
    pub port: Option<u16>,
    /// Path-style addressing instead of virtual-hosted buckets.
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub security: Security,
    pub login: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    /// `bucket/prefix/...`
    pub remote_directory: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl fmt::Debug for RemotePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePolicy")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("passive", &self.passive)
            .field("security", &self.security)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("remote_directory", &self.remote_directory)
            .field("region", &self.region)
            .finish()
    }
}

impl RemotePolicy {
    pub fn validate(&self) -> Result<()> {
        let missing = [
            ("host", self.host.trim().is_empty()),
            ("login", self.login.is_empty()),
            ("password", self.password.is_empty()),
            ("remote directory", self.bucket().is_empty()),
        ];
        for (field, is_missing) in missing {
            if is_missing {
                return Err(Error::Configuration(format!("Remote storage requires a {}", field)));
            }
        }
        if self.host.contains("://") || self.host.contains('/') {
            return Err(Error::Configuration(format!(
                "Remote host must be a bare host name, got {}",
                self.host
            )));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> String {
        let scheme = match self.security {
            Security::None => "http",
            Security::Explicit | Security::Implicit => "https",
        };
        match self.port {
            Some(port) => format!("{}://{}:{}", scheme, self.host.trim(), port),
            None => format!("{}://{}", scheme, self.host.trim()),
        }
    }

    pub fn bucket(&self) -> &str {
        self.remote_directory
            .trim_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
    }

    pub fn prefix(&self) -> String {
        let directory = self.remote_directory.trim_matches('/');
        match directory.split_once('/') {
            Some((_, rest)) => rest.trim_matches('/').to_string(),
            None => String::new(),
        }
    }
}

impl StoragePolicy {
    /// Rejects a policy that could never be realized, before any I/O.
    pub fn validate(&self) -> Result<()> {
        match self {
            StoragePolicy::Local { base_path } if base_path.as_os_str().is_empty() => {
                Err(Error::Configuration("Local storage requires a base path".to_string()))
            }
            StoragePolicy::Local { .. } => Ok(()),
            StoragePolicy::Remote(remote) => remote.validate(),
        }
    }

    pub async fn connect(&self) -> Result<Arc<dyn Backend>> {
        self.validate()?;
        match self {
            StoragePolicy::Local { base_path } => {
                info!(path = %base_path.display(), "Using local storage");
                Ok(Arc::new(LocalBackend::new(base_path)))
            }
            StoragePolicy::Remote(remote) => {
                info!(endpoint = %remote.endpoint(), bucket = remote.bucket(), "Using remote storage");
                Ok(Arc::new(RemoteBackend::new(remote, RetryConfig::default()).await?))
            }
        }
    }
}

impl fmt::Display for StoragePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoragePolicy::Local { base_path } => write!(f, "{}", base_path.display()),
            StoragePolicy::Remote(remote) => write!(f, "{}/{}", remote.endpoint(), remote.remote_directory.trim_matches('/')),
        }
    }
}
