//! Incremental archive medium.
//!
//! Binds a storage [`Backend`], a filter chain and an encryption policy
//! into versioned `backup` and `restore` runs. A version becomes visible
//! only once its manifest is on storage, and every payload it references
//! was written before that manifest.

mod backup;
mod restore;
mod scan;

pub use backup::BackupReport;
pub use restore::{RestoreFailure, RestoreReport};

use crate::backend::Backend;
use crate::config::MediumConfig;
use crate::crypto::Cipher;
use crate::descriptor::MediumDescriptor;
use crate::filter::FilterChain;
use crate::layout::{DATA_PREFIX, DESCRIPTOR_KEY, MANIFEST_PREFIX, version_of_key};
use crate::manifest::{EntryStatus, Manifest, ManifestHistory, VersionId};
use crate::{Error, Result, ResultExt};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Progress events emitted while a run is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Scanned { entries: usize },
    Processing { path: String, done: usize, total: usize },
    Committed { version: VersionId },
    Restored { path: String, done: usize, total: usize },
}

/// Cancellation and progress plumbing shared with the caller of a run.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub progress: Option<mpsc::UnboundedSender<Progress>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn report(&self, event: Progress) {
        if let Some(progress) = &self.progress {
            // A front end that stopped listening must not fail the run.
            let _ = progress.send(event);
        }
    }
}

/// Summary of one committed version.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: VersionId,
    pub created_at: DateTime<Utc>,
    pub hostname: String,
    pub source: PathBuf,
    pub entries: usize,
    pub stored: usize,
    pub not_stored: usize,
    pub deleted: usize,
    pub directories: usize,
    pub stored_bytes: u64,
}

impl From<&Manifest> for VersionInfo {
    fn from(manifest: &Manifest) -> Self {
        Self {
            version: manifest.version,
            created_at: manifest.created_at,
            hostname: manifest.hostname.clone(),
            source: manifest.source.clone(),
            entries: manifest.entries.len(),
            stored: manifest.count(EntryStatus::Stored),
            not_stored: manifest.count(EntryStatus::NotStored),
            deleted: manifest.count(EntryStatus::Deleted),
            directories: manifest.count(EntryStatus::Directory),
            stored_bytes: manifest
                .entries()
                .filter(|e| e.status == EntryStatus::Stored)
                .filter_map(|e| e.payload.as_ref())
                .map(|p| p.stored_size)
                .sum(),
        }
    }
}

struct Session {
    descriptor: MediumDescriptor,
    cipher: Arc<Cipher>,
    history: ManifestHistory,
}

/// Versioned backup target.
///
/// One backup or restore runs at a time; a second concurrent call fails
/// with [`Error::MediumBusy`] instead of waiting.
///
/// # Examples
///
/// ```no_run
/// use revsnap_core::{IncrementalMedium, MediumConfig, MemoryBackend, RunControl};
/// use std::path::Path;
/// use std::sync::Arc;
///
/// # async fn run() -> revsnap_core::Result<()> {
/// let medium = IncrementalMedium::new(Arc::new(MemoryBackend::new()), MediumConfig::default())?;
/// medium.install().await?;
/// let report = medium.backup(Path::new("/home/me/docs"), &RunControl::new()).await?;
/// medium.restore(report.version, Path::new("/tmp/restore"), None, &RunControl::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct IncrementalMedium {
    backend: Arc<dyn Backend>,
    config: MediumConfig,
    filters: FilterChain,
    run_lock: Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
}

impl IncrementalMedium {
    /// Validates `config`; no storage is touched until [`install`](Self::install).
    pub fn new(backend: Arc<dyn Backend>, config: MediumConfig) -> Result<Self> {
        let filters = config.validate()?;
        Ok(Self {
            backend,
            config,
            filters,
            run_lock: Mutex::new(()),
            session: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &MediumConfig {
        &self.config
    }

    pub async fn is_installed(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Prepares storage, loads the committed history and removes payloads
    /// left behind by a version that never committed.
    pub async fn install(&self) -> Result<()> {
        let _run = self.run_lock.try_lock().map_err(|_| Error::MediumBusy)?;
        self.backend.init().await?;

        let (descriptor, cipher) = if self.backend.exists(DESCRIPTOR_KEY).await? {
            let descriptor = MediumDescriptor::from_json(&self.backend.read(DESCRIPTOR_KEY).await?)?;
            descriptor.check_compatible(&self.config)?;
            let cipher = descriptor.open_cipher(&self.config)?;
            (descriptor, cipher)
        } else {
            let mut descriptor = MediumDescriptor::new(&self.config);
            let cipher = self.config.encryption.cipher(&descriptor.salt()?, &descriptor.kdf)?;
            descriptor.key_check = cipher.key_check()?;
            self.backend
                .write(DESCRIPTOR_KEY, Bytes::from(descriptor.to_json()?))
                .await?;
            info!(id = %descriptor.id, layout = %descriptor.layout, "Created new medium");
            (descriptor, cipher)
        };

        let history = self.load_history(&cipher).await?;
        let latest = history.latest().map_or(0, |m| m.version);
        self.remove_orphans(latest).await?;

        info!(
            id = %descriptor.id,
            versions = history.len(),
            encrypted = !cipher.is_plain(),
            "Medium installed"
        );
        *self.session.write().await = Some(Arc::new(Session {
            descriptor,
            cipher: Arc::new(cipher),
            history,
        }));
        Ok(())
    }

    async fn load_history(&self, cipher: &Cipher) -> Result<ManifestHistory> {
        let mut manifests = Vec::new();
        for key in self.backend.list(MANIFEST_PREFIX).await? {
            let Some(version) = version_of_key(&key) else {
                warn!(key = %key, "Ignoring unrecognized manifest object");
                continue;
            };

            let sealed = self.backend.read(&key).await?;
            let manifest: Manifest = serde_json::from_slice(&cipher.open(&sealed).at(&key, version)?)
                .map_err(|e| Error::Corruption(format!("Invalid manifest: {}", e)).at(&key, version))?;
            if manifest.version != version {
                return Err(Error::Corruption(format!(
                    "Manifest object {} holds version {}",
                    key, manifest.version
                )));
            }
            manifests.push(manifest);
        }
        ManifestHistory::from_manifests(manifests)
    }

    async fn remove_orphans(&self, latest: VersionId) -> Result<()> {
        for key in self.backend.list(DATA_PREFIX).await? {
            match version_of_key(&key) {
                Some(version) if version > latest => {
                    warn!(key = %key, version, "Removing payload of uncommitted version");
                    self.backend.delete(&key).await?;
                }
                Some(_) => {}
                None => debug!(key = %key, "Ignoring unrecognized data object"),
            }
        }
        Ok(())
    }

    async fn session(&self) -> Result<Arc<Session>> {
        self.session.read().await.clone().ok_or(Error::NotInstalled)
    }

    /// Committed versions, oldest first.
    pub async fn versions(&self) -> Result<Vec<VersionInfo>> {
        let session = self.session().await?;
        Ok(session.history.versions().map(VersionInfo::from).collect())
    }

    pub async fn manifest(&self, version: VersionId) -> Result<Manifest> {
        let session = self.session().await?;
        session
            .history
            .get(version)
            .cloned()
            .ok_or(Error::VersionNotFound { version })
    }

    pub async fn descriptor(&self) -> Result<MediumDescriptor> {
        Ok(self.session().await?.descriptor.clone())
    }
}
