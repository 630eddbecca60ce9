use super::scan::target_path;
use super::{IncrementalMedium, Progress, RunControl};
use crate::crypto::Cipher;
use crate::delta::DeltaRecord;
use crate::entry_path::os_from_bytes;
use crate::filter::is_within;
use crate::layout::PayloadStore;
use crate::manifest::{EntryStatus, ManifestHistory, PayloadEncoding, PayloadRef, RecoveryEntry, VersionId};
use crate::{Error, ErrorKind, Result, StrongHash};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RestoreFailure {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one restore run.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub version: VersionId,
    pub restored: Vec<String>,
    pub directories: usize,
    pub bytes_restored: u64,
    pub failures: Vec<RestoreFailure>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Rebuilds the exact content behind `payload`.
///
/// A delta payload is resolved by walking its bases back to a full payload
/// and replaying every record forward. Payloads are read from storage and
/// opened by the cipher before any delta decoding.
pub(super) async fn resolve_payload(
    store: &mut PayloadStore,
    cipher: &Cipher,
    history: &ManifestHistory,
    path: &str,
    payload: &PayloadRef,
) -> Result<Vec<u8>> {
    let mut chain = vec![payload.clone()];
    while let Some(PayloadEncoding::Delta { base, .. }) = chain.last().map(|p| p.encoding) {
        let current = chain.last().map_or(0, |p| p.version);
        if base >= current {
            return Err(Error::Corruption(format!(
                "Delta payload of version {} points forward to version {}",
                current, base
            )));
        }
        let base_ref = history
            .find_stored(path, base)
            .filter(|(version, _)| *version == base)
            .and_then(|(_, e)| e.payload.clone())
            .filter(|p| p.version == base)
            .ok_or_else(|| Error::Corruption(format!("Delta base in version {} is missing", base)))?;
        chain.push(base_ref);
    }

    let mut content = Vec::new();
    while let Some(link) = chain.pop() {
        let payload = cipher.open(&store.get(link.version, path).await?)?;
        content = match link.encoding {
            PayloadEncoding::Full => payload,
            PayloadEncoding::Delta { .. } => DeltaRecord::from_bytes(&payload)?.apply(&content)?,
        };
    }
    Ok(content)
}

impl IncrementalMedium {
    /// Restores version `version` under `target`, optionally limited to
    /// the entries at or below `path_filter`.
    ///
    /// Corrupted or undecryptable entries are reported in the returned
    /// [`RestoreReport`] and do not stop the other entries; storage and
    /// filesystem errors abort the run.
    pub async fn restore(
        &self,
        version: VersionId,
        target: &Path,
        path_filter: Option<&str>,
        control: &RunControl,
    ) -> Result<RestoreReport> {
        let _run = self.run_lock.try_lock().map_err(|_| Error::MediumBusy)?;
        let session = self.session().await?;
        let manifest = session
            .history
            .get(version)
            .ok_or(Error::VersionNotFound { version })?;

        let prefix = path_filter.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty());
        let selected: Vec<&RecoveryEntry> = manifest
            .entries()
            .filter(|e| e.status != EntryStatus::Deleted)
            .filter(|e| prefix.is_none_or(|p| is_within(&e.path, p)))
            .collect();
        if let Some(path) = prefix {
            if selected.is_empty() {
                return Err(Error::EntryNotFound {
                    path: path.to_string(),
                    version,
                });
            }
        }

        info!(version, target = %target.display(), entries = selected.len(), "Starting restore");
        tokio::fs::create_dir_all(target).await?;

        let mut store = PayloadStore::new(session.descriptor.layout, self.backend.clone());
        let mut report = RestoreReport {
            version,
            ..Default::default()
        };
        let mut directory_modes: Vec<(PathBuf, u32)> = Vec::new();
        let total = selected.len();

        for (done, entry) in selected.into_iter().enumerate() {
            control.check()?;
            let destination = match target_path(target, &entry.path) {
                Ok(path) => path,
                Err(e) => {
                    record_failure(&mut report, entry, e.at(&entry.path, version));
                    continue;
                }
            };

            if entry.status == EntryStatus::Directory {
                tokio::fs::create_dir_all(&destination).await?;
                if let Some(mode) = entry.mode {
                    directory_modes.push((destination, mode));
                }
                report.directories += 1;
            } else {
                let content = match self
                    .entry_content(&mut store, &session.cipher, &session.history, version, entry)
                    .await
                {
                    Ok(content) => content,
                    Err(e) if matches!(e.kind(), ErrorKind::Corruption | ErrorKind::Encryption) => {
                        record_failure(&mut report, entry, e.at(&entry.path, version));
                        continue;
                    }
                    Err(e) => return Err(e.at(&entry.path, version)),
                };
                write_entry(&destination, entry, &content).await?;
                report.bytes_restored += content.len() as u64;
                report.restored.push(entry.path.clone());
            }

            control.report(Progress::Restored {
                path: entry.path.clone(),
                done: done + 1,
                total,
            });
        }

        // Applied last so read-only directories still accept their children.
        for (path, mode) in directory_modes {
            set_mode(&path, mode).await?;
        }

        info!(
            version,
            restored = report.restored.len(),
            failed = report.failures.len(),
            "Restore finished"
        );
        Ok(report)
    }

    async fn entry_content(
        &self,
        store: &mut PayloadStore,
        cipher: &Cipher,
        history: &ManifestHistory,
        version: VersionId,
        entry: &RecoveryEntry,
    ) -> Result<Vec<u8>> {
        let payload = entry
            .payload
            .as_ref()
            .ok_or_else(|| Error::Corruption("Entry has no payload reference".to_string()))?;

        // The payload must be the one of the nearest STORED record at or
        // before this version.
        let (stored_in, stored) = history
            .find_stored(&entry.path, version)
            .ok_or_else(|| Error::Corruption(format!("No stored record at or before version {}", version)))?;
        if stored.payload.as_ref() != Some(payload) {
            return Err(Error::Corruption(format!(
                "Payload reference disagrees with the record stored in version {}",
                stored_in
            )));
        }
        let content = resolve_payload(store, cipher, history, &entry.path, payload).await?;

        if let Some(expected) = entry.content_hash {
            if StrongHash::from_data(&content) != expected {
                return Err(Error::Corruption(
                    "Restored content failed strong hash verification".to_string(),
                ));
            }
        }
        debug!(path = %entry.path, size = content.len(), "Resolved entry content");
        Ok(content)
    }
}

fn record_failure(report: &mut RestoreReport, entry: &RecoveryEntry, error: Error) {
    warn!(path = %entry.path, error = %error, "Entry could not be restored");
    report.failures.push(RestoreFailure {
        path: entry.path.clone(),
        kind: error.kind(),
        message: error.to_string(),
    });
}

async fn write_entry(destination: &Path, entry: &RecoveryEntry, content: &[u8]) -> Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if entry.symlink {
        if tokio::fs::symlink_metadata(destination).await.is_ok() {
            tokio::fs::remove_file(destination).await?;
        }
        let link_target = os_from_bytes(content.to_vec())?;
        create_symlink(&link_target, destination).await?;
        return Ok(());
    }

    tokio::fs::write(destination, content).await?;
    if let Some(mode) = entry.mode {
        set_mode(destination, mode).await?;
    }
    Ok(())
}

#[cfg(unix)]
async fn create_symlink(link_target: &OsStr, destination: &Path) -> Result<()> {
    tokio::fs::symlink(link_target, destination).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_symlink(link_target: &OsStr, destination: &Path) -> Result<()> {
    tokio::fs::write(destination, link_target.to_string_lossy().as_bytes()).await?;
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_readonly(mode & 0o222 == 0);
    tokio::fs::set_permissions(path, permissions).await?;
    Ok(())
}
