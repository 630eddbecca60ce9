use super::restore::resolve_payload;
use super::scan::scan_tree;
use super::{IncrementalMedium, Progress, RunControl, Session};
use crate::delta::{DeltaStats, Sequencer, encode};
use crate::entry_path::os_bytes;
use crate::layout::{PayloadStore, VersionWriter, manifest_key, remove_objects};
use crate::manifest::{EntryStatus, Manifest, PayloadEncoding, PayloadRef, RecoveryEntry, VersionId};
use crate::{Error, NodeKind, Result, ResultExt, StrongHash, TreeEntry};
use bytes::Bytes;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Completed-run summary of one committed backup version.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupReport {
    pub version: VersionId,
    pub stored: usize,
    pub not_stored: usize,
    pub deleted: usize,
    pub directories: usize,
    pub full_payloads: usize,
    pub delta_payloads: usize,
    /// Content bytes of the entries stored by this version.
    pub source_bytes: u64,
    /// Sealed payload bytes written to storage.
    pub bytes_written: u64,
    pub delta: DeltaStats,
}

impl IncrementalMedium {
    /// Backs up `source` as a new version.
    ///
    /// The version is committed by writing its manifest after every payload.
    /// Any failure before that point removes what this run wrote, so the
    /// history only ever contains complete versions.
    pub async fn backup(&self, source: &Path, control: &RunControl) -> Result<BackupReport> {
        let _run = self.run_lock.try_lock().map_err(|_| Error::MediumBusy)?;
        let session = self.session().await?;
        let version = session.history.next_version();
        control.check()?;

        let tree = scan_tree(source, &self.filters, &control.cancel).await?;
        control.report(Progress::Scanned { entries: tree.len() });
        info!(version, source = %source.display(), entries = tree.len(), "Starting backup");

        let mut run = BackupRun {
            medium: self,
            session: &session,
            version,
            source: source.to_path_buf(),
            manifest: Manifest::new(version, source.to_path_buf()),
            writer: VersionWriter::new(session.descriptor.layout, version, self.backend.clone()),
            store: PayloadStore::new(session.descriptor.layout, self.backend.clone()),
            report: BackupReport {
                version,
                ..Default::default()
            },
        };

        let sealed_manifest = match run.walk(&tree, control).await {
            Ok(()) => run.seal_manifest(),
            Err(e) => Err(e),
        };
        let BackupRun {
            manifest,
            writer,
            mut report,
            ..
        } = run;

        let sealed_manifest = match sealed_manifest {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!(version, error = %e, "Backup failed, discarding version");
                writer.abort().await;
                return Err(e);
            }
        };

        let mut history = session.history.clone();
        if let Err(e) = history.append(manifest) {
            writer.abort().await;
            return Err(e);
        }

        report.bytes_written = writer.bytes_written();
        let keys = writer.finish().await?;

        let key = manifest_key(version);
        if let Err(e) = self.backend.write(&key, Bytes::from(sealed_manifest)).await {
            warn!(version, error = %e, "Manifest write failed, discarding version");
            remove_objects(self.backend.as_ref(), &keys).await;
            return Err(e);
        }

        *self.session.write().await = Some(Arc::new(Session {
            descriptor: session.descriptor.clone(),
            cipher: session.cipher.clone(),
            history,
        }));
        control.report(Progress::Committed { version });
        info!(
            version,
            stored = report.stored,
            not_stored = report.not_stored,
            deleted = report.deleted,
            bytes_written = report.bytes_written,
            "Backup committed"
        );
        Ok(report)
    }
}

struct BackupRun<'a> {
    medium: &'a IncrementalMedium,
    session: &'a Session,
    version: VersionId,
    source: PathBuf,
    manifest: Manifest,
    writer: VersionWriter,
    store: PayloadStore,
    report: BackupReport,
}

impl BackupRun<'_> {
    async fn walk(&mut self, tree: &[TreeEntry], control: &RunControl) -> Result<()> {
        let total = tree.len();
        for (done, entry) in tree.iter().enumerate() {
            control.check()?;
            control.report(Progress::Processing {
                path: entry.path.clone(),
                done: done + 1,
                total,
            });

            match entry.kind {
                NodeKind::Directory if self.medium.config.track_directories => {
                    self.record(RecoveryEntry {
                        path: entry.path.clone(),
                        status: EntryStatus::Directory,
                        size: 0,
                        mtime: entry.mtime,
                        symlink: false,
                        mode: self.mode(entry),
                        content_hash: None,
                        payload: None,
                    })?;
                }
                NodeKind::Directory => {}
                NodeKind::File | NodeKind::Symlink => {
                    let record = self.process_file(entry, control).await.at(&entry.path, self.version)?;
                    self.record(record)?;
                }
            }
        }

        let deleted: Vec<String> = self
            .session
            .history
            .live_paths()
            .into_iter()
            .filter(|path| self.manifest.get(path).is_none())
            .map(str::to_string)
            .collect();
        for path in deleted {
            debug!(path = %path, "Entry deleted since previous version");
            self.record(RecoveryEntry::deleted(path))?;
        }
        Ok(())
    }

    fn record(&mut self, entry: RecoveryEntry) -> Result<()> {
        match entry.status {
            EntryStatus::Stored => self.report.stored += 1,
            EntryStatus::NotStored => self.report.not_stored += 1,
            EntryStatus::Deleted => self.report.deleted += 1,
            EntryStatus::Directory => self.report.directories += 1,
        }
        self.manifest.insert(entry)
    }

    fn mode(&self, entry: &TreeEntry) -> Option<u32> {
        self.medium.config.track_permissions.then_some(entry.mode)
    }

    async fn process_file(&mut self, entry: &TreeEntry, control: &RunControl) -> Result<RecoveryEntry> {
        let symlink = entry.is_link();
        let previous = self
            .session
            .history
            .last_content_record(&entry.path)
            .filter(|e| e.symlink == symlink);

        if let Some(previous) = previous {
            if !self.medium.config.verify_content && previous.size == entry.size && previous.mtime == entry.mtime {
                return Ok(self.unchanged(entry, previous));
            }
        }

        let content = read_content(&self.source.join(&entry.relative), symlink).await?;
        let content_hash = StrongHash::from_data(&content);
        if let Some(previous) = previous {
            if previous.content_hash == Some(content_hash) {
                return Ok(self.unchanged(entry, previous));
            }
        }

        let source_size = content.len() as u64;
        let (payload, encoding) = self.encode_payload(&entry.path, content, control).await?;
        let sealed = self.session.cipher.seal(&payload)?;
        let stored_size = sealed.len() as u64;
        self.writer.put(&entry.path, sealed).await?;

        match encoding {
            PayloadEncoding::Full => self.report.full_payloads += 1,
            PayloadEncoding::Delta { .. } => self.report.delta_payloads += 1,
        }
        self.report.source_bytes += source_size;

        Ok(RecoveryEntry {
            path: entry.path.clone(),
            status: EntryStatus::Stored,
            size: entry.size,
            mtime: entry.mtime,
            symlink,
            mode: self.mode(entry),
            content_hash: Some(content_hash),
            payload: Some(PayloadRef {
                version: self.version,
                encoding,
                stored_size,
            }),
        })
    }

    fn unchanged(&self, entry: &TreeEntry, previous: &RecoveryEntry) -> RecoveryEntry {
        RecoveryEntry {
            path: entry.path.clone(),
            status: EntryStatus::NotStored,
            size: entry.size,
            mtime: entry.mtime,
            symlink: previous.symlink,
            mode: self.mode(entry),
            content_hash: previous.content_hash,
            payload: previous.payload.clone(),
        }
    }

    /// Payload the next delta may be computed against: the most recent
    /// content of `path`, stepped down its chain until one more delta
    /// stays within the chain limit.
    fn delta_base(&self, path: &str) -> Option<PayloadRef> {
        let history = &self.session.history;
        let limit = self.medium.config.delta_chain_limit;
        let mut candidate = history.last_content_record(path)?.payload.clone()?;
        loop {
            match candidate.encoding {
                _ if candidate.depth() < limit => return Some(candidate),
                PayloadEncoding::Full => return Some(candidate),
                PayloadEncoding::Delta { base, .. } if base < candidate.version => {
                    candidate = history.get(base)?.get(path)?.payload.clone()?;
                }
                PayloadEncoding::Delta { .. } => return None,
            }
        }
    }

    async fn encode_payload(
        &mut self,
        path: &str,
        content: Vec<u8>,
        control: &RunControl,
    ) -> Result<(Vec<u8>, PayloadEncoding)> {
        let Some(base_ref) = self.delta_base(path) else {
            return Ok((content, PayloadEncoding::Full));
        };

        let base = match resolve_payload(
            &mut self.store,
            &self.session.cipher,
            &self.session.history,
            path,
            &base_ref,
        )
        .await
        {
            Ok(base) => base,
            Err(e) => {
                warn!(path, base = base_ref.version, error = %e, "Delta base unreadable, storing full content");
                return Ok((content, PayloadEncoding::Full));
            }
        };

        let block_size = self.medium.config.block_size;
        let literal_limit = self.medium.config.literal_limit;
        let cancel = control.cancel.clone();
        let label = path.to_string();
        let (record, stats, content) = tokio::task::spawn_blocking(move || {
            let index = Sequencer::new(block_size)?.sequence_bytes(&base)?;
            let (record, stats) = encode(&index, content.as_slice(), &label, literal_limit, Some(cancel))?;
            Ok::<_, Error>((record, stats, content))
        })
        .await
        .map_err(|e| Error::Other(format!("Delta task failed: {}", e)))??;

        let encoded = record.to_bytes()?;
        if encoded.len() >= content.len() {
            debug!(path, delta = encoded.len(), full = content.len(), "Delta not smaller, storing full content");
            return Ok((content, PayloadEncoding::Full));
        }

        self.report.delta.merge(&stats);
        Ok((
            encoded,
            PayloadEncoding::Delta {
                base: base_ref.version,
                depth: base_ref.depth() + 1,
            },
        ))
    }

    fn seal_manifest(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(&self.manifest)?;
        self.session.cipher.seal(&json)
    }
}

async fn read_content(path: &Path, symlink: bool) -> Result<Vec<u8>> {
    if symlink {
        let target = tokio::fs::read_link(path).await?;
        return Ok(os_bytes(target.as_os_str()).into_owned());
    }
    Ok(tokio::fs::read(path).await?)
}
