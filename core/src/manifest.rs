use crate::{Error, Result, StrongHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub type VersionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    /// Unchanged since an earlier version; the payload lives there.
    NotStored,
    /// Payload written by this version, full or delta encoded.
    Stored,
    /// Present in the previous version, gone from this one.
    Deleted,
    Directory,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryStatus::NotStored => "NOT_STORED",
            EntryStatus::Stored => "STORED",
            EntryStatus::Deleted => "DELETED",
            EntryStatus::Directory => "DIRECTORY",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadEncoding {
    Full,
    /// Delta record against the content of `base`; `depth` counts the
    /// deltas stacked on the nearest full payload, this one included.
    Delta { base: VersionId, depth: u32 },
}

/// Where a payload is physically stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub version: VersionId,
    pub encoding: PayloadEncoding,
    /// Size of the stored (encoded and encrypted) payload.
    pub stored_size: u64,
}

impl PayloadRef {
    pub fn depth(&self) -> u32 {
        match self.encoding {
            PayloadEncoding::Full => 0,
            PayloadEncoding::Delta { depth, .. } => depth,
        }
    }
}

/// Backup status of one path in one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEntry {
    pub path: String,
    pub status: EntryStatus,
    pub size: u64,
    pub mtime: i64,
    /// Content is a symbolic link target rather than file bytes.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub symlink: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<StrongHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<PayloadRef>,
}

impl RecoveryEntry {
    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: EntryStatus::Deleted,
            size: 0,
            mtime: 0,
            symlink: false,
            mode: None,
            content_hash: None,
            payload: None,
        }
    }

    /// Whether the entry carries restorable file content.
    pub fn has_content(&self) -> bool {
        matches!(self.status, EntryStatus::Stored | EntryStatus::NotStored)
    }
}

/// Entries of one committed backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: VersionId,
    pub created_at: DateTime<Utc>,
    pub hostname: String,
    pub source: PathBuf,
    pub entries: BTreeMap<String, RecoveryEntry>,
}

impl Manifest {
    pub fn new(version: VersionId, source: PathBuf) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            version,
            created_at: Utc::now(),
            hostname,
            source,
            entries: BTreeMap::new(),
        }
    }

    /// Adds an entry; paths are unique within one manifest.
    pub fn insert(&mut self, entry: RecoveryEntry) -> Result<()> {
        if self.entries.contains_key(&entry.path) {
            return Err(Error::Other(format!(
                "Duplicate path {} in version {}",
                entry.path, self.version
            )));
        }
        self.entries.insert(entry.path.clone(), entry);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&RecoveryEntry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RecoveryEntry> {
        self.entries.values()
    }

    pub fn count(&self, status: EntryStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }
}

/// Append-only list of committed manifests, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ManifestHistory {
    versions: Vec<Manifest>,
}

impl ManifestHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a history from manifests loaded in any order.
    pub fn from_manifests(mut manifests: Vec<Manifest>) -> Result<Self> {
        manifests.sort_by_key(|m| m.version);
        let mut history = Self::new();
        for manifest in manifests {
            history.append(manifest)?;
        }
        Ok(history)
    }

    pub fn next_version(&self) -> VersionId {
        self.latest().map_or(1, |m| m.version + 1)
    }

    pub fn append(&mut self, manifest: Manifest) -> Result<()> {
        if let Some(latest) = self.latest() {
            if manifest.version <= latest.version {
                return Err(Error::Other(format!(
                    "Version {} does not follow version {}",
                    manifest.version, latest.version
                )));
            }
        }
        self.versions.push(manifest);
        Ok(())
    }

    pub fn latest(&self) -> Option<&Manifest> {
        self.versions.last()
    }

    pub fn get(&self, version: VersionId) -> Option<&Manifest> {
        self.versions
            .binary_search_by_key(&version, |m| m.version)
            .ok()
            .map(|i| &self.versions[i])
    }

    pub fn versions(&self) -> impl DoubleEndedIterator<Item = &Manifest> {
        self.versions.iter()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    fn up_to(&self, version: VersionId) -> impl Iterator<Item = &Manifest> {
        self.versions.iter().rev().skip_while(move |m| m.version > version)
    }

    /// Most recent STORED or NOT_STORED record of `path`, any version.
    pub fn last_content_record(&self, path: &str) -> Option<&RecoveryEntry> {
        self.versions
            .iter()
            .rev()
            .filter_map(|m| m.get(path))
            .find(|e| e.has_content())
    }

    /// Nearest version at or before `version` where `path` was STORED.
    pub fn find_stored(&self, path: &str, version: VersionId) -> Option<(VersionId, &RecoveryEntry)> {
        self.up_to(version).find_map(|m| {
            m.get(path)
                .filter(|e| e.status == EntryStatus::Stored)
                .map(|e| (m.version, e))
        })
    }

    /// Paths that the latest version still considers present.
    pub fn live_paths(&self) -> Vec<&str> {
        self.latest()
            .map(|m| {
                m.entries()
                    .filter(|e| e.status != EntryStatus::Deleted)
                    .map(|e| e.path.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}
