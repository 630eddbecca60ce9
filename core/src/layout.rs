//! Physical framing of one version's payload set.
//!
//! Every layout stores the same sealed payload bytes; they only differ in
//! how a version's payloads become storage objects.

use crate::backend::Backend;
use crate::manifest::VersionId;
use crate::pack::{CONTAINER_LIMIT, PackFile};
use crate::{Error, Result};
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DATA_PREFIX: &str = "data/";
pub const MANIFEST_PREFIX: &str = "manifests/";
pub const DESCRIPTOR_KEY: &str = "medium.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediumLayout {
    /// One storage object per payload.
    #[default]
    Directory,
    /// One pack object per version, capped at 4 GiB - 1.
    Container,
    /// One pack object per version without a size ceiling.
    Container64,
    /// One gzip-compressed tar object per version.
    TarGz,
}

impl fmt::Display for MediumLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediumLayout::Directory => "directory",
            MediumLayout::Container => "container",
            MediumLayout::Container64 => "container64",
            MediumLayout::TarGz => "tar.gz",
        };
        f.write_str(name)
    }
}

impl MediumLayout {
    pub fn size_limit(&self) -> Option<u64> {
        match self {
            MediumLayout::Container => Some(CONTAINER_LIMIT),
            _ => None,
        }
    }

    fn object_key(&self, version: VersionId) -> String {
        match self {
            MediumLayout::Directory => version_dir(version),
            MediumLayout::Container | MediumLayout::Container64 => {
                format!("{}{:08}.pack", DATA_PREFIX, version)
            }
            MediumLayout::TarGz => format!("{}{:08}.tar.gz", DATA_PREFIX, version),
        }
    }
}

fn version_dir(version: VersionId) -> String {
    format!("{}{:08}", DATA_PREFIX, version)
}

pub fn manifest_key(version: VersionId) -> String {
    format!("{}{:08}.json", MANIFEST_PREFIX, version)
}

/// Version number encoded in a data or manifest object key.
pub fn version_of_key(key: &str) -> Option<VersionId> {
    let rest = key
        .strip_prefix(DATA_PREFIX)
        .or_else(|| key.strip_prefix(MANIFEST_PREFIX))?;
    let end = rest.find(['/', '.']).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

enum Staging {
    Loose,
    Pack(PackFile),
    Tar(tar::Builder<GzEncoder<Vec<u8>>>),
}

/// Collects the payloads of one in-progress version.
///
/// Every object written is remembered so that a failed version can be
/// rolled back with [`VersionWriter::abort`].
pub struct VersionWriter {
    layout: MediumLayout,
    version: VersionId,
    backend: Arc<dyn Backend>,
    staging: Staging,
    written: Vec<String>,
    entries: usize,
    bytes_written: u64,
}

impl VersionWriter {
    pub fn new(layout: MediumLayout, version: VersionId, backend: Arc<dyn Backend>) -> Self {
        let staging = match layout {
            MediumLayout::Directory => Staging::Loose,
            MediumLayout::Container | MediumLayout::Container64 => {
                Staging::Pack(PackFile::new(version, layout.size_limit()))
            }
            MediumLayout::TarGz => {
                let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
                builder.mode(tar::HeaderMode::Deterministic);
                Staging::Tar(builder)
            }
        };

        Self {
            layout,
            version,
            backend,
            staging,
            written: Vec::new(),
            entries: 0,
            bytes_written: 0,
        }
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    /// Payload bytes handed to this writer so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn put(&mut self, path: &str, payload: Vec<u8>) -> Result<()> {
        let size = payload.len() as u64;
        match &mut self.staging {
            Staging::Loose => {
                let key = format!("{}/{}", version_dir(self.version), path);
                self.written.push(key.clone());
                self.backend.write(&key, Bytes::from(payload)).await?;
            }
            Staging::Pack(pack) => pack.add(path, &payload)?,
            Staging::Tar(builder) => {
                let mut header = tar::Header::new_gnu();
                header.set_size(size);
                header.set_mode(0o600);
                header.set_entry_type(tar::EntryType::Regular);
                builder.append_data(&mut header, path, payload.as_slice())?;
            }
        }
        self.entries += 1;
        self.bytes_written += size;
        Ok(())
    }

    /// Flushes staged payloads; returns the keys of every object written.
    pub async fn finish(mut self) -> Result<Vec<String>> {
        let staging = std::mem::replace(&mut self.staging, Staging::Loose);
        let object = match staging {
            Staging::Loose => None,
            _ if self.entries == 0 => None,
            Staging::Pack(pack) => Some(pack.to_bytes()?),
            Staging::Tar(builder) => {
                let encoder = builder.into_inner()?;
                Some(encoder.finish()?)
            }
        };

        if let Some(object) = object {
            let key = self.layout.object_key(self.version);
            debug!(key = %key, size = object.len(), "Writing version container");
            self.written.push(key.clone());
            if let Err(e) = self.backend.write(&key, Bytes::from(object)).await {
                self.rollback().await;
                return Err(e);
            }
        }
        Ok(std::mem::take(&mut self.written))
    }

    /// Deletes every object this writer put on storage.
    pub async fn abort(mut self) {
        self.rollback().await;
    }

    async fn rollback(&mut self) {
        for key in self.written.drain(..) {
            if let Err(e) = self.backend.delete(&key).await {
                warn!(key = %key, error = %e, "Failed to remove partial payload");
            }
        }
    }
}

/// Deletes objects previously returned by [`VersionWriter::finish`].
pub async fn remove_objects(backend: &dyn Backend, keys: &[String]) {
    for key in keys {
        if let Err(e) = backend.delete(key).await {
            warn!(key = %key, error = %e, "Failed to remove payload object");
        }
    }
}

enum LoadedVersion {
    Pack(PackFile),
    Tar(HashMap<String, Vec<u8>>),
}

/// Containers kept decoded at once. A chain under the default delta limit
/// spans a full payload and one delta, so two containers cover it.
const CACHED_CONTAINERS: usize = 2;

/// Reads sealed payloads back, keeping the most recently used containers
/// decoded.
pub struct PayloadStore {
    layout: MediumLayout,
    backend: Arc<dyn Backend>,
    loaded: VecDeque<(VersionId, LoadedVersion)>,
}

impl PayloadStore {
    pub fn new(layout: MediumLayout, backend: Arc<dyn Backend>) -> Self {
        Self {
            layout,
            backend,
            loaded: VecDeque::new(),
        }
    }

    pub async fn get(&mut self, version: VersionId, path: &str) -> Result<Vec<u8>> {
        if self.layout == MediumLayout::Directory {
            let key = format!("{}/{}", version_dir(version), path);
            return Ok(self.backend.read(&key).await?.to_vec());
        }

        let container = self.container(version).await?;
        match container {
            LoadedVersion::Pack(pack) => pack.get(path),
            LoadedVersion::Tar(entries) => entries.get(path).cloned().ok_or_else(|| {
                Error::Corruption(format!("Archive for version {} has no entry {}", version, path))
            }),
        }
    }

    /// Decoded container of `version`, moved to the most recently used slot.
    async fn container(&mut self, version: VersionId) -> Result<&LoadedVersion> {
        match self.loaded.iter().position(|(v, _)| *v == version) {
            Some(index) => {
                if let Some(hit) = self.loaded.remove(index) {
                    self.loaded.push_back(hit);
                }
            }
            None => {
                let key = self.layout.object_key(version);
                let object = self.backend.read(&key).await?;
                let loaded = match self.layout {
                    MediumLayout::TarGz => LoadedVersion::Tar(unpack_tar(&object)?),
                    _ => LoadedVersion::Pack(PackFile::from_bytes(&object)?),
                };
                if self.loaded.len() >= CACHED_CONTAINERS {
                    if let Some((evicted, _)) = self.loaded.pop_front() {
                        debug!(version = evicted, "Evicting cached container");
                    }
                }
                self.loaded.push_back((version, loaded));
            }
        }
        self.loaded
            .back()
            .map(|(_, loaded)| loaded)
            .ok_or_else(|| Error::Other(format!("Version {} container not loaded", version)))
    }
}

fn unpack_tar(object: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
    let corrupt = |e: std::io::Error| Error::Corruption(format!("Malformed tar.gz container: {}", e));

    let mut archive = tar::Archive::new(GzDecoder::new(object));
    let mut entries = HashMap::new();
    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let path = entry.path().map_err(corrupt)?.to_string_lossy().replace('\\', "/");
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data).map_err(corrupt)?;
        entries.insert(path, data);
    }
    Ok(entries)
}
