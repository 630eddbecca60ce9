use crate::manifest::VersionId;
use crate::{Error, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

const PACK_MAGIC: &[u8; 4] = b"RVPK";

/// Ceiling of a bounded container: 4 GiB - 1.
pub const CONTAINER_LIMIT: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackHeader {
    pub version: VersionId,
    pub entry_count: u32,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedEntry {
    pub offset: u64,
    pub length: u64,
    pub uncompressed_length: u64,
}

/// All payloads of one version framed into a single object.
///
/// Payloads are zlib-compressed and appended to a data section; a bincode
/// index maps each entry path to its slice. Layout on storage:
/// `RVPK | index length (u32 LE) | index | data`.
#[derive(Debug, Clone)]
pub struct PackFile {
    pub header: PackHeader,
    pub entries: BTreeMap<String, PackedEntry>,
    pub data: Vec<u8>,
    limit: Option<u64>,
}

impl PackFile {
    pub fn new(version: VersionId, limit: Option<u64>) -> Self {
        Self {
            header: PackHeader {
                version,
                entry_count: 0,
                uncompressed_size: 0,
                compressed_size: 0,
                created_at: chrono::Utc::now(),
            },
            entries: BTreeMap::new(),
            data: Vec::new(),
            limit,
        }
    }

    pub fn add(&mut self, path: &str, payload: &[u8]) -> Result<()> {
        if self.entries.contains_key(path) {
            return Err(Error::Other(format!("Pack already holds {}", path)));
        }

        let compressed = compress(payload)?;
        let size = self.data.len() as u64 + compressed.len() as u64;
        if let Some(limit) = self.limit {
            if size > limit {
                return Err(Error::ContainerLimit { size, limit });
            }
        }

        let entry = PackedEntry {
            offset: self.data.len() as u64,
            length: compressed.len() as u64,
            uncompressed_length: payload.len() as u64,
        };
        self.data.extend_from_slice(&compressed);

        self.entries.insert(path.to_string(), entry);
        self.header.entry_count += 1;
        self.header.uncompressed_size += payload.len() as u64;
        self.header.compressed_size += compressed.len() as u64;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<Vec<u8>> {
        let entry = self.entries.get(path).ok_or_else(|| {
            Error::Corruption(format!("Pack for version {} has no entry {}", self.header.version, path))
        })?;

        let start = entry.offset as usize;
        let end = start.saturating_add(entry.length as usize);
        if end > self.data.len() {
            return Err(Error::Corruption(
                "Pack data corruption: entry extends beyond pack data".to_string(),
            ));
        }

        let payload = decompress(&self.data[start..end])?;
        if payload.len() as u64 != entry.uncompressed_length {
            return Err(Error::Corruption(format!("Pack entry {} has the wrong length", path)));
        }
        Ok(payload)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let index = bincode::DefaultOptions::new()
            .serialize(&(&self.header, &self.entries))
            .map_err(|e| Error::Other(format!("Failed to encode pack index: {}", e)))?;
        let index_len = u32::try_from(index.len())
            .map_err(|_| Error::Other("Pack index too large".to_string()))?;

        let total = (PACK_MAGIC.len() + 4 + index.len() + self.data.len()) as u64;
        if let Some(limit) = self.limit {
            if total > limit {
                return Err(Error::ContainerLimit { size: total, limit });
            }
        }

        let mut out = Vec::with_capacity(total as usize);
        out.extend_from_slice(PACK_MAGIC);
        out.extend_from_slice(&index_len.to_le_bytes());
        out.extend_from_slice(&index);
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| Error::Corruption(format!("Malformed pack: {}", what));

        let rest = bytes.strip_prefix(PACK_MAGIC).ok_or_else(|| corrupt("bad magic"))?;
        if rest.len() < 4 {
            return Err(corrupt("truncated index length"));
        }
        let (len_bytes, rest) = rest.split_at(4);
        let index_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        if rest.len() < index_len {
            return Err(corrupt("truncated index"));
        }
        let (index, data) = rest.split_at(index_len);

        let (header, entries): (PackHeader, BTreeMap<String, PackedEntry>) = bincode::DefaultOptions::new()
            .with_limit(index_len as u64)
            .deserialize(index)
            .map_err(|e| corrupt(&e.to_string()))?;

        Ok(Self {
            header,
            entries,
            data: data.to_vec(),
            limit: None,
        })
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut result = Vec::new();
    decoder
        .read_to_end(&mut result)
        .map_err(|e| Error::Corruption(format!("Pack entry failed to decompress: {}", e)))?;
    Ok(result)
}
