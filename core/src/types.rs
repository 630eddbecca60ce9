use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Block size used when a medium does not configure one.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Collision-resistant digest used to confirm weak checksum candidates and
/// to verify reconstructed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrongHash(blake3::Hash);

impl StrongHash {
    pub fn new(hash: blake3::Hash) -> Self {
        Self(hash)
    }

    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<blake3::Hash> for StrongHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash)
    }
}

impl FromStr for StrongHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(blake3::Hash::from(array)))
    }
}

impl Serialize for StrongHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for StrongHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        StrongHash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for StrongHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Kind of a node met while walking the source tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

/// A source tree entry as seen by the filter chain.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Manifest key of the entry, see [`crate::entry_path`].
    pub path: String,
    /// Real path relative to the source root, used for filesystem access.
    pub relative: PathBuf,
    pub kind: NodeKind,
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime: i64,
    pub mode: u32,
    pub locked: bool,
}

impl TreeEntry {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory)
    }

    pub fn is_link(&self) -> bool {
        matches!(self.kind, NodeKind::Symlink)
    }

    /// Lowercased extension of the last path component, if any.
    pub fn extension(&self) -> Option<String> {
        let name = self.path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}
