pub mod backend;
pub mod config;
pub mod crypto;
pub mod delta;
pub mod descriptor;
pub mod entry_path;
pub mod error;
pub mod filter;
pub mod layout;
pub mod manifest;
pub mod medium;
pub mod pack;
pub mod types;

pub use backend::{Backend, BackendType, MemoryBackend};
pub use config::MediumConfig;
pub use crypto::{EncryptionAlgorithm, EncryptionPolicy, KdfParams};
pub use descriptor::MediumDescriptor;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use filter::{ArchiveFilter, Criterion, CriterionSpec, FilterChain, FilterSpec};
pub use layout::MediumLayout;
pub use manifest::{EntryStatus, Manifest, ManifestHistory, PayloadEncoding, PayloadRef, RecoveryEntry, VersionId};
pub use medium::{
    BackupReport, IncrementalMedium, Progress, RestoreFailure, RestoreReport, RunControl, VersionInfo,
};
pub use types::*;
