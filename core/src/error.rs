use crate::manifest::VersionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Corrupted data: {0}")]
    Corruption(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Medium busy: another backup or restore is running")]
    MediumBusy,

    #[error("Medium not installed")]
    NotInstalled,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Version not found: {version}")]
    VersionNotFound { version: VersionId },

    #[error("Entry not found: {path} in version {version}")]
    EntryNotFound { path: String, version: VersionId },

    #[error("Container size {size} exceeds the {limit} byte limit")]
    ContainerLimit { size: u64, limit: u64 },

    #[error("{path} (version {version}): {source}")]
    Context {
        path: String,
        version: VersionId,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers deciding whether to retry or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Io,
    Corruption,
    Encryption,
    Busy,
    Cancelled,
    NotFound,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::NotInstalled => ErrorKind::Configuration,
            Error::Io(_) | Error::Backend(_) | Error::ContainerLimit { .. } | Error::Other(_) => {
                ErrorKind::Io
            }
            Error::Serialization(_) | Error::Corruption(_) => ErrorKind::Corruption,
            Error::Encryption(_) => ErrorKind::Encryption,
            Error::MediumBusy => ErrorKind::Busy,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::VersionNotFound { .. } | Error::EntryNotFound { .. } => ErrorKind::NotFound,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// Attaches the path and version that produced this error.
    pub fn at(self, path: impl Into<String>, version: VersionId) -> Self {
        match self {
            already @ Error::Context { .. } => already,
            other => Error::Context {
                path: path.into(),
                version,
                source: Box::new(other),
            },
        }
    }
}

pub trait ResultExt<T> {
    fn at(self, path: &str, version: VersionId) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn at(self, path: &str, version: VersionId) -> Result<T> {
        self.map_err(|e| e.at(path, version))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Corruption(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_kind() {
        let err = Error::Corruption("bad record".to_string()).at("docs/a.txt", 3);
        assert_eq!(err.kind(), ErrorKind::Corruption);
        assert_eq!(err.to_string(), "docs/a.txt (version 3): Corrupted data: bad record");
    }

    #[test]
    fn test_context_is_not_nested() {
        let err = Error::Cancelled.at("a", 1).at("b", 2);
        match err {
            Error::Context { path, version, .. } => {
                assert_eq!(path, "a");
                assert_eq!(version, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
