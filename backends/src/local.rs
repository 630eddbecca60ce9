use async_trait::async_trait;
use bytes::Bytes;
use revsnap_core::{Backend, BackendType, Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

/// Suffix of objects still being written; never listed.
const PARTIAL_SUFFIX: &str = ".partial";

/// Backend rooted at a base directory of the local filesystem.
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let mut full = self.base_path.clone();
        full.extend(path.split('/').filter(|part| !part.is_empty()));
        full
    }

    /// Removes directories emptied by a delete, stopping at the base path.
    async fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.base_path || !dir.starts_with(&self.base_path) {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| Error::Backend(format!("Failed to create {}: {}", self.base_path.display(), e)))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(path))
            .await
            .map_err(|e| Error::Backend(format!("Failed to read {}: {}", path, e)))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let full_path = self.full_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Readers only ever see complete objects.
        let mut partial = full_path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        fs::write(&partial, &data)
            .await
            .map_err(|e| Error::Backend(format!("Failed to write {}: {}", path, e)))?;
        fs::rename(&partial, &full_path)
            .await
            .map_err(|e| Error::Backend(format!("Failed to write {}: {}", path, e)))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = match fs::symlink_metadata(&full_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Backend(format!("Failed to delete {}: {}", path, e))),
        };

        if metadata.is_dir() {
            fs::remove_dir_all(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        }
        .map_err(|e| Error::Backend(format!("Failed to delete {}: {}", path, e)))?;

        self.prune_empty_parents(&full_path).await;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = match prefix.rfind('/') {
            Some(end) => self.full_path(&prefix[..end]),
            None => self.base_path.clone(),
        };
        let base = self.base_path.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut keys = Vec::new();
            if !dir.is_dir() {
                return Ok(keys);
            }
            for entry in WalkDir::new(&dir).follow_links(false) {
                let entry = entry.map_err(|e| Error::Backend(format!("Failed to list {}: {}", prefix, e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&base) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) && !key.ends_with(PARTIAL_SUFFIX) {
                    keys.push(key);
                }
            }
            keys.sort();
            debug!(prefix = %prefix, objects = keys.len(), "Listed local objects");
            Ok(keys)
        })
        .await
        .map_err(|e| Error::Backend(format!("List task failed: {}", e)))?
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_backend_objects() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("medium"));
        backend.init().await.unwrap();

        backend.write("data/00000001/docs/a.txt", Bytes::from_static(b"alpha")).await.unwrap();
        backend.write("data/00000002.pack", Bytes::from_static(b"pack")).await.unwrap();
        backend.write("manifests/00000001.json", Bytes::from_static(b"{}")).await.unwrap();

        assert!(backend.exists("data/00000002.pack").await.unwrap());
        assert!(!backend.exists("data/00000003.pack").await.unwrap());
        assert_eq!(backend.read("data/00000001/docs/a.txt").await.unwrap(), Bytes::from_static(b"alpha"));
        assert_eq!(backend.read("data/00000002.pack").await.unwrap().len(), 4);
        assert_eq!(
            backend.list("data/").await.unwrap(),
            vec!["data/00000001/docs/a.txt", "data/00000002.pack"]
        );
        assert_eq!(backend.list("").await.unwrap().len(), 3);
        assert_eq!(backend.list("data/00000001").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_prunes_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.init().await.unwrap();
        backend.write("data/00000001/docs/a.txt", Bytes::from_static(b"alpha")).await.unwrap();

        backend.delete("data/00000001/docs/a.txt").await.unwrap();
        backend.delete("data/00000001/docs/a.txt").await.unwrap();
        assert!(!dir.path().join("data").exists());
        assert!(dir.path().exists());
        assert!(backend.read("data/00000001/docs/a.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_partial_objects_are_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.init().await.unwrap();
        std::fs::create_dir_all(dir.path().join("manifests")).unwrap();
        std::fs::write(dir.path().join("manifests/00000001.json.partial"), b"{").unwrap();

        assert!(backend.list("manifests/").await.unwrap().is_empty());
    }
}
