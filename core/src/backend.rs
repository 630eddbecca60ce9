use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Local,
    Remote,
    Memory,
}

/// Physical placement of medium objects, addressed by `/`-separated keys.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn read(&self, path: &str) -> Result<Bytes>;

    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// All object keys under `prefix`, recursively.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn backend_type(&self) -> BackendType;
}

/// Backend holding objects in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Bytes>>> {
        self.objects
            .lock()
            .map_err(|_| Error::Backend("Memory backend lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of all stored object sizes.
    pub fn total_bytes(&self) -> u64 {
        self.objects
            .lock()
            .map(|o| o.values().map(|data| data.len() as u64).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects()?.contains_key(path))
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        self.objects()?
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("Object not found: {}", path)))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        self.objects()?.insert(path.to_string(), data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects()?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects()?
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_basics() {
        let backend = MemoryBackend::new();
        backend.init().await.unwrap();
        backend.write("data/1/a", Bytes::from_static(b"abc")).await.unwrap();
        backend.write("data/2/b", Bytes::from_static(b"de")).await.unwrap();
        backend.write("manifests/1.json", Bytes::from_static(b"{}")).await.unwrap();

        assert!(backend.exists("data/1/a").await.unwrap());
        assert_eq!(backend.read("data/1/a").await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(backend.list("data/").await.unwrap(), vec!["data/1/a", "data/2/b"]);
        assert_eq!(backend.total_bytes(), 7);

        backend.delete("data/1/a").await.unwrap();
        assert!(!backend.exists("data/1/a").await.unwrap());
        assert!(backend.read("data/1/a").await.is_err());
        assert_eq!(backend.len(), 2);
    }
}
