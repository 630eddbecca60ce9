use crate::entry_path::{decode_component, encode_relative, is_plain_name};
use crate::filter::FilterChain;
use crate::{Error, NodeKind, Result, TreeEntry};
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

/// Walks `source` and returns the in-scope entries in path order.
pub(super) async fn scan_tree(
    source: &Path,
    filters: &FilterChain,
    cancel: &CancellationToken,
) -> Result<Vec<TreeEntry>> {
    let source = source.to_path_buf();
    let filters = filters.clone();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || walk(&source, &filters, &cancel))
        .await
        .map_err(|e| Error::Other(format!("Scan task failed: {}", e)))?
}

fn walk(source: &Path, filters: &FilterChain, cancel: &CancellationToken) -> Result<Vec<TreeEntry>> {
    let root = std::fs::metadata(source)
        .map_err(|e| Error::Configuration(format!("Cannot read source {}: {}", source.display(), e)))?;
    if !root.is_dir() {
        return Err(Error::Configuration(format!(
            "Source {} is not a directory",
            source.display()
        )));
    }

    let mut entries = Vec::new();
    let mut walker = WalkDir::new(source)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    while let Some(item) = walker.next() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let item = item.map_err(std::io::Error::from)?;
        let Some(entry) = tree_entry(source, &item)? else {
            continue;
        };

        if !filters.includes(&entry) {
            if entry.is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn tree_entry(source: &Path, item: &DirEntry) -> Result<Option<TreeEntry>> {
    let file_type = item.file_type();
    let kind = if file_type.is_dir() {
        NodeKind::Directory
    } else if file_type.is_symlink() {
        NodeKind::Symlink
    } else if file_type.is_file() {
        NodeKind::File
    } else {
        // Sockets, fifos and devices carry no content to back up.
        return Ok(None);
    };

    let metadata = item.metadata().map_err(std::io::Error::from)?;
    let locked = kind == NodeKind::File && std::fs::File::open(item.path()).is_err();

    let relative = item
        .path()
        .strip_prefix(source)
        .map_err(|_| Error::Other(format!("{} is outside the source tree", item.path().display())))?
        .to_path_buf();

    Ok(Some(TreeEntry {
        path: encode_relative(&relative)?,
        relative,
        kind,
        size: metadata.len(),
        mtime: mtime_nanos(&metadata),
        mode: file_mode(&metadata),
        locked,
    }))
}

/// Joins a manifest key onto `root`, refusing anything that would escape it.
pub(super) fn target_path(root: &Path, key: &str) -> Result<PathBuf> {
    let mut target = root.to_path_buf();
    for part in key.split('/') {
        let name = decode_component(part)?;
        if !is_plain_name(&name) {
            return Err(Error::Corruption(format!("Unsafe entry path: {}", key)));
        }
        target.push(name);
    }
    Ok(target)
}

fn mtime_nanos(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| DateTime::<Utc>::from(t).timestamp_nanos_opt())
        .unwrap_or(0)
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() { 0o444 } else { 0o644 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{ArchiveFilter, Criterion};

    #[tokio::test]
    async fn test_scan_prunes_rejected_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("keep/sub")).unwrap();
        std::fs::create_dir_all(dir.path().join("cache/deep")).unwrap();
        std::fs::write(dir.path().join("keep/sub/a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("keep/b.tmp"), b"b").unwrap();
        std::fs::write(dir.path().join("cache/deep/c.txt"), b"c").unwrap();

        let filters = FilterChain::new()
            .with(ArchiveFilter::new(Criterion::Directory("cache".to_string()), true))
            .with(ArchiveFilter::new(Criterion::Extension(["tmp".to_string()].into()), true));
        let entries = scan_tree(dir.path(), &filters, &CancellationToken::new()).await.unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["keep", "keep/sub", "keep/sub/a.txt"]);
        assert_eq!(entries[2].size, 1);
        assert!(entries[2].mtime > 0);
    }

    #[tokio::test]
    async fn test_scan_rejects_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_tree(&dir.path().join("nope"), &FilterChain::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_scan_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"a").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = scan_tree(dir.path(), &FilterChain::new(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_target_path_refuses_escape() {
        let root = Path::new("/restore");
        assert_eq!(target_path(root, "a/b.txt").unwrap(), root.join("a").join("b.txt"));
        assert!(target_path(root, "../etc/passwd").is_err());
        assert!(target_path(root, "a//b").is_err());
        assert!(target_path(root, "a/%2E%2E/b").is_err());
        assert!(target_path(root, "a%2Fb").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_keeps_raw_file_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let raw = OsStr::from_bytes(b"caf\xe9.txt");
        std::fs::write(dir.path().join(raw), b"x").unwrap();

        let entries = scan_tree(dir.path(), &FilterChain::new(), &CancellationToken::new()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "caf%E9.txt");
        assert_eq!(entries[0].relative, PathBuf::from(raw));
        assert_eq!(target_path(Path::new("/r"), &entries[0].path).unwrap(), Path::new("/r").join(raw));
    }
}
