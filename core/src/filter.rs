use crate::{Error, Result, TreeEntry};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Serializable description of one filter, as found in a target configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub exclude: bool,
    #[serde(flatten)]
    pub criterion: CriterionSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CriterionSpec {
    Directory { path: String },
    Extension { extensions: Vec<String> },
    Regex { pattern: String },
    /// Matches files larger than `threshold` bytes.
    FileSize { threshold: u64 },
    /// Matches files modified on or after `date` (`YYYY_MM_DD`).
    FileDate { date: String },
    Link,
    Locked,
}

#[derive(Debug, Clone)]
pub enum Criterion {
    Directory(String),
    Extension(BTreeSet<String>),
    Regex(Regex),
    FileSize(u64),
    /// Threshold in nanoseconds since the Unix epoch.
    FileDate(i64),
    Link,
    Locked,
}

/// One inclusion or exclusion predicate over tree entries.
#[derive(Debug, Clone)]
pub struct ArchiveFilter {
    criterion: Criterion,
    exclude: bool,
}

impl ArchiveFilter {
    pub fn new(criterion: Criterion, exclude: bool) -> Self {
        Self { criterion, exclude }
    }

    pub fn criterion(&self) -> &Criterion {
        &self.criterion
    }

    pub fn is_exclude(&self) -> bool {
        self.exclude
    }

    /// Raw match of the criterion, before the exclude flag is applied.
    pub fn accept(&self, entry: &TreeEntry) -> bool {
        match &self.criterion {
            Criterion::Directory(dir) => is_within(&entry.path, dir),
            Criterion::Extension(set) => entry.extension().is_some_and(|ext| set.contains(&ext)),
            Criterion::Regex(re) => re.is_match(&entry.path),
            Criterion::FileSize(threshold) => entry.size > *threshold,
            Criterion::FileDate(since) => entry.mtime >= *since,
            Criterion::Link => entry.is_link(),
            Criterion::Locked => entry.locked,
        }
    }

    /// Whether this filter lets `entry` into the backup.
    ///
    /// Directories are only judged by directory filters and by exclusion
    /// regexes; a rejected directory prunes its whole subtree.
    pub fn includes(&self, entry: &TreeEntry) -> bool {
        if entry.is_dir() {
            return match &self.criterion {
                Criterion::Directory(dir) if self.exclude => !is_within(&entry.path, dir),
                Criterion::Directory(dir) => {
                    is_within(&entry.path, dir) || is_within(dir, &entry.path)
                }
                Criterion::Regex(re) if self.exclude => !re.is_match(&entry.path),
                _ => true,
            };
        }
        self.exclude ^ self.accept(entry)
    }
}

pub(crate) fn is_within(path: &str, dir: &str) -> bool {
    path == dir
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl TryFrom<FilterSpec> for ArchiveFilter {
    type Error = Error;

    fn try_from(spec: FilterSpec) -> Result<Self> {
        let criterion = match spec.criterion {
            CriterionSpec::Directory { path } => {
                let dir = path.trim_matches('/').replace('\\', "/");
                if dir.is_empty() {
                    return Err(Error::Configuration("Directory filter needs a non-empty path".to_string()));
                }
                Criterion::Directory(dir)
            }
            CriterionSpec::Extension { extensions } => {
                let set: BTreeSet<String> = extensions
                    .iter()
                    .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|e| !e.is_empty())
                    .collect();
                if set.is_empty() {
                    return Err(Error::Configuration("Extension filter needs at least one extension".to_string()));
                }
                Criterion::Extension(set)
            }
            CriterionSpec::Regex { pattern } => Criterion::Regex(
                Regex::new(&pattern)
                    .map_err(|e| Error::Configuration(format!("Invalid filter regex {:?}: {}", pattern, e)))?,
            ),
            CriterionSpec::FileSize { threshold } => Criterion::FileSize(threshold),
            CriterionSpec::FileDate { date } => {
                let day = NaiveDate::parse_from_str(date.trim(), "%Y_%m_%d").map_err(|e| {
                    Error::Configuration(format!("Invalid filter date {:?} (expected YYYY_MM_DD): {}", date, e))
                })?;
                let nanos = day
                    .and_hms_opt(0, 0, 0)
                    .and_then(|dt| dt.and_utc().timestamp_nanos_opt())
                    .ok_or_else(|| Error::Configuration(format!("Filter date out of range: {}", date)))?;
                Criterion::FileDate(nanos)
            }
            CriterionSpec::Link => Criterion::Link,
            CriterionSpec::Locked => Criterion::Locked,
        };
        Ok(ArchiveFilter::new(criterion, spec.exclude))
    }
}

/// Ordered filters; an entry is in scope only if every filter includes it.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    filters: Vec<ArchiveFilter>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: impl IntoIterator<Item = FilterSpec>) -> Result<Self> {
        let filters = specs
            .into_iter()
            .map(ArchiveFilter::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { filters })
    }

    pub fn add(&mut self, filter: ArchiveFilter) {
        self.filters.push(filter);
    }

    pub fn with(mut self, filter: ArchiveFilter) -> Self {
        self.add(filter);
        self
    }

    pub fn includes(&self, entry: &TreeEntry) -> bool {
        self.filters.iter().all(|f| f.includes(entry))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArchiveFilter> {
        self.filters.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeKind;

    fn file(path: &str, size: u64) -> TreeEntry {
        TreeEntry {
            path: path.to_string(),
            relative: path.into(),
            kind: NodeKind::File,
            size,
            mtime: 0,
            mode: 0o644,
            locked: false,
        }
    }

    fn dir(path: &str) -> TreeEntry {
        TreeEntry {
            kind: NodeKind::Directory,
            ..file(path, 0)
        }
    }

    fn spec(exclude: bool, criterion: CriterionSpec) -> FilterSpec {
        FilterSpec { exclude, criterion }
    }

    #[test]
    fn test_exclude_extension() {
        let chain = FilterChain::from_specs([spec(
            true,
            CriterionSpec::Extension {
                extensions: vec!["tmp".to_string(), ".BAK".to_string()],
            },
        )])
        .unwrap();

        assert!(!chain.includes(&file("build/out.tmp", 10)));
        assert!(!chain.includes(&file("notes.bak", 10)));
        assert!(chain.includes(&file("notes.txt", 10)));
        assert!(chain.includes(&dir("cache.tmp")));
    }

    #[test]
    fn test_include_extension_keeps_directories() {
        let chain = FilterChain::from_specs([spec(
            false,
            CriterionSpec::Extension {
                extensions: vec!["rs".to_string()],
            },
        )])
        .unwrap();

        assert!(chain.includes(&dir("src")));
        assert!(chain.includes(&file("src/lib.rs", 1)));
        assert!(!chain.includes(&file("README.md", 1)));
    }

    #[test]
    fn test_directory_filters() {
        let include = ArchiveFilter::try_from(spec(false, CriterionSpec::Directory { path: "/a/b/".to_string() })).unwrap();
        assert!(include.includes(&dir("a")));
        assert!(include.includes(&dir("a/b")));
        assert!(include.includes(&file("a/b/c.txt", 1)));
        assert!(!include.includes(&file("a/c.txt", 1)));
        assert!(!include.includes(&dir("a/bb")));

        let exclude = ArchiveFilter::try_from(spec(true, CriterionSpec::Directory { path: "cache".to_string() })).unwrap();
        assert!(!exclude.includes(&dir("cache")));
        assert!(exclude.includes(&dir("cached")));
        assert!(!exclude.includes(&file("cache/x", 1)));
    }

    #[test]
    fn test_size_and_date() {
        let big = ArchiveFilter::try_from(spec(true, CriterionSpec::FileSize { threshold: 1024 })).unwrap();
        assert!(big.includes(&file("small", 1024)));
        assert!(!big.includes(&file("large", 1025)));

        let recent = ArchiveFilter::try_from(spec(false, CriterionSpec::FileDate { date: "2006_07_17".to_string() })).unwrap();
        let mut entry = file("old", 1);
        assert!(!recent.includes(&entry));
        entry.mtime = 1_200_000_000 * 1_000_000_000;
        assert!(recent.includes(&entry));
    }

    #[test]
    fn test_link_and_locked() {
        let no_links = ArchiveFilter::try_from(spec(true, CriterionSpec::Link)).unwrap();
        let mut link = file("shortcut", 0);
        link.kind = NodeKind::Symlink;
        assert!(!no_links.includes(&link));
        assert!(no_links.includes(&file("plain", 0)));

        let no_locked = ArchiveFilter::try_from(spec(true, CriterionSpec::Locked)).unwrap();
        let mut locked = file("busy.db", 0);
        locked.locked = true;
        assert!(!no_locked.includes(&locked));
    }

    #[test]
    fn test_exclude_regex_prunes_directories() {
        let filter = ArchiveFilter::try_from(spec(true, CriterionSpec::Regex { pattern: r"(^|/)target$".to_string() })).unwrap();
        assert!(!filter.includes(&dir("crate/target")));
        assert!(filter.includes(&dir("crate/src")));
    }

    #[test]
    fn test_chain_is_conjunction() {
        let chain = FilterChain::new()
            .with(ArchiveFilter::new(Criterion::FileSize(100), true))
            .with(ArchiveFilter::new(Criterion::Extension(["log".to_string()].into()), true));
        assert!(chain.includes(&file("a.txt", 10)));
        assert!(!chain.includes(&file("a.txt", 1000)));
        assert!(!chain.includes(&file("a.log", 10)));
    }

    #[test]
    fn test_invalid_parameters_are_configuration_errors() {
        let bad = [
            spec(false, CriterionSpec::Regex { pattern: "(".to_string() }),
            spec(false, CriterionSpec::FileDate { date: "17/07/2006".to_string() }),
            spec(false, CriterionSpec::Extension { extensions: vec![] }),
            spec(false, CriterionSpec::Directory { path: "/".to_string() }),
        ];
        for s in bad {
            assert!(matches!(ArchiveFilter::try_from(s), Err(Error::Configuration(_))));
        }
    }

    #[test]
    fn test_spec_from_json() {
        let specs: Vec<FilterSpec> = serde_json::from_str(
            r#"[{"kind": "extension", "extensions": ["tmp"], "exclude": true}, {"kind": "link"}]"#,
        )
        .unwrap();
        assert_eq!(specs.len(), 2);
        assert!(specs[0].exclude);
        assert_eq!(specs[1].criterion, CriterionSpec::Link);
        assert!(!specs[1].exclude);
    }
}
