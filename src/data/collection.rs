//! Alias-keyed collections of lazily opened files.
//!
//! A [`Collection`] scans `directory/*/*`, derives a short lower-case alias
//! for every matching file and opens a [`FileAccessor`] for an alias only when
//! it is first requested. Build time does pattern matching only, so missing
//! or malformed files surface on the first [`Collection::get`].
//!
//! ## Alias derivation
//!
//! | Scheme                  | Match                          | Alias                          |
//! |-------------------------|--------------------------------|--------------------------------|
//! | [`AliasScheme::Captured`] | capture regex, e.g. `ER_6_keV` | capture groups joined by `_` |
//! | [`AliasScheme::FileStem`] | containment regex on the path  | file stem minus a fixed prefix |
//!
//! Regexes are applied to the full path with `/` separators. Candidates are
//! visited in sorted path order, so two builds over the same directory yield
//! the same alias map. When two paths map to one alias the
//! [`CollisionPolicy`] decides what happens.
//!
//! ## Concurrency
//!
//! Every alias owns a `OnceCell`. Concurrent `get` calls for the same alias
//! run exactly one open; the rest block until it finishes and share the
//! result. A failed open leaves the cell empty so a later call retries.

use super::accessor::{FileAccessor, FileFormat, SourceOpener};
use crate::error::{CygnoError, CygnoResult};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

/// Default capture pattern for simulation files (`ER_6_keV` → `er_6`).
pub const DEFAULT_HDF5_PATTERN: &str = r"(ER|NR)_(\d+(?:\.\d+)?)_keV";

/// Default containment pattern for noise runs.
pub const DEFAULT_ROOT_PATTERN: &str = r"01_raw/(fusion|quest)/.*\.root$";

/// Default file-stem prefix stripped from noise run aliases.
pub const DEFAULT_ROOT_PREFIX: &str = "histograms_";

/// How aliases are derived from file paths.
#[derive(Debug, Clone)]
pub enum AliasScheme {
    /// Alias is the regex capture groups joined by `_`.
    ///
    /// A pattern without groups uses the whole match.
    Captured {
        /// Capture pattern.
        pattern: Regex,
    },
    /// Alias is the file stem with `prefix` removed, for paths matching `filter`.
    FileStem {
        /// Containment pattern.
        filter: Regex,
        /// Prefix stripped from the stem, if present.
        prefix: String,
    },
}

impl AliasScheme {
    /// Capture-group scheme from a pattern string.
    pub fn captured(pattern: &str) -> CygnoResult<Self> {
        Ok(AliasScheme::Captured {
            pattern: Regex::new(pattern)?,
        })
    }

    /// File-stem scheme from a filter pattern and prefix.
    pub fn file_stem(filter: &str, prefix: impl Into<String>) -> CygnoResult<Self> {
        Ok(AliasScheme::FileStem {
            filter: Regex::new(filter)?,
            prefix: prefix.into(),
        })
    }

    /// The conventional scheme for `format`, with optional overrides.
    ///
    /// HDF5 collections use capture groups, ROOT collections use file stems.
    /// `prefix` only applies to ROOT.
    pub fn for_format(
        format: FileFormat,
        pattern: Option<&str>,
        prefix: Option<&str>,
    ) -> CygnoResult<Self> {
        match format {
            FileFormat::Hdf5 => Self::captured(pattern.unwrap_or(DEFAULT_HDF5_PATTERN)),
            FileFormat::Root => Self::file_stem(
                pattern.unwrap_or(DEFAULT_ROOT_PATTERN),
                prefix.unwrap_or(DEFAULT_ROOT_PREFIX),
            ),
        }
    }

    /// Alias for `path`, or `None` if the path does not match.
    pub fn derive(&self, path: &Path) -> Option<String> {
        let text = path.to_string_lossy().replace('\\', "/");
        match self {
            AliasScheme::Captured { pattern } => {
                let caps = pattern.captures(&text)?;
                let alias = if caps.len() > 1 {
                    caps.iter()
                        .skip(1)
                        .flatten()
                        .map(|m| m.as_str())
                        .collect::<Vec<_>>()
                        .join("_")
                } else {
                    caps.get(0)?.as_str().to_string()
                };
                (!alias.is_empty()).then(|| alias.to_lowercase())
            }
            AliasScheme::FileStem { filter, prefix } => {
                if !filter.is_match(&text) {
                    return None;
                }
                let stem = path.file_stem()?.to_string_lossy();
                let stem = stem.strip_prefix(prefix.as_str()).unwrap_or(stem.as_ref());
                (!stem.is_empty()).then(|| stem.to_lowercase())
            }
        }
    }
}

/// What to do when two files derive the same alias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// The later path in sorted order replaces the earlier one; logged as a warning.
    #[default]
    LastWins,
    /// Building fails with [`CygnoError::AliasCollision`].
    Reject,
}

struct AliasEntry {
    path: PathBuf,
    accessor: OnceCell<Arc<FileAccessor>>,
}

/// Named, lazily populated set of file accessors.
pub struct Collection {
    directory: PathBuf,
    format: FileFormat,
    opener: Arc<dyn SourceOpener>,
    entries: BTreeMap<String, AliasEntry>,
    aliases: Vec<String>,
    closed: AtomicBool,
}

impl Collection {
    /// Scan `directory` with the conventional scheme and the compiled-in
    /// backend for `format`.
    ///
    /// # Errors
    ///
    /// - [`CygnoError::NotFound`] if `directory` is missing
    /// - [`CygnoError::Pattern`] if `pattern` does not compile
    /// - [`CygnoError::FeatureNotEnabled`] if the backend is not compiled in
    pub fn build(
        directory: impl AsRef<Path>,
        format: FileFormat,
        pattern: Option<&str>,
    ) -> CygnoResult<Self> {
        let scheme = AliasScheme::for_format(format, pattern, None)?;
        Self::build_with(
            directory,
            &scheme,
            format.default_opener()?,
            CollisionPolicy::default(),
        )
    }

    /// Scan `directory` with an explicit scheme, backend and collision policy.
    pub fn build_with(
        directory: impl AsRef<Path>,
        scheme: &AliasScheme,
        opener: Arc<dyn SourceOpener>,
        policy: CollisionPolicy,
    ) -> CygnoResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        let candidates = scan(&directory)?;

        let mut entries: BTreeMap<String, AliasEntry> = BTreeMap::new();
        let mut skipped = 0usize;
        for path in candidates {
            let Some(alias) = scheme.derive(&path) else {
                trace!(path = %path.display(), "No alias match, skipping");
                skipped += 1;
                continue;
            };
            match entries.entry(alias) {
                Entry::Vacant(slot) => {
                    slot.insert(AliasEntry {
                        path,
                        accessor: OnceCell::new(),
                    });
                }
                Entry::Occupied(mut slot) => match policy {
                    CollisionPolicy::Reject => {
                        return Err(CygnoError::AliasCollision {
                            alias: slot.key().clone(),
                            first: slot.get().path.clone(),
                            second: path,
                        });
                    }
                    CollisionPolicy::LastWins => {
                        warn!(
                            alias = %slot.key(),
                            replaced = %slot.get().path.display(),
                            by = %path.display(),
                            "Alias collision, later path wins"
                        );
                        slot.get_mut().path = path;
                    }
                },
            }
        }

        let aliases: Vec<String> = entries.keys().cloned().collect();
        info!(
            directory = %directory.display(),
            format = %opener.format(),
            aliases = aliases.len(),
            skipped,
            "Built collection"
        );

        Ok(Self {
            directory,
            format: opener.format(),
            opener,
            entries,
            aliases,
            closed: AtomicBool::new(false),
        })
    }

    /// Accessor for `alias`, opening the file on first use.
    ///
    /// # Errors
    ///
    /// - [`CygnoError::AliasNotFound`] if the alias was not discovered
    /// - [`CygnoError::ClosedResource`] after [`close`](Self::close)
    /// - any error from opening the file; nothing is cached in that case
    pub fn get(&self, alias: &str) -> CygnoResult<Arc<FileAccessor>> {
        self.ensure_open()?;
        let entry = self
            .entries
            .get(alias)
            .ok_or_else(|| CygnoError::AliasNotFound(alias.to_string()))?;

        if let Some(accessor) = entry.accessor.get() {
            trace!(alias, "Accessor cache hit");
            return Ok(Arc::clone(accessor));
        }

        let accessor = entry.accessor.get_or_try_init(|| {
            debug!(alias, path = %entry.path.display(), "Opening accessor");
            FileAccessor::open(&entry.path, self.opener.as_ref()).map(Arc::new)
        })?;

        // Lost a race with close(): release what was just opened.
        if self.closed.load(Ordering::Acquire) {
            accessor.close();
            return Err(self.closed_error());
        }
        Ok(Arc::clone(accessor))
    }

    /// Discovered aliases.
    pub fn list_aliases(&self) -> BTreeSet<String> {
        self.aliases.iter().cloned().collect()
    }

    /// Discovered aliases in sorted order, for positional sampling.
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// File backing `alias`.
    pub fn path_of(&self, alias: &str) -> Option<&Path> {
        self.entries.get(alias).map(|e| e.path.as_path())
    }

    /// Scanned directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Format of the collection's files.
    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Number of aliases.
    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    /// True if no file matched.
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Number of aliases whose file has been opened.
    pub fn opened_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.accessor.get().is_some())
            .count()
    }

    /// Close every opened accessor. Later `get` calls fail.
    ///
    /// Returns how many handles this call released. Idempotent.
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let released = self
            .entries
            .values()
            .filter_map(|e| e.accessor.get())
            .filter(|accessor| accessor.close())
            .count();
        info!(
            directory = %self.directory.display(),
            released,
            "Closed collection"
        );
        released
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> CygnoResult<()> {
        if self.is_closed() {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    fn closed_error(&self) -> CygnoError {
        CygnoError::ClosedResource(format!("collection {}", self.directory.display()))
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("directory", &self.directory)
            .field("format", &self.format)
            .field("aliases", &self.aliases)
            .field("opened", &self.opened_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Files exactly two levels below `root`, sorted by path.
fn scan(root: &Path) -> CygnoResult<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(CygnoError::NotFound(root.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .follow_links(true)
    {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Skipping unreadable directory entry"),
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::MemoryOpener;
    use crate::image::{Dtype, Image};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    fn frames(n: usize) -> Vec<(String, Image)> {
        (0..n)
            .map(|i| (format!("evt_{i}"), Image::zeros((4, 4), Dtype::I16)))
            .collect()
    }

    /// Simulation layout: two energies, a stray file, a nested-too-deep file.
    fn simulation_tree() -> (tempfile::TempDir, Arc<MemoryOpener>) {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(MemoryOpener::new(FileFormat::Hdf5));
        for rel in ["sim/ER_6_keV.h5", "sim/NR_10.5_keV.h5"] {
            let path = dir.path().join(rel);
            touch(&path);
            opener.insert(&path, frames(3));
        }
        touch(&dir.path().join("sim/readme.txt"));
        touch(&dir.path().join("top_level_ER_1_keV.h5"));
        touch(&dir.path().join("sim/deeper/ER_2_keV.h5"));
        (dir, opener)
    }

    fn build_sim(dir: &Path, opener: &Arc<MemoryOpener>) -> Collection {
        Collection::build_with(
            dir,
            &AliasScheme::for_format(FileFormat::Hdf5, None, None).unwrap(),
            opener.clone(),
            CollisionPolicy::LastWins,
        )
        .unwrap()
    }

    #[test]
    fn test_captured_alias() {
        let scheme = AliasScheme::for_format(FileFormat::Hdf5, None, None).unwrap();
        assert_eq!(
            scheme.derive(Path::new("/data/sim/ER_6_keV.h5")).as_deref(),
            Some("er_6")
        );
        assert_eq!(
            scheme.derive(Path::new("/data/sim/NR_0.5_keV.h5")).as_deref(),
            Some("nr_0.5")
        );
        assert_eq!(scheme.derive(Path::new("/data/sim/other.h5")), None);
    }

    #[test]
    fn test_file_stem_alias() {
        let scheme = AliasScheme::for_format(FileFormat::Root, None, None).unwrap();
        assert_eq!(
            scheme
                .derive(Path::new("/d/01_raw/fusion/histograms_Run05871.root"))
                .as_deref(),
            Some("run05871")
        );
        assert_eq!(
            scheme
                .derive(Path::new("/d/01_raw/quest/Run1.root"))
                .as_deref(),
            Some("run1")
        );
        assert_eq!(
            scheme.derive(Path::new("/d/01_raw/other/histograms_Run1.root")),
            None
        );
        assert_eq!(
            scheme.derive(Path::new("/d/01_raw/fusion/histograms_Run1.root.bak")),
            None
        );
    }

    #[test]
    fn test_build_scans_two_levels_only() {
        let (dir, opener) = simulation_tree();
        let collection = build_sim(dir.path(), &opener);
        let expected: BTreeSet<String> = ["er_6", "nr_10.5"].iter().map(|s| s.to_string()).collect();
        assert_eq!(collection.list_aliases(), expected);
        assert_eq!(collection.aliases(), &["er_6".to_string(), "nr_10.5".to_string()]);
        // Build never opens files.
        assert_eq!(opener.total_opens(), 0);
    }

    #[test]
    fn test_alias_sets_are_deterministic() {
        let (dir, opener) = simulation_tree();
        let a = build_sim(dir.path(), &opener);
        let b = build_sim(dir.path(), &opener);
        assert_eq!(a.list_aliases(), b.list_aliases());
    }

    #[test]
    fn test_missing_directory() {
        let opener = Arc::new(MemoryOpener::new(FileFormat::Hdf5));
        let err = Collection::build_with(
            "/no/such/collection",
            &AliasScheme::captured(DEFAULT_HDF5_PATTERN).unwrap(),
            opener,
            CollisionPolicy::LastWins,
        )
        .unwrap_err();
        assert!(matches!(err, CygnoError::NotFound(_)));
    }

    #[test]
    fn test_bad_pattern() {
        let err = AliasScheme::captured("(ER|NR").unwrap_err();
        assert!(matches!(err, CygnoError::Pattern(_)));
    }

    #[test]
    fn test_get_caches_by_identity() {
        let (dir, opener) = simulation_tree();
        let collection = build_sim(dir.path(), &opener);

        let first = collection.get("er_6").unwrap();
        let second = collection.get("er_6").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 3);
        assert_eq!(
            opener.open_count(collection.path_of("er_6").unwrap()),
            1
        );
        assert_eq!(collection.opened_count(), 1);
    }

    #[test]
    fn test_unknown_alias() {
        let (dir, opener) = simulation_tree();
        let collection = build_sim(dir.path(), &opener);
        assert!(matches!(
            collection.get("er_99"),
            Err(CygnoError::AliasNotFound(a)) if a == "er_99"
        ));
    }

    #[test]
    fn test_failed_open_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim/ER_1_keV.h5");
        touch(&path);
        let opener = Arc::new(MemoryOpener::new(FileFormat::Hdf5));
        let collection = build_sim(dir.path(), &opener);

        assert!(matches!(
            collection.get("er_1"),
            Err(CygnoError::Format { .. })
        ));
        opener.insert(&path, frames(1));
        assert_eq!(collection.get("er_1").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_get_opens_once() {
        let (dir, _) = simulation_tree();
        let opener = Arc::new(
            MemoryOpener::new(FileFormat::Hdf5).with_open_delay(Duration::from_millis(50)),
        );
        let path = dir.path().join("sim/ER_6_keV.h5");
        opener.insert(&path, frames(3));
        let collection = build_sim(dir.path(), &opener);

        let handles: Vec<Arc<FileAccessor>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| collection.get("er_6").unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(opener.open_count(&path), 1);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_close_releases_handles() {
        let (dir, opener) = simulation_tree();
        let collection = build_sim(dir.path(), &opener);
        let accessor = collection.get("nr_10.5").unwrap();

        assert_eq!(collection.close(), 1);
        assert_eq!(collection.close(), 0);
        assert!(accessor.is_closed());
        assert!(matches!(
            accessor.get_by_index(0),
            Err(CygnoError::ClosedResource(_))
        ));
        assert!(matches!(
            collection.get("er_6"),
            Err(CygnoError::ClosedResource(_))
        ));
    }

    #[test]
    fn test_drop_closes_accessors() {
        let (dir, opener) = simulation_tree();
        let accessor = {
            let collection = build_sim(dir.path(), &opener);
            collection.get("er_6").unwrap()
        };
        assert!(accessor.is_closed());
    }

    fn colliding_tree() -> (tempfile::TempDir, Arc<MemoryOpener>) {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(MemoryOpener::new(FileFormat::Hdf5));
        for rel in ["a/ER_6_keV.h5", "b/er_6_keV_v2.h5"] {
            let path = dir.path().join(rel);
            touch(&path);
            opener.insert(&path, frames(1));
        }
        (dir, opener)
    }

    #[test]
    #[traced_test]
    fn test_collision_last_wins() {
        let (dir, opener) = colliding_tree();
        let scheme = AliasScheme::captured(r"(?i)(ER|NR)_(\d+)_keV").unwrap();
        let collection =
            Collection::build_with(dir.path(), &scheme, opener, CollisionPolicy::LastWins)
                .unwrap();

        assert_eq!(collection.len(), 1);
        assert_eq!(
            collection.path_of("er_6").unwrap(),
            dir.path().join("b/er_6_keV_v2.h5")
        );
        assert!(logs_contain("Alias collision"));
    }

    #[test]
    fn test_collision_reject() {
        let (dir, opener) = colliding_tree();
        let scheme = AliasScheme::captured(r"(?i)(ER|NR)_(\d+)_keV").unwrap();
        let err = Collection::build_with(dir.path(), &scheme, opener, CollisionPolicy::Reject)
            .unwrap_err();
        match err {
            CygnoError::AliasCollision { alias, first, second } => {
                assert_eq!(alias, "er_6");
                assert!(first.ends_with("a/ER_6_keV.h5"));
                assert!(second.ends_with("b/er_6_keV_v2.h5"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
