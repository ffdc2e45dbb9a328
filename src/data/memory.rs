//! In-memory backend for dry runs and tests.
//!
//! [`MemoryOpener`] serves images registered per path instead of parsing the
//! file. The path still has to exist on disk (the accessor checks that before
//! calling any backend), so collection discovery and alias derivation run
//! exactly as they would over real HDF5/ROOT files.
//!
//! Every successful open is counted per path, which makes the "one open per
//! alias" guarantee of [`Collection`](super::collection::Collection) observable.

use super::accessor::{FileFormat, ImageSource, OpenedSource, SourceOpener};
use crate::error::{CygnoError, CygnoResult};
use crate::image::Image;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

type Entries = Arc<Vec<(String, Image)>>;

/// Backend that serves pre-registered images keyed by file path.
pub struct MemoryOpener {
    format: FileFormat,
    files: Mutex<HashMap<PathBuf, Entries>>,
    opens: Mutex<HashMap<PathBuf, usize>>,
    open_delay: Duration,
}

impl MemoryOpener {
    /// Empty backend reporting `format`.
    pub fn new(format: FileFormat) -> Self {
        Self {
            format,
            files: Mutex::new(HashMap::new()),
            opens: Mutex::new(HashMap::new()),
            open_delay: Duration::ZERO,
        }
    }

    /// Sleep this long inside every open, to widen race windows in tests.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Register the `(key, image)` pairs served for `path`, in key order.
    pub fn insert(&self, path: impl AsRef<Path>, entries: Vec<(String, Image)>) {
        self.files
            .lock()
            .insert(path.as_ref().to_path_buf(), Arc::new(entries));
    }

    /// Number of successful opens of `path`.
    pub fn open_count(&self, path: impl AsRef<Path>) -> usize {
        self.opens.lock().get(path.as_ref()).copied().unwrap_or(0)
    }

    /// Number of successful opens across all paths.
    pub fn total_opens(&self) -> usize {
        self.opens.lock().values().sum()
    }
}

impl SourceOpener for MemoryOpener {
    fn format(&self) -> FileFormat {
        self.format
    }

    fn open(&self, path: &Path) -> CygnoResult<OpenedSource> {
        if !self.open_delay.is_zero() {
            std::thread::sleep(self.open_delay);
        }
        let entries = self
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| CygnoError::format(path, "memory", "no images registered for path"))?;
        *self.opens.lock().entry(path.to_path_buf()).or_insert(0) += 1;
        Ok(OpenedSource {
            keys: entries.iter().map(|(key, _)| key.clone()).collect(),
            source: Box::new(MemorySource { entries }),
        })
    }
}

struct MemorySource {
    entries: Entries,
}

impl ImageSource for MemorySource {
    fn read_image(&mut self, key: &str) -> CygnoResult<Image> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, image)| image.clone())
            .ok_or_else(|| CygnoError::KeyNotFound {
                key: key.to_string(),
                path: PathBuf::from("<memory>"),
            })
    }
}
