//! Lazy accessor over a single scientific-format file.
//!
//! A [`FileAccessor`] owns one open file handle plus the ordered list of the
//! file's top-level keys, captured once at open time. Images are materialized
//! on request, by name or by position in that key list.
//!
//! Format backends plug in through two traits:
//!
//! - [`SourceOpener`] opens a path and enumerates its keys
//! - [`ImageSource`] reads one key from an open file
//!
//! ```text
//! path ──SourceOpener::open──▶ OpenedSource { keys, source }
//!                                  │
//!                             FileAccessor ──get_by_name / get_by_index──▶ Image
//! ```

use crate::error::{CygnoError, CygnoResult};
use crate::image::Image;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// On-disk format of a collection's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileFormat {
    /// HDF5 file; each key is a 2-D dataset.
    #[serde(rename = "h5", alias = "hdf5")]
    Hdf5,
    /// ROOT file; each key is a 2-D histogram whose bin contents are the image.
    #[serde(rename = "root")]
    Root,
}

impl FileFormat {
    /// Feature flag that compiles this format's backend.
    pub fn feature(self) -> &'static str {
        match self {
            FileFormat::Hdf5 => "storage_hdf5",
            FileFormat::Root => "storage_root",
        }
    }

    /// Backend compiled into this build for the format.
    ///
    /// # Errors
    ///
    /// [`CygnoError::FeatureNotEnabled`] when the matching storage feature is
    /// off.
    pub fn default_opener(self) -> CygnoResult<Arc<dyn SourceOpener>> {
        match self {
            #[cfg(feature = "storage_hdf5")]
            FileFormat::Hdf5 => Ok(Arc::new(super::hdf5_source::Hdf5Opener)),
            #[cfg(feature = "storage_root")]
            FileFormat::Root => Ok(Arc::new(super::root_source::RootOpener)),
            #[allow(unreachable_patterns)]
            other => Err(CygnoError::FeatureNotEnabled(other.feature().to_string())),
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Hdf5 => write!(f, "hdf5"),
            FileFormat::Root => write!(f, "root"),
        }
    }
}

impl FromStr for FileFormat {
    type Err = CygnoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h5" | "hdf5" => Ok(FileFormat::Hdf5),
            "root" => Ok(FileFormat::Root),
            other => Err(CygnoError::Configuration(format!(
                "Unknown file format '{}'. Must be one of: h5, root",
                other
            ))),
        }
    }
}

/// Reads images out of one open file.
pub trait ImageSource: Send {
    /// Materialize the image stored under `key`.
    ///
    /// `key` is always one of the keys reported at open time.
    fn read_image(&mut self, key: &str) -> CygnoResult<Image>;
}

/// A freshly opened file: its key list and a reader.
pub struct OpenedSource {
    /// Top-level key names in file order.
    pub keys: Vec<String>,
    /// Reader that owns the file handle.
    pub source: Box<dyn ImageSource>,
}

/// Opens files of one format.
pub trait SourceOpener: Send + Sync {
    /// Format handled by this opener.
    fn format(&self) -> FileFormat;

    /// Open `path` read-only and enumerate its keys.
    ///
    /// The caller has already checked that `path` exists.
    fn open(&self, path: &Path) -> CygnoResult<OpenedSource>;
}

/// Lazy keyed/indexed access to the images of one file.
///
/// The key list never changes after open. Reads go through a mutex around
/// the handle so one accessor can be shared between worker threads.
pub struct FileAccessor {
    path: PathBuf,
    format: FileFormat,
    keys: Vec<String>,
    source: Mutex<Option<Box<dyn ImageSource>>>,
}

impl FileAccessor {
    /// Open `path` with the given backend.
    ///
    /// # Errors
    ///
    /// - [`CygnoError::NotFound`] if the path does not exist
    /// - [`CygnoError::Format`] if the backend cannot parse it
    pub fn open(path: impl AsRef<Path>, opener: &dyn SourceOpener) -> CygnoResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CygnoError::NotFound(path.to_path_buf()));
        }
        let OpenedSource { keys, source } = opener.open(path)?;
        tracing::debug!(
            path = %path.display(),
            format = %opener.format(),
            keys = keys.len(),
            "Opened file accessor"
        );
        Ok(Self {
            path: path.to_path_buf(),
            format: opener.format(),
            keys,
            source: Mutex::new(Some(source)),
        })
    }

    /// Open with the backend compiled in for `format`.
    pub fn open_format(path: impl AsRef<Path>, format: FileFormat) -> CygnoResult<Self> {
        let opener = format.default_opener()?;
        Self::open(path, opener.as_ref())
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Format of the underlying file.
    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Top-level keys in file order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if the file has no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Read the image stored under `name`.
    ///
    /// # Errors
    ///
    /// [`CygnoError::ClosedResource`] after [`close`](Self::close),
    /// [`CygnoError::KeyNotFound`] if `name` is not a top-level key.
    pub fn get_by_name(&self, name: &str) -> CygnoResult<Image> {
        let mut guard = self.source.lock();
        let source = guard.as_mut().ok_or_else(|| self.closed_error())?;
        if !self.keys.iter().any(|k| k == name) {
            return Err(CygnoError::KeyNotFound {
                key: name.to_string(),
                path: self.path.clone(),
            });
        }
        source.read_image(name)
    }

    /// Read the image stored under the `index`-th key.
    ///
    /// # Errors
    ///
    /// [`CygnoError::ClosedResource`] after [`close`](Self::close),
    /// [`CygnoError::IndexOutOfRange`] outside `[0, len)`.
    pub fn get_by_index(&self, index: usize) -> CygnoResult<Image> {
        let mut guard = self.source.lock();
        let source = guard.as_mut().ok_or_else(|| self.closed_error())?;
        let key = self.keys.get(index).ok_or(CygnoError::IndexOutOfRange {
            index,
            len: self.keys.len(),
        })?;
        source.read_image(key)
    }

    /// Release the file handle. Calling it again is a no-op.
    ///
    /// Returns `true` if this call closed the handle.
    pub fn close(&self) -> bool {
        let released = self.source.lock().take().is_some();
        if released {
            tracing::debug!(path = %self.path.display(), "Closed file accessor");
        }
        released
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.source.lock().is_none()
    }

    fn closed_error(&self) -> CygnoError {
        CygnoError::ClosedResource(self.path.display().to_string())
    }
}

impl fmt::Debug for FileAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAccessor")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("keys", &self.keys.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::memory::MemoryOpener;
    use crate::image::Dtype;

    fn fixture() -> (tempfile::TempDir, PathBuf, MemoryOpener) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ER_10_keV.h5");
        std::fs::write(&path, b"").unwrap();
        let opener = MemoryOpener::new(FileFormat::Hdf5);
        opener.insert(
            &path,
            vec![
                ("evt_a".to_string(), Image::zeros((2, 2), Dtype::I16)),
                ("evt_b".to_string(), Image::zeros((3, 3), Dtype::I16)),
            ],
        );
        (dir, path, opener)
    }

    #[test]
    fn test_keys_and_lookup() {
        let (_dir, path, opener) = fixture();
        let accessor = FileAccessor::open(&path, &opener).unwrap();
        assert_eq!(accessor.keys(), &["evt_a".to_string(), "evt_b".to_string()]);
        assert_eq!(accessor.get_by_name("evt_b").unwrap().shape(), (3, 3));
        assert_eq!(accessor.get_by_index(0).unwrap().shape(), (2, 2));
        assert_eq!(accessor.format(), FileFormat::Hdf5);
    }

    #[test]
    fn test_missing_key_and_index() {
        let (_dir, path, opener) = fixture();
        let accessor = FileAccessor::open(&path, &opener).unwrap();
        assert!(matches!(
            accessor.get_by_name("evt_z"),
            Err(CygnoError::KeyNotFound { .. })
        ));
        assert!(matches!(
            accessor.get_by_index(2),
            Err(CygnoError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_missing_path() {
        let opener = MemoryOpener::new(FileFormat::Hdf5);
        let err = FileAccessor::open("/definitely/not/here.h5", &opener).unwrap_err();
        assert!(matches!(err, CygnoError::NotFound(_)));
    }

    #[test]
    fn test_unregistered_file_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.h5");
        std::fs::write(&path, b"not hdf5").unwrap();
        let opener = MemoryOpener::new(FileFormat::Hdf5);
        let err = FileAccessor::open(&path, &opener).unwrap_err();
        assert!(matches!(err, CygnoError::Format { .. }));
    }

    #[test]
    fn test_use_after_close() {
        let (_dir, path, opener) = fixture();
        let accessor = FileAccessor::open(&path, &opener).unwrap();
        assert!(accessor.close());
        assert!(!accessor.close());
        assert!(accessor.is_closed());
        assert!(matches!(
            accessor.get_by_index(0),
            Err(CygnoError::ClosedResource(_))
        ));
        assert!(matches!(
            accessor.get_by_name("evt_a"),
            Err(CygnoError::ClosedResource(_))
        ));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("h5".parse::<FileFormat>().unwrap(), FileFormat::Hdf5);
        assert_eq!("ROOT".parse::<FileFormat>().unwrap(), FileFormat::Root);
        assert!("npy".parse::<FileFormat>().is_err());
    }

    #[test]
    #[cfg(not(feature = "storage_root"))]
    fn test_disabled_backend() {
        let err = FileFormat::Root.default_opener().err().unwrap();
        assert!(matches!(err, CygnoError::FeatureNotEnabled(f) if f == "storage_root"));
    }
}
