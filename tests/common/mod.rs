//! Shared fixtures for integration tests.
#![allow(dead_code)]

use cygno_synth::data::{AliasScheme, Collection, CollisionPolicy, FileFormat, MemoryOpener};
use cygno_synth::Image;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Directory tree of placeholder files served by a [`MemoryOpener`].
///
/// ROOT trees are rooted at `<tmp>/01_raw` so the default noise pattern
/// matches `fusion/...` and `quest/...` entries.
pub struct MemoryTree {
    pub dir: TempDir,
    pub opener: Arc<MemoryOpener>,
}

impl MemoryTree {
    pub fn new(format: FileFormat) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            opener: Arc::new(MemoryOpener::new(format)),
        }
    }

    /// Same, with every open delayed to widen race windows.
    pub fn with_open_delay(format: FileFormat, millis: u64) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            opener: Arc::new(
                MemoryOpener::new(format)
                    .with_open_delay(std::time::Duration::from_millis(millis)),
            ),
        }
    }

    /// Directory the collection scans.
    pub fn root(&self) -> PathBuf {
        match self.opener_format() {
            FileFormat::Root => self.dir.path().join("01_raw"),
            FileFormat::Hdf5 => self.dir.path().to_path_buf(),
        }
    }

    /// Create `rel` under [`root`](Self::root) and register `frames` for it as `evt_0`, `evt_1`, ...
    pub fn add(&self, rel: &str, frames: Vec<Image>) -> &Self {
        let path = self.root().join(rel);
        touch(&path);
        let entries = frames
            .into_iter()
            .enumerate()
            .map(|(i, image)| (format!("evt_{i}"), image))
            .collect();
        self.opener.insert(&path, entries);
        self
    }

    /// Create `rel` under the root without registering any content.
    pub fn add_unreadable(&self, rel: &str) -> &Self {
        touch(&self.root().join(rel));
        self
    }

    pub fn collection(&self) -> Arc<Collection> {
        let scheme = AliasScheme::for_format(self.opener_format(), None, None).unwrap();
        Arc::new(
            Collection::build_with(
                self.root(),
                &scheme,
                self.opener.clone(),
                CollisionPolicy::LastWins,
            )
            .unwrap(),
        )
    }

    fn opener_format(&self) -> FileFormat {
        use cygno_synth::data::SourceOpener;
        self.opener.format()
    }
}

pub fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"").unwrap();
}

/// `rows x cols` i16 frame, zero except `value` at the center.
pub fn center_frame(rows: usize, cols: usize, value: i16) -> Image {
    let mut a = Array2::<i16>::zeros((rows, cols));
    a[[rows / 2, cols / 2]] = value;
    Image::new(a)
}

/// `rows x cols` frame with `value` everywhere.
pub fn flat_frame(rows: usize, cols: usize, value: i16) -> Image {
    Image::new(Array2::<i16>::from_elem((rows, cols), value))
}
