//! ROOT backend.
//!
//! Noise frames are stored as 2-D histograms, one per top-level key. The
//! image is the histogram's bin contents with the underflow and overflow bins
//! dropped, shaped `(x bins, y bins)`. Keys are listed as `name;cycle`, in
//! the order the file's directory stores them.

use super::accessor::{FileFormat, ImageSource, OpenedSource, SourceOpener};
use super::root_format::{self, KeyHeader};
use crate::error::{CygnoError, CygnoResult};
use crate::image::Image;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Opens ROOT files read-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct RootOpener;

impl SourceOpener for RootOpener {
    fn format(&self) -> FileFormat {
        FileFormat::Root
    }

    fn open(&self, path: &Path) -> CygnoResult<OpenedSource> {
        let mut file = BufReader::new(File::open(path)?);
        let headers =
            root_format::read_keys(&mut file).map_err(|e| root_format::format_error(path, e))?;
        let keys: Vec<String> = headers.iter().map(KeyHeader::label).collect();
        tracing::trace!(path = %path.display(), keys = keys.len(), "Read ROOT key list");
        Ok(OpenedSource {
            keys: keys.clone(),
            source: Box::new(RootSource {
                path: path.to_path_buf(),
                file,
                index: keys.into_iter().zip(headers).collect(),
            }),
        })
    }
}

/// Open ROOT file plus the key headers captured at open.
struct RootSource {
    path: PathBuf,
    file: BufReader<File>,
    index: HashMap<String, KeyHeader>,
}

impl ImageSource for RootSource {
    fn read_image(&mut self, key: &str) -> CygnoResult<Image> {
        let header = self.index.get(key).ok_or_else(|| CygnoError::KeyNotFound {
            key: key.to_string(),
            path: self.path.clone(),
        })?;
        let payload = root_format::read_object(&mut self.file, header)
            .map_err(|e| root_format::format_error(&self.path, e))?;
        let image = root_format::decode_th2(&header.class_name, &payload)
            .map_err(|e| root_format::format_error(&self.path, e))?;
        tracing::trace!(key, shape = ?image.shape(), "Read ROOT histogram");
        Ok(image)
    }
}
