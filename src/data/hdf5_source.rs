//! HDF5 backend.
//!
//! Each top-level member of the file is a 2-D dataset holding one image. The
//! whole dataset is materialized on read; the element type follows the
//! dataset's stored type so simulation `i16` frames stay `i16`.

use super::accessor::{FileFormat, ImageSource, OpenedSource, SourceOpener};
use crate::error::{CygnoError, CygnoResult};
use crate::image::{Image, Pixel};
use hdf5::types::{FloatSize, H5Type, IntSize, TypeDescriptor};
use std::path::{Path, PathBuf};

const FORMAT: &str = "hdf5";

/// Opens HDF5 files read-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hdf5Opener;

impl SourceOpener for Hdf5Opener {
    fn format(&self) -> FileFormat {
        FileFormat::Hdf5
    }

    fn open(&self, path: &Path) -> CygnoResult<OpenedSource> {
        let file = hdf5::File::open(path).map_err(|e| CygnoError::format(path, FORMAT, e))?;
        let keys = file
            .member_names()
            .map_err(|e| CygnoError::format(path, FORMAT, e))?;
        Ok(OpenedSource {
            keys,
            source: Box::new(Hdf5Source {
                path: path.to_path_buf(),
                file,
            }),
        })
    }
}

/// Open HDF5 file; dropping it closes the handle.
struct Hdf5Source {
    path: PathBuf,
    file: hdf5::File,
}

impl Hdf5Source {
    fn read_typed<T: Pixel + H5Type>(
        &self,
        dataset: &hdf5::Dataset,
        shape: (usize, usize),
    ) -> CygnoResult<Image> {
        let raw = dataset
            .read_raw::<T>()
            .map_err(|e| CygnoError::format(&self.path, FORMAT, e))?;
        Image::from_shape_vec(shape, raw).map_err(|e| CygnoError::format(&self.path, FORMAT, e))
    }
}

impl ImageSource for Hdf5Source {
    fn read_image(&mut self, key: &str) -> CygnoResult<Image> {
        let dataset = self
            .file
            .dataset(key)
            .map_err(|e| CygnoError::format(&self.path, FORMAT, e))?;
        let shape = match dataset.shape().as_slice() {
            [rows, cols] => (*rows, *cols),
            other => {
                return Err(CygnoError::format(
                    &self.path,
                    FORMAT,
                    format!("dataset '{}' has shape {:?}, expected 2-D", key, other),
                ))
            }
        };
        let descriptor = dataset
            .dtype()
            .and_then(|t| t.to_descriptor())
            .map_err(|e| CygnoError::format(&self.path, FORMAT, e))?;

        match descriptor {
            TypeDescriptor::Unsigned(IntSize::U1) => self.read_typed::<u8>(&dataset, shape),
            TypeDescriptor::Integer(IntSize::U1) | TypeDescriptor::Integer(IntSize::U2) => {
                self.read_typed::<i16>(&dataset, shape)
            }
            TypeDescriptor::Unsigned(IntSize::U2) => self.read_typed::<u16>(&dataset, shape),
            TypeDescriptor::Integer(IntSize::U4) => self.read_typed::<i32>(&dataset, shape),
            TypeDescriptor::Float(FloatSize::U4) => self.read_typed::<f32>(&dataset, shape),
            // Wider integers and anything else convertible land in f64.
            _ => self.read_typed::<f64>(&dataset, shape),
        }
    }
}
