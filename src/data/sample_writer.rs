//! HDF5 persistence for synthesized batches.
//!
//! Layout of the output file:
//!
//! ```text
//! samples.h5
//! ├── @event_count      u64
//! ├── part-0000000      2-D dataset, native dtype, @submission_index u64
//! ├── part-0000001
//! └── ...
//! ```
//!
//! Every partition is a top-level 2-D dataset, so the output can be read back
//! through the HDF5 accessor like any simulation file.
//!
//! The writer is synchronous; [`Hdf5SampleWriter::write_async`] moves the work
//! onto the blocking pool so callers on the runtime are never stalled by disk
//! I/O.

use crate::error::{CygnoError, CygnoResult};
use crate::image::{dispatch, PixelArray};
use crate::synthesis::SampleBatch;
use hdf5::types::H5Type;
use ndarray::Array2;
use std::path::{Path, PathBuf};

const FORMAT: &str = "hdf5";

/// Writes [`SampleBatch`]es to an HDF5 file.
#[derive(Debug, Clone)]
pub struct Hdf5SampleWriter {
    output_path: PathBuf,
}

impl Hdf5SampleWriter {
    /// Writer targeting `output_path`. Nothing is created until a write.
    pub fn new(output_path: impl AsRef<Path>) -> Self {
        Self {
            output_path: output_path.as_ref().to_path_buf(),
        }
    }

    /// Target file.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Write `batch`, replacing any existing file. Returns the dataset count.
    pub fn write(&self, batch: &SampleBatch) -> CygnoResult<usize> {
        let err = |e: hdf5::Error| CygnoError::format(&self.output_path, FORMAT, e);

        if let Some(parent) = self.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = hdf5::File::create(&self.output_path).map_err(err)?;
        file.new_attr::<u64>()
            .create("event_count")
            .map_err(err)?
            .write_scalar(&(batch.len() as u64))
            .map_err(err)?;

        for partition in batch {
            let dataset =
                dispatch!(partition.image.pixels(), a => write_dataset(&file, &partition.id, a))
                    .map_err(err)?;
            dataset
                .new_attr::<u64>()
                .create("submission_index")
                .map_err(err)?
                .write_scalar(&(partition.submission_index as u64))
                .map_err(err)?;
        }

        tracing::info!(
            path = %self.output_path.display(),
            datasets = batch.len(),
            "Wrote sample batch"
        );
        Ok(batch.len())
    }

    /// [`write`](Self::write) on the blocking pool.
    pub async fn write_async(self, batch: SampleBatch) -> CygnoResult<usize> {
        tokio::task::spawn_blocking(move || self.write(&batch))
            .await
            .map_err(|e| CygnoError::Task(e.to_string()))?
    }
}

fn write_dataset<T: H5Type + Copy>(
    file: &hdf5::File,
    name: &str,
    array: &Array2<T>,
) -> hdf5::Result<hdf5::Dataset> {
    let (rows, cols) = array.dim();
    let data: Vec<T> = array.iter().copied().collect();
    let dataset = file.new_dataset::<T>().shape([rows, cols]).create(name)?;
    dataset.write_raw(&data)?;
    Ok(dataset)
}
