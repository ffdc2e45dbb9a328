//! # CYGNO Synthetic Event Library
//!
//! Builds synthetic detector-image training samples for the CYGNO
//! machine-learning pipeline. Simulated signal frames and recorded noise
//! frames are read lazily from large HDF5 and ROOT collections, augmented and
//! summed into composite samples on a bounded worker pool.
//!
//! ## Crate Structure
//!
//! - **`image`**: the [`Image`] value type, a dtype-tagged 2-D array with the
//!   augmentation operations (translate, crop, scale, rotate).
//! - **`data`**: the data-access layer. [`FileAccessor`] wraps one open file,
//!   [`Collection`] maps a directory of files to aliases and opens each file
//!   at most once. Format backends sit behind the `storage_hdf5` and
//!   `storage_root` features.
//! - **`synthesis`**: [`synthesize_events`], the concurrent sample generator,
//!   and the [`SampleBatch`] it produces.
//! - **`config`**: Figment-based [`GenerationConfig`] loading from TOML and
//!   `CYGNO_` environment variables.
//! - **`pipeline`**: [`Generator`], which runs the configured splits end to
//!   end.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: the [`CygnoError`] enum shared by every module.
//!
//! ## Example
//!
//! ```no_run
//! use cygno_synth::{synthesize_events, Collection, CropBox, FileFormat, SynthesisParams};
//! use std::sync::Arc;
//!
//! # async fn run() -> cygno_synth::CygnoResult<()> {
//! let signal = Arc::new(Collection::build("data/01_raw/simulation", FileFormat::Hdf5, None)?);
//! let noise = Arc::new(Collection::build("data/01_raw", FileFormat::Root, None)?);
//!
//! let params = SynthesisParams {
//!     max_signal_count: 4,
//!     valid_signal_indexes: (0..100).collect(),
//!     valid_noise_indexes: (0..50).collect(),
//!     event_count: 1000,
//!     max_translation: 100,
//!     crop_box: CropBox::new(250, 2050, 250, 2050),
//!     seed: Some(7),
//!     ordering: Default::default(),
//!     workers: None,
//! };
//! let batch = synthesize_events(signal, noise, params).await?;
//! for partition in &batch {
//!     println!("{} sum={}", partition.id, partition.image.sum());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod image;
pub mod logging;
pub mod pipeline;
pub mod synthesis;

pub use config::GenerationConfig;
pub use data::{Collection, CollisionPolicy, FileAccessor, FileFormat};
pub use error::{CygnoError, CygnoResult};
pub use image::{sum_images, CropBox, Dtype, Image};
pub use pipeline::Generator;
pub use synthesis::{
    partition_id, synthesize_events, synthesize_events_with_cancel, CancelFlag, PartitionOrder,
    SampleBatch, SynthesisParams,
};
