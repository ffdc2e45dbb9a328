//! Data access and persistence.
//!
//! - [`accessor`]: one open file, keyed and indexed image extraction
//! - [`collection`]: directory scan, alias map and lazy accessor cache
//! - [`memory`]: in-memory backend used for dry runs and tests
//! - `hdf5_source` / `root_source`: format backends behind the
//!   `storage_hdf5` / `storage_root` features
//! - `sample_writer`: HDF5 output for synthesized batches (`storage_hdf5`)
pub mod accessor;
pub mod collection;
pub mod memory;

#[cfg(feature = "storage_hdf5")]
pub mod hdf5_source;
#[cfg(feature = "storage_root")]
mod root_format;
#[cfg(feature = "storage_root")]
pub mod root_source;
#[cfg(feature = "storage_hdf5")]
pub mod sample_writer;

pub use accessor::{FileAccessor, FileFormat, ImageSource, OpenedSource, SourceOpener};
pub use collection::{AliasScheme, Collection, CollisionPolicy};
pub use memory::MemoryOpener;

#[cfg(feature = "storage_hdf5")]
pub use hdf5_source::Hdf5Opener;
#[cfg(feature = "storage_root")]
pub use root_source::RootOpener;
#[cfg(feature = "storage_hdf5")]
pub use sample_writer::Hdf5SampleWriter;
