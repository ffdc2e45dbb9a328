//! Custom error types for the crate.
//!
//! This module defines the primary error type, `CygnoError`, shared by the image
//! primitive, the file accessors, the collection aggregator and the event
//! synthesizer. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle everything from missing files to incompatible image
//! shapes.
//!
//! ## Error Hierarchy
//!
//! - **Lookup errors** - `NotFound`, `KeyNotFound`, `AliasNotFound`,
//!   `IndexOutOfRange`: a path, key, alias or position that does not exist.
//! - **Format errors** - `Format`: the file exists but cannot be parsed by the
//!   selected backend.
//! - **Lifecycle errors** - `ClosedResource`, `Cancelled`: use after close, or a
//!   batch that was asked to stop.
//! - **Numeric errors** - `ShapeMismatch`, `Domain`: images that cannot be summed
//!   or a value range that cannot be rescaled.
//! - **Configuration errors** - `Config`, `Configuration`, `Pattern`,
//!   `AliasCollision`, `FeatureNotEnabled`.
//!
//! None of these are retried internally. They propagate to whoever called the
//! accessor, collection or synthesizer.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type CygnoResult<T> = std::result::Result<T, CygnoError>;

/// Primary error type for collection access and event synthesis.
#[derive(Error, Debug)]
pub enum CygnoError {
    /// A file or directory does not exist.
    #[error("Path not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but the backend could not parse it.
    ///
    /// **Error Type**: Permanent - the file is corrupt or of another format.
    #[error("Cannot read '{}' as {format}: {message}", path.display())]
    Format {
        /// File that failed to parse.
        path: PathBuf,
        /// Backend name ("hdf5", "root", ...).
        format: String,
        /// Backend error text.
        message: String,
    },

    /// A key is absent from a file's top-level key list.
    #[error("Key '{key}' not found in '{}'", path.display())]
    KeyNotFound {
        /// Requested key.
        key: String,
        /// File that was searched.
        path: PathBuf,
    },

    /// An alias is absent from a collection.
    #[error("Alias '{0}' not found in collection")]
    AliasNotFound(String),

    /// Positional access outside `[0, len)`.
    #[error("Index {index} out of range for {len} entries")]
    IndexOutOfRange {
        /// Requested position.
        index: usize,
        /// Number of entries available.
        len: usize,
    },

    /// An accessor or collection was used after `close()`.
    #[error("Resource already closed: {0}")]
    ClosedResource(String),

    /// Two images could not be combined element-wise.
    #[error("Shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Shape of the accumulated image.
        expected: (usize, usize),
        /// Shape of the offending image.
        found: (usize, usize),
    },

    /// A numeric range was invalid (e.g. `scale` with `imax <= imin`).
    #[error("Domain error: {0}")]
    Domain(String),

    /// Two files mapped to the same alias under `CollisionPolicy::Reject`.
    #[error("Alias '{alias}' derived from both '{}' and '{}'", first.display(), second.display())]
    AliasCollision {
        /// Colliding alias.
        alias: String,
        /// Path that claimed the alias first.
        first: PathBuf,
        /// Path that claimed it second.
        second: PathBuf,
    },

    /// An alias pattern failed to compile.
    #[error("Invalid alias pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Required backend not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// A synthesis batch was cancelled before this task finished.
    #[error("Synthesis cancelled")]
    Cancelled,

    /// A worker task panicked or was aborted.
    #[error("Worker task failed: {0}")]
    Task(String),
}

impl CygnoError {
    /// Wrap a backend error as a [`CygnoError::Format`].
    pub fn format(path: &Path, format: &str, err: impl std::fmt::Display) -> Self {
        CygnoError::Format {
            path: path.to_path_buf(),
            format: format.to_string(),
            message: err.to_string(),
        }
    }
}
