//! Generation configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/generation.toml`)
//! 2. environment variables prefixed with `CYGNO_`, `__` separating levels
//!    (e.g. `CYGNO_GENERATE_DATA__SEED=7`)
//!
//! # Example
//! ```no_run
//! use cygno_synth::config::GenerationConfig;
//!
//! let config = GenerationConfig::load_from("config/generation.toml")?;
//! config.validate().map_err(cygno_synth::CygnoError::Configuration)?;
//! let params = config.synthesis_params("train")?;
//! println!("{} events", params.event_count);
//! # Ok::<(), cygno_synth::CygnoError>(())
//! ```
//!
//! # File layout
//! ```toml
//! [logging]
//! level = "info"
//! format = "compact"
//!
//! [simulation]
//! directory = "data/01_raw/simulation"
//! format = "h5"
//!
//! [noise]
//! directory = "data/01_raw"
//! format = "root"
//! prefix = "histograms_"
//!
//! [generate_data]
//! max_translation = 100
//! edges = [250, 2050, 250, 2050]
//! seed = 7
//!
//! [generate_data.splits.train]
//! events = 1000
//! simulation = { max_events = 4, valid_indexes = [0, 1, 2] }
//! noise = { valid_indexes = [0, 1] }
//!
//! [output]
//! directory = "data/02_intermediate"
//! ```

use crate::data::accessor::{FileFormat, SourceOpener};
use crate::data::collection::{AliasScheme, Collection, CollisionPolicy};
use crate::error::{CygnoError, CygnoResult};
use crate::image::CropBox;
use crate::logging::OutputFormat;
use crate::synthesis::{PartitionOrder, SynthesisParams};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/generation.toml";

/// Prefix of overriding environment variables.
pub const ENV_PREFIX: &str = "CYGNO_";

/// Top-level generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Signal (simulation) file collection
    pub simulation: DatasetConfig,
    /// Noise file collection
    pub noise: DatasetConfig,
    /// Synthesis settings shared by all splits, plus the splits
    pub generate_data: GenerateDataConfig,
    /// Where batches are written; absent means in-memory only
    #[serde(default)]
    pub output: Option<OutputConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
    /// Log busy/idle timings when spans close
    #[serde(default)]
    pub span_timings: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
            span_timings: false,
        }
    }
}

/// One file collection on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Directory scanned as `directory/*/*`
    pub directory: PathBuf,
    /// File format (`h5` or `root`)
    pub format: FileFormat,
    /// Alias regex; the format's default when absent
    #[serde(default)]
    pub pattern: Option<String>,
    /// File-stem prefix stripped from ROOT aliases
    #[serde(default)]
    pub prefix: Option<String>,
    /// Alias collision handling
    #[serde(default)]
    pub collision: CollisionPolicy,
}

impl DatasetConfig {
    /// Alias scheme described by this section.
    pub fn alias_scheme(&self) -> CygnoResult<AliasScheme> {
        AliasScheme::for_format(self.format, self.pattern.as_deref(), self.prefix.as_deref())
    }

    /// Scan the directory with the compiled-in backend for the format.
    pub fn build_collection(&self) -> CygnoResult<Collection> {
        self.build_collection_with(self.format.default_opener()?)
    }

    /// Scan the directory with an explicit backend.
    pub fn build_collection_with(&self, opener: Arc<dyn SourceOpener>) -> CygnoResult<Collection> {
        Collection::build_with(&self.directory, &self.alias_scheme()?, opener, self.collision)
    }
}

/// `[generate_data]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateDataConfig {
    /// Translation range for signal frames
    pub max_translation: usize,
    /// Crop box `[xmin, xmax, ymin, ymax]`
    pub edges: CropBox,
    /// Base seed; each split derives its own from it
    #[serde(default)]
    pub seed: Option<u64>,
    /// Partition id order
    #[serde(default)]
    pub ordering: PartitionOrder,
    /// Worker pool size; defaults to available parallelism
    #[serde(default)]
    pub workers: Option<usize>,
    /// Named splits (train, validation, ...)
    #[serde(default)]
    pub splits: BTreeMap<String, SplitConfig>,
}

/// One named split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Number of samples
    pub events: usize,
    /// Signal sampling
    pub simulation: SplitSimulation,
    /// Noise sampling
    pub noise: SplitNoise,
}

/// Signal sampling of a split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitSimulation {
    /// Exclusive upper bound on signal frames per sample
    pub max_events: usize,
    /// Frame indexes that may be drawn
    pub valid_indexes: Vec<usize>,
}

/// Noise sampling of a split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitNoise {
    /// Frame indexes that may be drawn
    pub valid_indexes: Vec<usize>,
}

/// `[output]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving one `<split>.h5` per split
    pub directory: PathBuf,
}

impl OutputConfig {
    /// Output file of `split`.
    pub fn path_for(&self, split: &str) -> PathBuf {
        self.directory.join(format!("{}.h5", split))
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// FNV-1a over the split name, mixed into the base seed so splits differ.
fn split_seed(seed: u64, split: &str) -> u64 {
    split
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, b| {
            (hash ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
        })
        ^ seed
}

impl GenerationConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables
    pub fn load() -> CygnoResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables override the file, e.g.
    /// `CYGNO_GENERATE_DATA__WORKERS=4`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CygnoResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let data = &self.generate_data;
        if data.edges.is_inverted() {
            return Err(format!(
                "Invalid edges {:?}: max must not be below min",
                <[usize; 4]>::from(data.edges)
            ));
        }
        if data.workers == Some(0) {
            return Err("workers must be greater than 0".to_string());
        }
        if data.splits.is_empty() {
            return Err("generate_data defines no splits".to_string());
        }

        for (name, split) in &data.splits {
            if split.simulation.max_events < 2 {
                return Err(format!(
                    "Split '{}': simulation.max_events must be at least 2 (got {})",
                    name, split.simulation.max_events
                ));
            }
            if split.simulation.valid_indexes.is_empty() {
                return Err(format!(
                    "Split '{}': simulation.valid_indexes cannot be empty",
                    name
                ));
            }
            if split.noise.valid_indexes.is_empty() {
                return Err(format!(
                    "Split '{}': noise.valid_indexes cannot be empty",
                    name
                ));
            }
        }

        Ok(())
    }

    /// Names of the configured splits.
    pub fn split_names(&self) -> Vec<&str> {
        self.generate_data.splits.keys().map(String::as_str).collect()
    }

    /// Synthesis parameters for `split`.
    ///
    /// # Errors
    ///
    /// [`CygnoError::Configuration`] if the split is not defined.
    pub fn synthesis_params(&self, split: &str) -> CygnoResult<SynthesisParams> {
        let data = &self.generate_data;
        let cfg = data.splits.get(split).ok_or_else(|| {
            CygnoError::Configuration(format!(
                "Unknown split '{}'. Configured: {}",
                split,
                self.split_names().join(", ")
            ))
        })?;
        Ok(SynthesisParams {
            max_signal_count: cfg.simulation.max_events,
            valid_signal_indexes: cfg.simulation.valid_indexes.clone(),
            valid_noise_indexes: cfg.noise.valid_indexes.clone(),
            event_count: cfg.events,
            max_translation: data.max_translation,
            crop_box: data.edges,
            seed: data.seed.map(|seed| split_seed(seed, split)),
            ordering: data.ordering,
            workers: data.workers,
        })
    }
}
