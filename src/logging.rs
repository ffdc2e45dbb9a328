//! Subscriber setup for the crate's `tracing` events.
//!
//! Collection scans, file opens and batch summaries are logged through
//! `tracing`; this module installs a `tracing-subscriber` fmt layer for them.
//! `RUST_LOG` takes precedence over the configured level, and repeated
//! initialization is a no-op.
//!
//! # Example
//! ```no_run
//! use cygno_synth::{config::GenerationConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GenerationConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!("Generation started");
//! # Ok(())
//! # }
//! ```

use crate::config::GenerationConfig;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log line format, `format` in `[logging]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line colored output
    Pretty,
    /// One plain line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Subscriber settings, usually built from the `[logging]` section.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level used when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit a close event with busy/idle timings for every span, such as
    /// the per-split `split` span
    pub span_timings: bool,
}

impl TracingConfig {
    /// Settings from the `[logging]` section
    pub fn from_config(config: &GenerationConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: config.logging.format,
            span_timings: config.logging.span_timings,
        })
    }

    /// Compact output at `level`, without span timings
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::default(),
            span_timings: false,
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span close timings
    pub fn with_span_timings(mut self, enabled: bool) -> Self {
        self.span_timings = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_lowercase()))
    }
}

/// Initialize tracing from the generation configuration
pub fn init_from_config(config: &GenerationConfig) -> Result<(), String> {
    init(TracingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already installed this returns
/// `Ok(())`. Pretty output is colored; compact and JSON output are plain so
/// batch logs stay greppable.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let span_events = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer().with_span_events(span_events);

    let layer = match config.format {
        OutputFormat::Pretty => base.pretty().with_filter(config.filter()).boxed(),
        OutputFormat::Compact => base
            .compact()
            .with_ansi(false)
            .with_filter(config.filter())
            .boxed(),
        OutputFormat::Json => base.json().with_filter(config.filter()).boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(format!("Failed to initialize tracing: {}", e)),
    }
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}
