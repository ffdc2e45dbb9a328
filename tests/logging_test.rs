//! Global subscriber installation runs in its own test binary.

use cygno_synth::logging::{self, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    assert!(logging::init(TracingConfig::new(Level::ERROR)).is_ok());
    assert!(logging::init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json)).is_ok());
    tracing::error!("Logged after repeated init");
}
