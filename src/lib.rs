// glowbeat - audio analysis core for a wearable LED-effects device
// Adaptive mic front-end, onset detector ensemble, and rhythm tracking
// over a lock-free capture pipeline.

pub mod capture;
pub mod config;
pub mod detectors;
pub mod error;
pub mod fixtures;
pub mod frontend;
pub mod fusion;
pub mod pipeline;
pub mod rhythm;
pub mod spectral;
pub mod telemetry;

pub use config::PipelineParams;
pub use error::PipelineError;
pub use pipeline::{run_samples, spawn_analysis_thread, Pipeline};
pub use telemetry::FrameRecord;

use once_cell::sync::OnceCell;

static LOGGING: OnceCell<()> = OnceCell::new();

/// Install the tracing subscriber (idempotent). Binaries call this once at
/// startup; the library itself only ever emits through `log` macros.
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_target(false)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_init_logging_is_idempotent() {
        super::init_logging();
        super::init_logging();
    }
}
