// Error types for the analysis pipeline
//
// No error kind here is fatal to the pipeline: capture faults degrade the
// telemetry stream (alive flag, drop counters), configuration faults reject
// the offending bundle, and numeric faults zero the affected detector for a
// hop. These types exist so the boundaries (CLI, capture backends, reload)
// can report *why* something was rejected.

use log::error;
use std::fmt;

/// Errors surfaced by the analysis pipeline and its capture layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// A parameter in a reload bundle is outside its declared range.
    ParamOutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// A parameter bundle could not be parsed at all.
    ParamParse { reason: String },

    /// Failed to open an input stream (live capture backend).
    StreamOpenFailed { reason: String },

    /// An input stream died after being opened.
    StreamFailure { reason: String },

    /// An input file could not be read or decoded.
    InputDecode { reason: String },

    /// The capture ring was constructed with an unusable geometry.
    BadRingGeometry { windows: usize },
}

impl PipelineError {
    pub fn message(&self) -> String {
        match self {
            PipelineError::ParamOutOfRange {
                name,
                value,
                min,
                max,
            } => {
                format!(
                    "parameter '{}' = {} outside declared range [{}, {}]",
                    name, value, min, max
                )
            }
            PipelineError::ParamParse { reason } => {
                format!("parameter bundle rejected: {}", reason)
            }
            PipelineError::StreamOpenFailed { reason } => {
                format!("failed to open input stream: {}", reason)
            }
            PipelineError::StreamFailure { reason } => {
                format!("input stream failed: {}", reason)
            }
            PipelineError::InputDecode { reason } => {
                format!("could not decode input: {}", reason)
            }
            PipelineError::BadRingGeometry { windows } => {
                format!(
                    "capture ring must hold at least 4 windows (got {})",
                    windows
                )
            }
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::InputDecode {
            reason: err.to_string(),
        }
    }
}

/// Log a pipeline error with structured context.
///
/// Used at the points where an error is swallowed rather than propagated
/// (reload rejection, stream teardown) so the event still reaches the log.
pub fn log_pipeline_error(err: &PipelineError, context: &str) {
    error!("[{}] {}", context, err.message());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message_names_parameter() {
        let err = PipelineError::ParamOutOfRange {
            name: "fusion_threshold",
            value: -1.0,
            min: 0.0,
            max: 10.0,
        };
        let msg = err.message();
        assert!(msg.contains("fusion_threshold"));
        assert!(msg.contains("[0, 10]"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.wav");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::InputDecode { .. }));
    }
}
