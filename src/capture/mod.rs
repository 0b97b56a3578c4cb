// Capture layer - PDM samples in, overlapped analysis windows out
//
// The producer half is written from the capture interrupt (or the desktop
// cpal callback standing in for it) and never blocks. The consumer half is
// the analysis task's only suspension point: `WindowReader::next_window`
// waits until a hop of samples is available and hands back a full window
// with 50% overlap.

mod ring;
mod window;

#[cfg(feature = "live")]
pub mod live;

pub use ring::{BlockProducer, CaptureShared, SampleConsumer};
pub use window::{WindowReader, WindowStatus};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::{CaptureParams, WINDOW_SIZE};
use crate::error::PipelineError;

/// Build a connected producer/reader pair over a fresh sample ring.
///
/// The ring holds `ring_windows` whole analysis windows; the producer is
/// handed to the capture side, the reader to the analysis task.
pub fn capture_pair(
    params: &CaptureParams,
    shutdown: Arc<AtomicBool>,
) -> Result<(BlockProducer, WindowReader), PipelineError> {
    if params.ring_windows < 4 {
        return Err(PipelineError::BadRingGeometry {
            windows: params.ring_windows,
        });
    }
    let (producer, consumer) = ring::sample_ring(params.ring_windows * WINDOW_SIZE);
    let reader = WindowReader::new(consumer, params.dead_input_ms, shutdown);
    Ok((producer, reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureParams, HOP_SIZE};

    #[test]
    fn test_capture_pair_rejects_tiny_ring() {
        let params = CaptureParams {
            ring_windows: 2,
            dead_input_ms: 200,
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        assert!(capture_pair(&params, shutdown).is_err());
    }

    #[test]
    fn test_window_flow_end_to_end() {
        let params = CaptureParams::default();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (mut producer, mut reader) = capture_pair(&params, shutdown).unwrap();

        // Two hops of a constant signal; drop the producer to mark end of input.
        producer.push_block(&vec![0.25_f32; HOP_SIZE * 2]);
        drop(producer);

        let (window, status) = reader.next_window().expect("first window");
        assert_eq!(window.len(), WINDOW_SIZE);
        assert_eq!(status.timestamp_ms, 0);
        // First hop of history is still zero, newest hop carries the signal.
        assert_eq!(window[0], 0.0);
        assert_eq!(window[WINDOW_SIZE - 1], 0.25);

        let (window, status) = reader.next_window().expect("second window");
        assert_eq!(status.timestamp_ms, crate::config::HOP_MS);
        assert!(window.iter().all(|&s| s == 0.25));

        // Producer is gone and the ring is empty.
        assert!(reader.next_window().is_none());
    }
}
