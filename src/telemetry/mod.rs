//! Telemetry hub: per-hop records out to whoever is listening.
//!
//! The pipeline publishes one `FrameRecord` per hop and a `BeatEvent` per
//! beat boundary; the hub fans them out over broadcast channels and keeps a
//! bounded history for snapshot-style consumers (the serial console's
//! catch-up path, the CLI summary). Push-only: nothing a subscriber does
//! can reach back into the pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::rhythm::BeatEvent;

pub mod events;

pub use events::FrameRecord;

/// Broadcast buffer depth for frame records (~4 s of hops).
const FRAME_CHANNEL: usize = 256;

/// Broadcast buffer depth for beat events.
const BEAT_CHANNEL: usize = 64;

/// Snapshot of hub state for one-shot consumers.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetrySnapshot {
    pub recent: Vec<FrameRecord>,
    pub total_frames: u64,
    pub dropped_history: u64,
}

/// Fan-out point between the analysis task and external consumers.
pub struct TelemetryHub {
    frame_tx: broadcast::Sender<FrameRecord>,
    beat_tx: broadcast::Sender<BeatEvent>,
    history: Mutex<VecDeque<FrameRecord>>,
    history_capacity: usize,
    total_frames: AtomicU64,
    dropped_history: AtomicU64,
}

impl TelemetryHub {
    pub fn new(history_capacity: usize) -> Self {
        let (frame_tx, _) = broadcast::channel(FRAME_CHANNEL);
        let (beat_tx, _) = broadcast::channel(BEAT_CHANNEL);
        Self {
            frame_tx,
            beat_tx,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            total_frames: AtomicU64::new(0),
            dropped_history: AtomicU64::new(0),
        }
    }

    /// Publish one hop's record. Never blocks; lagging subscribers lose
    /// frames, not the pipeline.
    pub fn publish_frame(&self, record: FrameRecord) {
        self.total_frames.fetch_add(1, Ordering::Relaxed);
        {
            let mut history = self.history.lock().expect("telemetry history poisoned");
            if history.len() == self.history_capacity {
                history.pop_front();
                self.dropped_history.fetch_add(1, Ordering::Relaxed);
            }
            history.push_back(record);
        }
        let _ = self.frame_tx.send(record);
    }

    pub fn publish_beat(&self, event: BeatEvent) {
        let _ = self.beat_tx.send(event);
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<FrameRecord> {
        self.frame_tx.subscribe()
    }

    pub fn subscribe_beats(&self) -> broadcast::Receiver<BeatEvent> {
        self.beat_tx.subscribe()
    }

    /// Lossless bridge for async consumers that cannot tolerate broadcast
    /// lag; requires a running tokio runtime.
    pub fn subscribe_frames_unbounded(&self) -> mpsc::UnboundedReceiver<FrameRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut broadcast_rx = self.frame_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(record) => {
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("[Telemetry] subscriber lagged, skipped {} frames", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    /// The unbounded bridge as a `Stream`, for `while let Some(..)` loops.
    pub fn frame_stream(&self) -> impl Stream<Item = FrameRecord> {
        UnboundedReceiverStream::new(self.subscribe_frames_unbounded())
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let history = self.history.lock().expect("telemetry history poisoned");
        TelemetrySnapshot {
            recent: history.iter().copied().collect(),
            total_frames: self.total_frames.load(Ordering::Relaxed),
            dropped_history: self.dropped_history.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new(FRAME_CHANNEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let hub = TelemetryHub::new(4);
        for i in 0..10 {
            hub.publish_frame(FrameRecord::degraded(i * 16, true));
        }
        let snapshot = hub.snapshot();
        assert_eq!(snapshot.recent.len(), 4);
        assert_eq!(snapshot.total_frames, 10);
        assert_eq!(snapshot.dropped_history, 6);
        // Oldest retained record is number 6.
        assert_eq!(snapshot.recent[0].timestamp_ms, 6 * 16);
    }

    #[test]
    fn test_subscribers_see_published_frames() {
        let hub = TelemetryHub::default();
        let mut rx = hub.subscribe_frames();
        hub.publish_frame(FrameRecord::degraded(0, true));
        hub.publish_frame(FrameRecord::degraded(16, true));
        assert_eq!(rx.try_recv().unwrap().timestamp_ms, 0);
        assert_eq!(rx.try_recv().unwrap().timestamp_ms, 16);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let hub = TelemetryHub::default();
        hub.publish_frame(FrameRecord::degraded(0, true));
        hub.publish_beat(crate::rhythm::BeatEvent {
            timestamp_ms: 0,
            bpm: 120.0,
            confidence: 0.8,
        });
    }

    #[tokio::test]
    async fn test_unbounded_bridge_delivers() {
        let hub = TelemetryHub::default();
        let mut rx = hub.subscribe_frames_unbounded();
        hub.publish_frame(FrameRecord::degraded(32, true));
        let record = rx.recv().await.expect("bridged frame");
        assert_eq!(record.timestamp_ms, 32);
    }
}
