//! Telemetry record types shared with the serial console and the host CLI.

use serde::{Deserialize, Serialize};

use crate::config::DETECTOR_COUNT;
use crate::fusion::OnsetBand;
use crate::rhythm::TrackerState;

/// Everything downstream consumers get about one hop, packed flat so the
/// serial framing layer can serialize it without walking nested structs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub timestamp_ms: u64,

    // Front end
    /// Mapped level in [0, 1].
    pub level: f32,
    /// Fast envelope, raw amplitude.
    pub fast_env: f32,
    /// Peak tracker, raw amplitude.
    pub peak: f32,
    /// Valley tracker, raw amplitude.
    pub valley: f32,
    /// Hardware gain index currently applied.
    pub hw_gain: u8,
    /// False while the dead-input latch is set.
    pub alive: bool,

    // Capture health
    /// Windows discarded because the analysis task fell behind.
    pub dropped_windows: u64,
    /// True while at least four windows in a row were just dropped.
    pub pipeline_overrun: bool,
    /// Producer-side samples lost to a full ring.
    pub ring_overruns: u64,

    // Ensemble
    /// Per-detector normalized strengths, in ensemble order.
    pub strengths: [f32; DETECTOR_COUNT],
    /// True when fusion emitted an onset this hop.
    pub onset: bool,
    /// Fused onset strength in [0, 1] (0 when no onset).
    pub onset_strength: f32,
    /// Band of the emitted onset, when there is one.
    pub onset_band: Option<OnsetBand>,
    /// Contributing-detector bitset of the emitted onset.
    pub onset_detectors: u8,

    // Rhythm
    pub tracker_state: TrackerState,
    /// Best-hypothesis BPM, 0.0 with no hypothesis.
    pub bpm: f32,
    /// Position within the current beat, [0, 1).
    pub beat_phase: f32,
    pub confidence: f32,
    /// True when a beat boundary was crossed this hop.
    pub beat: bool,
}

impl FrameRecord {
    /// A degraded-but-valid record for hops the pipeline could not fully
    /// analyze; the contract is one record per hop no matter what.
    pub fn degraded(timestamp_ms: u64, alive: bool) -> Self {
        Self {
            timestamp_ms,
            level: 0.0,
            fast_env: 0.0,
            peak: 0.0,
            valley: 0.0,
            hw_gain: 0,
            alive,
            dropped_windows: 0,
            pipeline_overrun: false,
            ring_overruns: 0,
            strengths: [0.0; DETECTOR_COUNT],
            onset: false,
            onset_strength: 0.0,
            onset_band: None,
            onset_detectors: 0,
            tracker_state: TrackerState::Idle,
            bpm: 0.0,
            beat_phase: 0.0,
            confidence: 0.0,
            beat: false,
        }
    }
}
