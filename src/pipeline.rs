// Analysis pipeline - one hop of work per window, in a fixed order
//
// Front end -> spectral stage -> detector bank -> fusion -> rhythm tracker
// -> telemetry. The pipeline owns every component's state; stages exchange
// values through the per-hop context only. A telemetry record goes out
// every hop, degraded or not: the alive flag and the drop counters are how
// consumers learn the input went bad, never a missing record.
//
// Parameter bundles swap at window boundaries only, and only after the
// whole bundle validated; a rejected reload leaves the running bundle
// untouched.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::capture::{capture_pair, CaptureShared, WindowReader, WindowStatus};
use crate::config::{PipelineParams, HOP_SIZE, WINDOW_SIZE};
use crate::detectors::{DetectorBank, DetectorKind, FrameContext};
use crate::error::{log_pipeline_error, PipelineError};
use crate::frontend::AdaptiveMic;
use crate::fusion::FusionStage;
use crate::rhythm::RhythmTracker;
use crate::spectral::SpectralAnalyzer;
use crate::telemetry::{FrameRecord, TelemetryHub};

pub struct Pipeline {
    params: PipelineParams,
    pending_params: Option<PipelineParams>,
    mic: AdaptiveMic,
    spectral: SpectralAnalyzer,
    bank: DetectorBank,
    fusion: FusionStage,
    rhythm: RhythmTracker,
    hub: Arc<TelemetryHub>,
    capture: Option<Arc<CaptureShared>>,
    pending_gain: Option<u8>,
    was_alive: bool,
}

impl Pipeline {
    pub fn new(params: PipelineParams) -> Result<Self, PipelineError> {
        params.validate()?;
        Ok(Self {
            mic: AdaptiveMic::new(&params.front_end),
            spectral: SpectralAnalyzer::new(&params.detectors),
            bank: DetectorBank::new(&params.detectors),
            fusion: FusionStage::new(&params.fusion),
            rhythm: RhythmTracker::new(&params.rhythm),
            hub: Arc::new(TelemetryHub::default()),
            capture: None,
            pending_gain: None,
            was_alive: true,
            pending_params: None,
            params,
        })
    }

    /// Wire up the capture layer's shared block so the AGC can program the
    /// hardware gain.
    pub fn attach_capture(&mut self, shared: Arc<CaptureShared>) {
        shared.set_gain(self.mic.gain());
        self.capture = Some(shared);
    }

    pub fn hub(&self) -> Arc<TelemetryHub> {
        Arc::clone(&self.hub)
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    /// Stage a new parameter bundle; it takes effect at the next window
    /// boundary. Rejected as a whole if any field is out of range.
    pub fn request_reload(&mut self, params: PipelineParams) -> Result<(), PipelineError> {
        if let Err(err) = params.validate() {
            log_pipeline_error(&err, "Pipeline reload");
            return Err(err);
        }
        if params == self.params && self.pending_params.is_none() {
            // Identical bundle: nothing to do, and no state is touched.
            return Ok(());
        }
        self.pending_params = Some(params);
        Ok(())
    }

    /// Drop all accumulated state, as if freshly constructed. Replaying the
    /// same sample stream after a reset reproduces identical telemetry.
    pub fn reset(&mut self) {
        self.mic.reset();
        self.spectral.reset();
        self.bank.reset();
        self.fusion.reset();
        self.rhythm.reset();
        self.pending_gain = None;
        self.was_alive = true;
    }

    fn apply_pending_params(&mut self) {
        if let Some(params) = self.pending_params.take() {
            log::info!("[Pipeline] applying reloaded parameters");
            self.mic.set_params(&params.front_end);
            self.spectral.set_params(&params.detectors);
            self.bank.set_params(&params.detectors);
            self.fusion.set_params(&params.fusion);
            self.rhythm.set_params(&params.rhythm);
            self.params = params;
        }
    }

    /// Process one full window (HOP new samples + overlap) and emit this
    /// hop's telemetry record.
    pub fn process_window(&mut self, window: &[f32], status: WindowStatus) -> FrameRecord {
        debug_assert_eq!(window.len(), WINDOW_SIZE);

        // Window boundary: apply what last hop decided.
        if let Some(gain) = self.pending_gain.take() {
            if let Some(shared) = &self.capture {
                shared.set_gain(gain);
            }
        }
        self.apply_pending_params();

        let t = status.timestamp_ms;
        let hop = &window[WINDOW_SIZE - HOP_SIZE..];

        let front = self.mic.process(hop, t, status.alive);
        if front.gain_changed {
            self.pending_gain = Some(front.hw_gain);
        }

        self.spectral.process(window);

        // Detectors are suppressed while the input is dead; their
        // statistics restart on the recovery edge so the zero-to-signal
        // step can't read as a hit.
        if !self.was_alive && status.alive {
            log::info!("[Pipeline] input recovered, restarting detector statistics");
            self.bank.reset();
            self.fusion.reset();
        }
        self.was_alive = status.alive;

        let onset = if status.alive {
            let ctx = FrameContext {
                timestamp_ms: t,
                hop_ms: crate::config::HOP_MS as f32,
                front,
                spectral: self.spectral.frame(),
            };
            let outputs = self.bank.update(&ctx);
            self.fusion.update(outputs, t)
        } else {
            None
        };

        let rhythm = self.rhythm.update(onset.as_ref(), t);
        if let Some(beat) = rhythm.beat {
            self.hub.publish_beat(beat);
        }

        let mut strengths = [0.0_f32; crate::config::DETECTOR_COUNT];
        if status.alive {
            for kind in DetectorKind::ALL {
                strengths[kind.index()] = self.bank.outputs()[kind.index()].strength;
            }
        }

        let record = FrameRecord {
            timestamp_ms: t,
            level: front.level,
            fast_env: front.fast_env,
            peak: front.peak,
            valley: front.valley,
            hw_gain: front.hw_gain,
            alive: status.alive,
            dropped_windows: status.dropped_windows,
            pipeline_overrun: status.overrun,
            ring_overruns: status.ring_overruns,
            strengths,
            onset: onset.is_some(),
            onset_strength: onset.map(|o| o.strength).unwrap_or(0.0),
            onset_band: onset.map(|o| o.band),
            onset_detectors: onset.map(|o| o.detectors).unwrap_or(0),
            tracker_state: rhythm.state,
            bpm: rhythm.bpm,
            beat_phase: rhythm.phase,
            confidence: rhythm.confidence,
            beat: rhythm.beat.is_some(),
        };
        self.hub.publish_frame(record);
        record
    }
}

/// Spawn the analysis task: drain the reader until shutdown or end of
/// input, advancing the pipeline one window at a time.
///
/// Returns the pipeline when the task exits so callers can inspect final
/// state (the CLI prints a summary from it).
pub fn spawn_analysis_thread(mut reader: WindowReader, mut pipeline: Pipeline) -> JoinHandle<Pipeline> {
    thread::spawn(move || {
        log::info!("[Pipeline] analysis task running");
        let mut windows: u64 = 0;
        while let Some((window, status)) = reader.next_window() {
            pipeline.process_window(window, status);
            windows += 1;
        }
        log::info!(
            "[Pipeline] analysis task done after {} windows ({} dropped)",
            windows,
            reader.dropped_windows()
        );
        pipeline
    })
}

/// Push a complete sample buffer through a fresh capture pair and the given
/// pipeline, collecting every telemetry record. Used by the CLI's offline
/// modes and the test harness; fully deterministic for a given input.
pub fn run_samples(pipeline: &mut Pipeline, samples: &[f32]) -> Vec<FrameRecord> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let (mut producer, mut reader) = capture_pair(&pipeline.params.capture, shutdown)
        .expect("validated params always build a capture pair");
    pipeline.attach_capture(producer.shared());

    let mut records = Vec::new();
    let mut chunks = samples.chunks_exact(HOP_SIZE);
    for chunk in &mut chunks {
        producer.push_block(chunk);
        if let Some((window, status)) = reader.next_window() {
            records.push(pipeline.process_window(window, status));
        }
    }
    producer.push_block(chunks.remainder());
    drop(producer);
    while let Some((window, status)) = reader.next_window() {
        records.push(pipeline.process_window(window, status));
    }
    records
}
