//! Parameter bundles for the analysis pipeline
//!
//! Every tunable the pipeline reads lives here, grouped per stage, with its
//! default value and declared inclusive range. Bundles load from JSON so the
//! host harness can iterate without recompiling; on-device the settings store
//! supplies the same structure. A reload is accepted or rejected as a whole:
//! `PipelineParams::validate()` returns the first out-of-range field and the
//! running pipeline keeps its previous bundle.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::PipelineError;

/// Sample rate fixed per build.
pub const SAMPLE_RATE: u32 = 16_000;
/// Analysis window length in samples.
pub const WINDOW_SIZE: usize = 512;
/// Hop between successive windows (50% overlap).
pub const HOP_SIZE: usize = 256;
/// Duration of one hop in integer milliseconds (256 / 16 kHz).
pub const HOP_MS: u64 = (HOP_SIZE as u64 * 1000) / SAMPLE_RATE as u64;
/// Bins in the one-sided magnitude spectrum.
pub const SPECTRUM_BINS: usize = WINDOW_SIZE / 2 + 1;
/// Number of parallel onset detectors in the ensemble.
pub const DETECTOR_COUNT: usize = 6;

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineParams {
    #[serde(default)]
    pub capture: CaptureParams,
    #[serde(default)]
    pub front_end: FrontEndParams,
    #[serde(default)]
    pub detectors: DetectorBankParams,
    #[serde(default)]
    pub fusion: FusionParams,
    #[serde(default)]
    pub rhythm: RhythmParams,
}

/// Capture layer geometry and fault thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureParams {
    /// Ring capacity in whole analysis windows.
    pub ring_windows: usize,
    /// All-zero input for at least this long latches the dead-input flag.
    pub dead_input_ms: u64,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            ring_windows: 4,
            dead_input_ms: 200,
        }
    }
}

/// Adaptive front-end (AGC + envelopes + level mapping) parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontEndParams {
    /// Increase hardware gain when the peak tracker sits below this.
    pub hw_target_lo: f32,
    /// Decrease hardware gain when the peak tracker sits above this.
    pub hw_target_hi: f32,
    /// Highest hardware gain index the AGC may select.
    pub hw_gain_max: u8,
    /// Consecutive out-of-target windows required before a gain step.
    pub hw_hold_windows: u32,
    /// Minimum spacing between gain steps.
    pub hw_step_ms: u64,
    /// DC estimate time constant.
    pub dc_tau_ms: f32,
    /// Fast envelope time constant.
    pub fast_tau_ms: f32,
    /// Slow envelope time constant.
    pub slow_tau_ms: f32,
    /// Peak tracker release time constant.
    pub peak_tau_ms: f32,
    /// Valley tracker release time constant.
    pub valley_tau_ms: f32,
    /// Fast envelope must exceed slow envelope by this factor to flag a transient.
    pub attack_mult: f32,
    /// Fast envelope must exceed the valley by this factor to flag a transient.
    pub hit_thresh: f32,
    /// Refractory period for the coarse transient flag.
    pub cooldown_ms: u64,
}

impl Default for FrontEndParams {
    fn default() -> Self {
        Self {
            hw_target_lo: 0.15,
            hw_target_hi: 0.35,
            hw_gain_max: 31,
            hw_hold_windows: 6,
            hw_step_ms: 200,
            dc_tau_ms: 1000.0,
            fast_tau_ms: 5.0,
            slow_tau_ms: 200.0,
            peak_tau_ms: 500.0,
            valley_tau_ms: 500.0,
            attack_mult: 1.1,
            hit_thresh: 1.7,
            cooldown_ms: 40,
        }
    }
}

/// Adaptive threshold settings shared by every detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorParams {
    /// z-score the detection function must exceed to fire.
    pub threshold: f32,
    /// Absolute floor the detection function must exceed to fire.
    pub floor: f32,
    /// Per-detector refractory period.
    pub cooldown_ms: u64,
}

impl DetectorParams {
    const fn new(threshold: f32, floor: f32, cooldown_ms: u64) -> Self {
        Self {
            threshold,
            floor,
            cooldown_ms,
        }
    }
}

/// Per-detector tuning for the whole ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorBankParams {
    pub drummer: DetectorParams,
    /// Minimum envelope rise rate (per ms) for the drummer to count a hit.
    pub drummer_min_rise: f32,
    pub flux: DetectorParams,
    /// How many low bins of the whitened spectrum the flux detector sums.
    pub flux_bins: usize,
    pub hfc: DetectorParams,
    /// Linear weight applied to the high-frequency-content sum.
    pub hfc_weight: f32,
    /// Time constant of the sustained-signal suppressor for HFC.
    pub hfc_suppress_tau_ms: f32,
    pub bass: DetectorParams,
    /// Upper edge of the bass flux band.
    pub bass_freq_hz: f32,
    /// Steepness of the bass band's soft cutoff.
    pub bass_q: f32,
    pub complex: DetectorParams,
    pub mel: DetectorParams,
    /// Triangular mel filterbank size.
    pub mel_bands: usize,
    /// Trajectory-maximum lookback (frames) for the mel flux detector.
    pub mel_traj_frames: usize,
    /// Time constant of the running mean/deviation behind every threshold.
    pub stats_tau_ms: f32,
}

impl Default for DetectorBankParams {
    fn default() -> Self {
        Self {
            drummer: DetectorParams::new(1.8, 0.005, 40),
            drummer_min_rise: 0.002,
            flux: DetectorParams::new(2.0, 0.10, 40),
            flux_bins: SPECTRUM_BINS,
            hfc: DetectorParams::new(2.2, 0.02, 40),
            hfc_weight: 1.0,
            hfc_suppress_tau_ms: 2000.0,
            bass: DetectorParams::new(2.0, 0.05, 40),
            bass_freq_hz: 160.0,
            bass_q: 1.0,
            complex: DetectorParams::new(2.2, 0.20, 40),
            mel: DetectorParams::new(2.0, 0.05, 40),
            mel_bands: 24,
            mel_traj_frames: 3,
            stats_tau_ms: 1000.0,
        }
    }
}

/// Ensemble fusion weights and gating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionParams {
    pub weight_drummer: f32,
    pub weight_flux: f32,
    pub weight_hfc: f32,
    pub weight_bass: f32,
    pub weight_complex: f32,
    pub weight_mel: f32,
    /// Per extra agreeing detector, the combined strength grows by this factor.
    pub agree_k: f32,
    /// Boosted combined strength required to emit an onset.
    pub fusion_threshold: f32,
    /// Combined strength mapped to 1.0 at this value.
    pub fusion_range: f32,
    /// Global refractory between emitted onsets.
    pub fusion_cooldown_ms: u64,
    /// Ambiguous band split: low if the bass strength alone exceeds this.
    pub band_gamma: f32,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            weight_drummer: 1.0,
            weight_flux: 1.0,
            weight_hfc: 0.8,
            weight_bass: 1.0,
            weight_complex: 0.8,
            weight_mel: 1.0,
            agree_k: 0.2,
            fusion_threshold: 0.5,
            fusion_range: 1.5,
            fusion_cooldown_ms: 40,
            band_gamma: 0.3,
        }
    }
}

/// Rhythm tracker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RhythmParams {
    pub bpm_min: f32,
    pub bpm_max: f32,
    /// Cadence of the autocorrelation + hypothesis refresh.
    pub update_interval_ms: u64,
    /// Active hypothesis slots (at most 8).
    pub k_hypotheses: usize,
    /// Center of the log-BPM Gaussian tempo prior.
    pub prior_center_bpm: f32,
    /// Width of the tempo prior in log-BPM units.
    pub prior_width: f32,
    /// Onsets within this distance of a predicted beat count as support.
    pub match_tol_ms: u64,
    /// Two hypotheses within this BPM distance are the same tempo.
    pub bpm_match_tol: f32,
    pub activate_thresh: f32,
    pub deactivate_thresh: f32,
    /// Consecutive supported beats required to lock (or overtake a lock).
    pub min_beats: u32,
    pub conf_inc: f32,
    pub conf_dec: f32,
    /// No onsets for this long drops the tracker to IDLE.
    pub silence_grace_ms: u64,
    /// Hypotheses unsupported for this long halve their score.
    pub silence_half_ms: u64,
    /// Score bias toward the slower hypothesis when merging harmonics.
    pub promote_thresh: f32,
    /// Merge 3:1 harmonic pairs as well as the mandatory 2:1 case.
    pub merge_3to1: bool,
    /// Decay time constant of the onset-envelope buffer.
    pub envelope_tau_ms: f32,
}

impl Default for RhythmParams {
    fn default() -> Self {
        Self {
            bpm_min: 60.0,
            bpm_max: 200.0,
            update_interval_ms: 1000,
            k_hypotheses: 4,
            prior_center_bpm: 120.0,
            prior_width: 0.5,
            match_tol_ms: 70,
            bpm_match_tol: 3.0,
            activate_thresh: 0.6,
            deactivate_thresh: 0.25,
            min_beats: 4,
            conf_inc: 0.1,
            conf_dec: 0.1,
            silence_grace_ms: 2000,
            silence_half_ms: 4000,
            promote_thresh: 0.2,
            merge_3to1: true,
            envelope_tau_ms: 300.0,
        }
    }
}

fn check(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), PipelineError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(PipelineError::ParamOutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}

impl PipelineParams {
    /// Check every field against its declared range.
    ///
    /// Returns the first violation; callers reject the whole bundle on any
    /// error and keep whatever they were running with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let c = &self.capture;
        check("ring_windows", c.ring_windows as f64, 4.0, 64.0)?;
        check("dead_input_ms", c.dead_input_ms as f64, 50.0, 5000.0)?;

        let f = &self.front_end;
        check("hw_target_lo", f.hw_target_lo as f64, 0.01, 0.9)?;
        check("hw_target_hi", f.hw_target_hi as f64, 0.02, 0.99)?;
        if f.hw_target_lo >= f.hw_target_hi {
            return Err(PipelineError::ParamOutOfRange {
                name: "hw_target_lo",
                value: f.hw_target_lo as f64,
                min: 0.01,
                max: f.hw_target_hi as f64,
            });
        }
        check("hw_gain_max", f.hw_gain_max as f64, 1.0, 63.0)?;
        check("hw_hold_windows", f.hw_hold_windows as f64, 1.0, 64.0)?;
        check("hw_step_ms", f.hw_step_ms as f64, 50.0, 2000.0)?;
        check("dc_tau_ms", f.dc_tau_ms as f64, 100.0, 10_000.0)?;
        check("fast_tau_ms", f.fast_tau_ms as f64, 1.0, 100.0)?;
        check("slow_tau_ms", f.slow_tau_ms as f64, 20.0, 2000.0)?;
        check("peak_tau_ms", f.peak_tau_ms as f64, 50.0, 5000.0)?;
        check("valley_tau_ms", f.valley_tau_ms as f64, 50.0, 5000.0)?;
        check("attack_mult", f.attack_mult as f64, 1.0, 4.0)?;
        check("hit_thresh", f.hit_thresh as f64, 1.0, 10.0)?;
        check("cooldown_ms", f.cooldown_ms as f64, 0.0, 1000.0)?;

        let d = &self.detectors;
        for p in [&d.drummer, &d.flux, &d.hfc, &d.bass, &d.complex, &d.mel] {
            check("detector_threshold", p.threshold as f64, 0.5, 8.0)?;
            check("detector_floor", p.floor as f64, 0.0, 100.0)?;
            check("detector_cooldown_ms", p.cooldown_ms as f64, 0.0, 1000.0)?;
        }
        check("drummer_min_rise", d.drummer_min_rise as f64, 0.0, 1.0)?;
        check("flux_bins", d.flux_bins as f64, 8.0, SPECTRUM_BINS as f64)?;
        check("hfc_weight", d.hfc_weight as f64, 0.0, 10.0)?;
        check(
            "hfc_suppress_tau_ms",
            d.hfc_suppress_tau_ms as f64,
            100.0,
            20_000.0,
        )?;
        check("bass_freq_hz", d.bass_freq_hz as f64, 40.0, 500.0)?;
        check("bass_q", d.bass_q as f64, 0.1, 10.0)?;
        check("mel_bands", d.mel_bands as f64, 8.0, 64.0)?;
        check("mel_traj_frames", d.mel_traj_frames as f64, 1.0, 16.0)?;
        check("stats_tau_ms", d.stats_tau_ms as f64, 100.0, 10_000.0)?;

        let u = &self.fusion;
        for w in [
            u.weight_drummer,
            u.weight_flux,
            u.weight_hfc,
            u.weight_bass,
            u.weight_complex,
            u.weight_mel,
        ] {
            check("fusion_weight", w as f64, 0.0, 4.0)?;
        }
        check("agree_k", u.agree_k as f64, 0.0, 2.0)?;
        check("fusion_threshold", u.fusion_threshold as f64, 0.05, 10.0)?;
        check("fusion_range", u.fusion_range as f64, 0.1, 20.0)?;
        check(
            "fusion_cooldown_ms",
            u.fusion_cooldown_ms as f64,
            0.0,
            1000.0,
        )?;
        check("band_gamma", u.band_gamma as f64, 0.0, 1.0)?;

        let r = &self.rhythm;
        check("bpm_min", r.bpm_min as f64, 30.0, 150.0)?;
        check("bpm_max", r.bpm_max as f64, 80.0, 300.0)?;
        if r.bpm_min >= r.bpm_max {
            return Err(PipelineError::ParamOutOfRange {
                name: "bpm_min",
                value: r.bpm_min as f64,
                min: 30.0,
                max: r.bpm_max as f64,
            });
        }
        check(
            "update_interval_ms",
            r.update_interval_ms as f64,
            100.0,
            10_000.0,
        )?;
        check("k_hypotheses", r.k_hypotheses as f64, 1.0, 8.0)?;
        check("prior_center_bpm", r.prior_center_bpm as f64, 40.0, 250.0)?;
        check("prior_width", r.prior_width as f64, 0.05, 4.0)?;
        check("match_tol_ms", r.match_tol_ms as f64, 10.0, 250.0)?;
        check("bpm_match_tol", r.bpm_match_tol as f64, 0.5, 20.0)?;
        check("activate_thresh", r.activate_thresh as f64, 0.05, 2.0)?;
        check("deactivate_thresh", r.deactivate_thresh as f64, 0.0, 1.0)?;
        check("min_beats", r.min_beats as f64, 1.0, 32.0)?;
        check("conf_inc", r.conf_inc as f64, 0.0, 1.0)?;
        check("conf_dec", r.conf_dec as f64, 0.0, 1.0)?;
        check(
            "silence_grace_ms",
            r.silence_grace_ms as f64,
            200.0,
            60_000.0,
        )?;
        check("silence_half_ms", r.silence_half_ms as f64, 200.0, 60_000.0)?;
        check("promote_thresh", r.promote_thresh as f64, 0.0, 2.0)?;
        check("envelope_tau_ms", r.envelope_tau_ms as f64, 50.0, 2000.0)?;

        Ok(())
    }

    /// Load a bundle from a JSON file, falling back to defaults on any error.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<PipelineParams>(&contents) {
                Ok(params) => match params.validate() {
                    Ok(()) => {
                        log::info!("[Config] Loaded parameters from {:?}", path.as_ref());
                        params
                    }
                    Err(err) => {
                        log::warn!(
                            "[Config] {:?} rejected ({}). Using defaults.",
                            path.as_ref(),
                            err
                        );
                        Self::default()
                    }
                },
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }
}

/// Exponential-average coefficient for a given time constant at the hop rate.
///
/// `1 - exp(-step/tau)`, clamped so degenerate time constants still behave.
pub fn ema_alpha(tau_ms: f32, step_ms: f32) -> f32 {
    if tau_ms <= 0.0 {
        return 1.0;
    }
    (1.0 - (-step_ms / tau_ms).exp()).clamp(1e-4, 1.0)
}
