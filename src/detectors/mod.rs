// Detector ensemble - six complementary onset detection functions
//
// Every detector maps the current hop context to a scalar detection function
// and runs it through the same adaptive gate: a running mean and
// mean-absolute-deviation (EMA over ~1 s), a z-score threshold, an absolute
// floor, and a per-detector refractory. None of them decides an onset alone;
// fusion does.
//
// The bank calls detectors in a fixed order so their outputs line up with
// the fusion weights and the telemetry strength array.

mod bass;
mod complex;
mod drummer;
mod flux;
mod hfc;
mod melflux;

pub use bass::BassBandDetector;
pub use complex::ComplexDomainDetector;
pub use drummer::DrummerDetector;
pub use flux::SpectralFluxDetector;
pub use hfc::HfcDetector;
pub use melflux::MelFluxDetector;

use crate::config::{ema_alpha, DetectorBankParams, DetectorParams, DETECTOR_COUNT, HOP_MS};
use crate::frontend::FrontEndFrame;
use crate::spectral::SpectralFrame;

/// Everything a detector may read for one hop. Front-end values arrive by
/// copy; spectral outputs by shared reference into the FFT stage.
pub struct FrameContext<'a> {
    pub timestamp_ms: u64,
    pub hop_ms: f32,
    pub front: FrontEndFrame,
    pub spectral: &'a SpectralFrame,
}

/// One detector's verdict for one hop.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DetectorOutput {
    /// Normalized strength in [0, 1]; 0 at the firing boundary.
    pub strength: f32,
    /// True when this detector alone would call an onset here.
    pub would_fire: bool,
}

/// Identifies a detector in the fixed ensemble order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Drummer = 0,
    SpectralFlux = 1,
    Hfc = 2,
    BassBand = 3,
    ComplexDomain = 4,
    MelFlux = 5,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; DETECTOR_COUNT] = [
        DetectorKind::Drummer,
        DetectorKind::SpectralFlux,
        DetectorKind::Hfc,
        DetectorKind::BassBand,
        DetectorKind::ComplexDomain,
        DetectorKind::MelFlux,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit for the contributing-detectors set on onset events.
    pub fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn label(self) -> &'static str {
        match self {
            DetectorKind::Drummer => "drummer",
            DetectorKind::SpectralFlux => "flux",
            DetectorKind::Hfc => "hfc",
            DetectorKind::BassBand => "bass",
            DetectorKind::ComplexDomain => "complex",
            DetectorKind::MelFlux => "mel",
        }
    }
}

/// Contract shared by all six detection functions.
pub trait Detector {
    fn kind(&self) -> DetectorKind;
    fn reset(&mut self);
    fn set_params(&mut self, params: &DetectorBankParams);
    fn update(&mut self, ctx: &FrameContext<'_>) -> DetectorOutput;
}

/// Hops of statistics to accumulate before a detector may fire (~190 ms).
const WARMUP_HOPS: u32 = 12;

const EPS: f32 = 1e-6;

/// Adaptive threshold shared by every detector.
///
/// Keeps an EMA estimate of the detection function's local mean and
/// mean-absolute-deviation, fires on the z-score, and clamps strength so it
/// saturates at roughly three times the firing threshold.
pub struct ThresholdGate {
    params: DetectorParams,
    label: &'static str,
    alpha: f32,
    mean: f32,
    dev: f32,
    primed: u32,
    last_fire_ms: Option<u64>,
}

impl ThresholdGate {
    pub fn new(label: &'static str, params: DetectorParams, stats_tau_ms: f32) -> Self {
        Self {
            params,
            label,
            alpha: ema_alpha(stats_tau_ms, HOP_MS as f32),
            mean: 0.0,
            dev: 0.0,
            primed: 0,
            last_fire_ms: None,
        }
    }

    /// Swap in new tuning without touching the running statistics.
    pub fn set_params(&mut self, params: DetectorParams, stats_tau_ms: f32) {
        self.params = params;
        self.alpha = ema_alpha(stats_tau_ms, HOP_MS as f32);
    }

    pub fn reset(&mut self) {
        self.mean = 0.0;
        self.dev = 0.0;
        self.primed = 0;
        self.last_fire_ms = None;
    }

    /// Evaluate one detection-function sample.
    pub fn evaluate(&mut self, d: f32, now_ms: u64) -> DetectorOutput {
        if !d.is_finite() {
            // Numeric fault: zero this hop and start statistics over.
            log::warn!("[Detectors] {} produced a non-finite value, resetting", self.label);
            self.reset();
            return DetectorOutput::default();
        }

        if self.primed == 0 {
            // Seed the statistics so a steady signal reads as z = 0 instead
            // of ramping in from an all-zero mean.
            self.mean = d;
            self.dev = d.abs() * 0.5 + EPS;
        }

        // The deviation floor scales with the mean: on a near-constant
        // baseline the raw deviation collapses and ordinary jitter would
        // read as an enormous z-score.
        let denom = self.dev.max(0.1 * self.mean.abs()).max(EPS);
        let z = (d - self.mean) / denom;

        self.mean += self.alpha * (d - self.mean);
        self.dev += self.alpha * ((d - self.mean).abs() - self.dev);
        if self.primed <= WARMUP_HOPS {
            self.primed += 1;
            return DetectorOutput::default();
        }

        let p = &self.params;
        let over_floor = d > p.floor;
        let strength = if over_floor {
            ((z - p.threshold) / (2.0 * p.threshold)).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let cooled = self
            .last_fire_ms
            .map(|t| now_ms.saturating_sub(t) >= p.cooldown_ms)
            .unwrap_or(true);
        let would_fire = z > p.threshold && over_floor && cooled;
        if would_fire {
            self.last_fire_ms = Some(now_ms);
        }

        DetectorOutput {
            strength,
            would_fire,
        }
    }
}

/// The fixed-order bank of trait objects the pipeline advances every hop.
pub struct DetectorBank {
    detectors: Vec<Box<dyn Detector + Send>>,
    outputs: [DetectorOutput; DETECTOR_COUNT],
}

impl DetectorBank {
    pub fn new(params: &DetectorBankParams) -> Self {
        let detectors: Vec<Box<dyn Detector + Send>> = vec![
            Box::new(DrummerDetector::new(params)),
            Box::new(SpectralFluxDetector::new(params)),
            Box::new(HfcDetector::new(params)),
            Box::new(BassBandDetector::new(params)),
            Box::new(ComplexDomainDetector::new(params)),
            Box::new(MelFluxDetector::new(params)),
        ];
        Self {
            detectors,
            outputs: [DetectorOutput::default(); DETECTOR_COUNT],
        }
    }

    pub fn set_params(&mut self, params: &DetectorBankParams) {
        for det in &mut self.detectors {
            det.set_params(params);
        }
    }

    pub fn reset(&mut self) {
        for det in &mut self.detectors {
            det.reset();
        }
        self.outputs = [DetectorOutput::default(); DETECTOR_COUNT];
    }

    /// Run every detector for the hop, in ensemble order.
    pub fn update(&mut self, ctx: &FrameContext<'_>) -> &[DetectorOutput; DETECTOR_COUNT] {
        for (i, det) in self.detectors.iter_mut().enumerate() {
            self.outputs[i] = det.update(ctx);
        }
        &self.outputs
    }

    /// Outputs from the most recent hop.
    pub fn outputs(&self) -> &[DetectorOutput; DETECTOR_COUNT] {
        &self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ThresholdGate {
        ThresholdGate::new(
            "test",
            DetectorParams {
                threshold: 2.0,
                floor: 0.01,
                cooldown_ms: 40,
            },
            1000.0,
        )
    }

    fn warm_up(gate: &mut ThresholdGate, value: f32, hops: u64) -> u64 {
        for i in 0..hops {
            gate.evaluate(value, i * HOP_MS);
        }
        hops * HOP_MS
    }

    #[test]
    fn test_gate_quiet_baseline_never_fires() {
        let mut g = gate();
        for i in 0..200 {
            let out = g.evaluate(0.05, i * HOP_MS);
            assert!(!out.would_fire);
            assert_eq!(out.strength, 0.0);
        }
    }

    #[test]
    fn test_gate_fires_on_spike_over_baseline() {
        let mut g = gate();
        let now = warm_up(&mut g, 0.05, 100);
        let out = g.evaluate(2.0, now);
        assert!(out.would_fire, "40x jump over baseline must fire");
        assert!(out.strength > 0.0);
        assert!(out.strength <= 1.0);
    }

    #[test]
    fn test_gate_cooldown_blocks_refire() {
        let mut g = gate();
        let now = warm_up(&mut g, 0.05, 100);
        assert!(g.evaluate(2.0, now).would_fire);
        let again = g.evaluate(2.0, now + HOP_MS);
        assert!(!again.would_fire, "16 ms later is inside the 40 ms refractory");
    }

    #[test]
    fn test_gate_floor_blocks_tiny_signals() {
        let mut g = gate();
        // Baseline of exact zeros, then a spike that is huge in z terms but
        // below the absolute floor.
        let now = warm_up(&mut g, 0.0, 100);
        let out = g.evaluate(0.005, now);
        assert!(!out.would_fire, "below-floor values must not fire");
    }

    #[test]
    fn test_gate_nan_resets_statistics() {
        let mut g = gate();
        let now = warm_up(&mut g, 0.05, 100);
        let out = g.evaluate(f32::NAN, now);
        assert_eq!(out, DetectorOutput::default());
        // Statistics restarted: the next samples are inside warmup again.
        let out = g.evaluate(5.0, now + HOP_MS);
        assert!(!out.would_fire);
    }

    #[test]
    fn test_gate_warmup_suppresses_first_hops() {
        let mut g = gate();
        for i in 0..u64::from(WARMUP_HOPS) {
            let out = g.evaluate(10.0, i * HOP_MS);
            assert!(!out.would_fire, "warmup hop {} must not fire", i);
        }
    }

    #[test]
    fn test_kind_bits_are_distinct() {
        let mut seen = 0u8;
        for kind in DetectorKind::ALL {
            assert_eq!(seen & kind.bit(), 0);
            seen |= kind.bit();
        }
        assert_eq!(seen.count_ones() as usize, DETECTOR_COUNT);
    }
}
