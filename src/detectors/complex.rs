// ComplexDomain - phase-aware onset detection
//
// For every bin, predict the current complex value from the previous two
// frames under a constant-phase-advance model and sum the magnitudes of the
// prediction residuals. Catches soft onsets that barely move the magnitude
// spectrum but scramble the phase, at the cost of also reacting to vibrato;
// the ensemble weighting keeps that in check.

use super::{Detector, DetectorKind, DetectorOutput, FrameContext, ThresholdGate};
use crate::config::{DetectorBankParams, SPECTRUM_BINS};

pub struct ComplexDomainDetector {
    gate: ThresholdGate,
}

impl ComplexDomainDetector {
    pub fn new(params: &DetectorBankParams) -> Self {
        Self {
            gate: ThresholdGate::new("complex", params.complex, params.stats_tau_ms),
        }
    }
}

impl Detector for ComplexDomainDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::ComplexDomain
    }

    fn reset(&mut self) {
        self.gate.reset();
    }

    fn set_params(&mut self, params: &DetectorBankParams) {
        self.gate.set_params(params.complex, params.stats_tau_ms);
    }

    fn update(&mut self, ctx: &FrameContext<'_>) -> DetectorOutput {
        let sp = ctx.spectral;
        let mut acc = 0.0;
        for k in 0..SPECTRUM_BINS {
            // Expected phase continues the previous frame-to-frame advance.
            let predicted_phase = 2.0 * sp.prev_phase[k] - sp.prev_prev_phase[k];
            let mag = sp.magnitude[k];
            let expected = sp.prev_magnitude[k];
            let dphi = sp.phase[k] - predicted_phase;
            // |X - X_pred| via the law of cosines; both share the bin.
            let residual = (mag * mag + expected * expected
                - 2.0 * mag * expected * dphi.cos())
            .max(0.0)
            .sqrt();
            acc += residual;
        }
        let d = acc / SPECTRUM_BINS as f32;
        self.gate.evaluate(d, ctx.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HOP_MS, HOP_SIZE, SAMPLE_RATE, WINDOW_SIZE};
    use crate::frontend::FrontEndFrame;
    use crate::spectral::SpectralAnalyzer;
    use std::f32::consts::PI;

    #[test]
    fn test_steady_tone_quiet_phase_jump_fires() {
        let params = DetectorBankParams::default();
        let mut analyzer = SpectralAnalyzer::new(&params);
        let mut det = ComplexDomainDetector::new(&params);

        // Pick a frequency exactly on a bin so the steady tone's phase
        // advance is truly constant per hop.
        let freq = 1000.0;
        let sine = |offset: usize, phase: f32| -> Vec<f32> {
            (0..WINDOW_SIZE)
                .map(|i| {
                    let t = (offset + i) as f32 / SAMPLE_RATE as f32;
                    0.4 * (2.0 * PI * freq * t + phase).sin()
                })
                .collect()
        };

        let mut now = 0;
        let mut steady_fired = false;
        for hop in 0..120 {
            analyzer.process(&sine(hop * HOP_SIZE, 0.0));
            let out = det.update(&FrameContext {
                timestamp_ms: now,
                hop_ms: HOP_MS as f32,
                front: FrontEndFrame::default(),
                spectral: analyzer.frame(),
            });
            if hop > 30 && out.would_fire {
                steady_fired = true;
            }
            now += HOP_MS;
        }
        assert!(!steady_fired, "steady tone must not fire the complex detector");

        // Same tone, discontinuous phase: a "new note" event.
        analyzer.process(&sine(0, PI * 0.9));
        let out = det.update(&FrameContext {
            timestamp_ms: now,
            hop_ms: HOP_MS as f32,
            front: FrontEndFrame::default(),
            spectral: analyzer.frame(),
        });
        assert!(out.would_fire, "phase discontinuity should fire");
    }
}
