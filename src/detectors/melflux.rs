// MelFlux - SuperFlux-style positive flux on mel-band energies
//
// Instead of the plain previous frame, each band subtracts the maximum over
// the last few frames of itself and its two neighbors. The trajectory
// maximum tracks vibrato and slow pitch drift, so only genuinely new energy
// survives the subtraction.

use super::{Detector, DetectorKind, DetectorOutput, FrameContext, ThresholdGate};
use crate::config::DetectorBankParams;

pub struct MelFluxDetector {
    gate: ThresholdGate,
    traj_frames: usize,
}

impl MelFluxDetector {
    pub fn new(params: &DetectorBankParams) -> Self {
        Self {
            gate: ThresholdGate::new("mel", params.mel, params.stats_tau_ms),
            traj_frames: params.mel_traj_frames,
        }
    }
}

impl Detector for MelFluxDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::MelFlux
    }

    fn reset(&mut self) {
        self.gate.reset();
    }

    fn set_params(&mut self, params: &DetectorBankParams) {
        self.gate.set_params(params.mel, params.stats_tau_ms);
        self.traj_frames = params.mel_traj_frames;
    }

    fn update(&mut self, ctx: &FrameContext<'_>) -> DetectorOutput {
        let sp = ctx.spectral;
        let bands = sp.bands();
        let depth = sp.mel_depth().min(self.traj_frames);

        let mut acc = 0.0;
        if depth > 0 {
            for b in 0..bands {
                let lo = b.saturating_sub(1);
                let hi = (b + 1).min(bands - 1);
                let mut reference = 0.0_f32;
                for age in 1..=depth {
                    if let Some(past) = sp.mel_past(age) {
                        for band in lo..=hi {
                            reference = reference.max(past[band]);
                        }
                    }
                }
                acc += (sp.mel[b] - reference).max(0.0);
            }
        }
        let d = acc / bands.max(1) as f32;
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

    fn run_hop(
        analyzer: &mut SpectralAnalyzer,
        det: &mut MelFluxDetector,
        window: &[f32],
        now: u64,
    ) -> DetectorOutput {
        analyzer.process(window);
        det.update(&FrameContext {
            timestamp_ms: now,
            hop_ms: HOP_MS as f32,
            front: FrontEndFrame::default(),
            spectral: analyzer.frame(),
        })
    }

    #[test]
    fn test_new_energy_fires_drifting_tone_does_not() {
        let params = DetectorBankParams::default();
        let mut analyzer = SpectralAnalyzer::new(&params);
        let mut det = MelFluxDetector::new(&params);

        let sine = |freq: f32, offset: usize| -> Vec<f32> {
            (0..WINDOW_SIZE)
                .map(|i| {
                    let t = (offset + i) as f32 / SAMPLE_RATE as f32;
                    0.4 * (2.0 * PI * freq * t).sin()
                })
                .collect()
        };

        // Slowly drifting tone: the +-1-band trajectory max absorbs it.
        let mut now = 0;
        let mut drift_fired = false;
        for hop in 0..200 {
            let freq = 400.0 + hop as f32 * 0.5;
            let out = run_hop(&mut analyzer, &mut det, &sine(freq, hop * HOP_SIZE), now);
            if hop > 30 && out.would_fire {
                drift_fired = true;
            }
            now += HOP_MS;
        }
        assert!(!drift_fired, "slow pitch drift must not fire mel flux");

        // A distant burst is new energy in untouched bands.
        let out = run_hop(&mut analyzer, &mut det, &sine(5000.0, 0), now);
        assert!(out.would_fire, "energy in new bands should fire");
    }
}
