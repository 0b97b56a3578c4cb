// BassBand - spectral flux restricted to the kick-drum band
//
// Whitened flux weighted by a soft low-pass response: unity below the
// configured edge, rolling off above it with a steepness set by bass_q.
// Kicks land here, hi-hats don't, which is what the fusion stage uses to
// split onsets into low/high bands.

use super::{Detector, DetectorKind, DetectorOutput, FrameContext, ThresholdGate};
use crate::config::{DetectorBankParams, SAMPLE_RATE, SPECTRUM_BINS, WINDOW_SIZE};

pub struct BassBandDetector {
    gate: ThresholdGate,
    weights: Vec<f32>,
    weight_sum: f32,
}

fn band_weights(freq_hz: f32, q: f32) -> Vec<f32> {
    let bin_hz = SAMPLE_RATE as f32 / WINDOW_SIZE as f32;
    (0..SPECTRUM_BINS)
        .map(|k| {
            let f = k as f32 * bin_hz;
            1.0 / (1.0 + (f / freq_hz).powf(2.0 * q.max(0.1)))
        })
        .collect()
}

impl BassBandDetector {
    pub fn new(params: &DetectorBankParams) -> Self {
        let weights = band_weights(params.bass_freq_hz, params.bass_q);
        let weight_sum = weights.iter().sum::<f32>().max(1.0);
        Self {
            gate: ThresholdGate::new("bass", params.bass, params.stats_tau_ms),
            weights,
            weight_sum,
        }
    }
}

impl Detector for BassBandDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::BassBand
    }

    fn reset(&mut self) {
        self.gate.reset();
    }

    fn set_params(&mut self, params: &DetectorBankParams) {
        self.gate.set_params(params.bass, params.stats_tau_ms);
        self.weights = band_weights(params.bass_freq_hz, params.bass_q);
        self.weight_sum = self.weights.iter().sum::<f32>().max(1.0);
    }

    fn update(&mut self, ctx: &FrameContext<'_>) -> DetectorOutput {
        let sp = ctx.spectral;
        let mut acc = 0.0;
        for k in 0..SPECTRUM_BINS {
            let flux = (sp.whitened[k] - sp.prev_whitened[k]).max(0.0);
            acc += self.weights[k] * flux;
        }
        let d = acc / self.weight_sum;
        self.gate.evaluate(d, ctx.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HOP_MS;
    use crate::frontend::FrontEndFrame;

    #[test]
    fn test_weights_favor_low_bins() {
        let weights = band_weights(160.0, 1.0);
        // 160 Hz sits at bin ~5; well below it the response is near 1.
        assert!(weights[1] > 0.9);
        assert!(weights[2] > 0.8);
        // Far above the edge the response is negligible.
        assert!(weights[64] < 0.01, "2 kHz weight {} too high", weights[64]);
    }

    #[test]
    fn test_low_flux_fires_high_flux_does_not() {
        let params = DetectorBankParams::default();
        let mut frame = crate::spectral::SpectralFrame::new(params.mel_bands, params.mel_traj_frames);

        fn flat_ctx(frame: &crate::spectral::SpectralFrame, now: u64) -> FrameContext<'_> {
            FrameContext {
                timestamp_ms: now,
                hop_ms: HOP_MS as f32,
                front: FrontEndFrame::default(),
                spectral: frame,
            }
        }

        // Low burst: the same whitened flux placed in bin 3 (94 Hz) vs
        // bin 192 (6 kHz). Only the former carries bass weight.
        let mut det = BassBandDetector::new(&params);
        let mut now = 0;
        for _ in 0..50 {
            det.update(&flat_ctx(&frame, now));
            now += HOP_MS;
        }
        frame.whitened[3] = 8.0;
        let low = det.update(&flat_ctx(&frame, now));
        assert!(low.would_fire, "low-bin flux should fire the bass detector");
        frame.whitened[3] = 0.0;

        let mut det = BassBandDetector::new(&params);
        let mut now = 0;
        for _ in 0..50 {
            det.update(&flat_ctx(&frame, now));
            now += HOP_MS;
        }
        frame.whitened[192] = 8.0;
        let high = det.update(&flat_ctx(&frame, now));
        assert!(!high.would_fire, "high-bin flux must not fire the bass detector");
        assert!(low.strength > high.strength);
    }
}
