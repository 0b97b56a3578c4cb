// HFC - high-frequency content with a sustained-signal suppressor
//
// Masri's weighted sum (bin index times magnitude) reacts strongly to
// cymbal/snare-like energy. A slow running mean of the raw value is
// subtracted first so sustained bright material (pads, hiss) stops
// contributing after a couple of seconds and only fresh high-band energy
// remains.

use super::{Detector, DetectorKind, DetectorOutput, FrameContext, ThresholdGate};
use crate::config::{ema_alpha, DetectorBankParams, HOP_MS};

pub struct HfcDetector {
    gate: ThresholdGate,
    weight: f32,
    suppress_alpha: f32,
    suppress_mean: f32,
}

impl HfcDetector {
    pub fn new(params: &DetectorBankParams) -> Self {
        Self {
            gate: ThresholdGate::new("hfc", params.hfc, params.stats_tau_ms),
            weight: params.hfc_weight,
            suppress_alpha: ema_alpha(params.hfc_suppress_tau_ms, HOP_MS as f32),
            suppress_mean: 0.0,
        }
    }
}

impl Detector for HfcDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Hfc
    }

    fn reset(&mut self) {
        self.gate.reset();
        self.suppress_mean = 0.0;
    }

    fn set_params(&mut self, params: &DetectorBankParams) {
        self.gate.set_params(params.hfc, params.stats_tau_ms);
        self.weight = params.hfc_weight;
        self.suppress_alpha = ema_alpha(params.hfc_suppress_tau_ms, HOP_MS as f32);
    }

    fn update(&mut self, ctx: &FrameContext<'_>) -> DetectorOutput {
        let sp = ctx.spectral;
        let bins = sp.magnitude.len();
        let mut acc = 0.0;
        for (k, &mag) in sp.magnitude.iter().enumerate() {
            acc += k as f32 * mag;
        }
        let raw = self.weight * acc / (bins * bins) as f32;

        self.suppress_mean += self.suppress_alpha * (raw - self.suppress_mean);
        let d = (raw - self.suppress_mean).max(0.0);
        self.gate.evaluate(d, ctx.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HOP_SIZE, SAMPLE_RATE, WINDOW_SIZE};
    use crate::frontend::FrontEndFrame;
    use crate::spectral::SpectralAnalyzer;
    use std::f32::consts::PI;

    #[test]
    fn test_bright_burst_fires_after_quiet() {
        let params = DetectorBankParams::default();
        let mut analyzer = SpectralAnalyzer::new(&params);
        let mut det = HfcDetector::new(&params);

        let mut now = 0;
        let quiet = vec![0.001_f32; WINDOW_SIZE];
        for _ in 0..100 {
            analyzer.process(&quiet);
            det.update(&FrameContext {
                timestamp_ms: now,
                hop_ms: HOP_MS as f32,
                front: FrontEndFrame::default(),
                spectral: analyzer.frame(),
            });
            now += HOP_MS;
        }

        // A bright 5 kHz burst.
        let burst: Vec<f32> = (0..WINDOW_SIZE)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                0.5 * (2.0 * PI * 5000.0 * t).sin()
            })
            .collect();
        analyzer.process(&burst);
        let out = det.update(&FrameContext {
            timestamp_ms: now,
            hop_ms: HOP_MS as f32,
            front: FrontEndFrame::default(),
            spectral: analyzer.frame(),
        });
        assert!(out.would_fire, "bright burst after quiet must fire HFC");
    }

    #[test]
    fn test_sustained_brightness_is_suppressed() {
        let params = DetectorBankParams::default();
        let mut analyzer = SpectralAnalyzer::new(&params);
        let mut det = HfcDetector::new(&params);

        let tone = |offset: usize| -> Vec<f32> {
            (0..WINDOW_SIZE)
                .map(|i| {
                    let t = (offset + i) as f32 / SAMPLE_RATE as f32;
                    0.5 * (2.0 * PI * 5000.0 * t).sin()
                })
                .collect()
        };

        // Several seconds of constant bright content: the suppressor eats
        // the raw HFC and the gate's baseline adapts. No late fires.
        let mut now = 0;
        let mut late_fires = 0;
        for hop in 0..400 {
            analyzer.process(&tone(hop * HOP_SIZE));
            let out = det.update(&FrameContext {
                timestamp_ms: now,
                hop_ms: HOP_MS as f32,
                front: FrontEndFrame::default(),
                spectral: analyzer.frame(),
            });
            if hop > 100 && out.would_fire {
                late_fires += 1;
            }
            now += HOP_MS;
        }
        assert_eq!(late_fires, 0, "sustained brightness must stop firing");
    }
}
