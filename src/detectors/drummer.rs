// Drummer - full-band amplitude transient detector
//
// The detection function is the fast envelope's excess over the slow one,
// gated by a minimum rise rate so slow swells don't count. This is the
// cheapest detector in the ensemble and the one that survives when the
// spectral stages have nothing to bite on (e.g. broadband thumps).

use super::{Detector, DetectorKind, DetectorOutput, FrameContext, ThresholdGate};
use crate::config::DetectorBankParams;

pub struct DrummerDetector {
    gate: ThresholdGate,
    min_rise: f32,
}

impl DrummerDetector {
    pub fn new(params: &DetectorBankParams) -> Self {
        Self {
            gate: ThresholdGate::new("drummer", params.drummer, params.stats_tau_ms),
            min_rise: params.drummer_min_rise,
        }
    }
}

impl Detector for DrummerDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Drummer
    }

    fn reset(&mut self) {
        self.gate.reset();
    }

    fn set_params(&mut self, params: &DetectorBankParams) {
        self.gate.set_params(params.drummer, params.stats_tau_ms);
        self.min_rise = params.drummer_min_rise;
    }

    fn update(&mut self, ctx: &FrameContext<'_>) -> DetectorOutput {
        let front = &ctx.front;
        let excess = (front.fast_env - front.slow_env).max(0.0);
        let rise = (front.fast_env - front.prev_fast_env) / ctx.hop_ms.max(1.0);
        let d = if rise >= self.min_rise { excess } else { 0.0 };
        self.gate.evaluate(d, ctx.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HOP_MS;
    use crate::frontend::FrontEndFrame;
    use crate::spectral::SpectralAnalyzer;

    fn ctx_with_front(
        analyzer: &SpectralAnalyzer,
        front: FrontEndFrame,
        timestamp_ms: u64,
    ) -> FrameContext<'_> {
        FrameContext {
            timestamp_ms,
            hop_ms: HOP_MS as f32,
            front,
            spectral: analyzer.frame(),
        }
    }

    #[test]
    fn test_fires_on_fast_rise_only() {
        let params = DetectorBankParams::default();
        let analyzer = SpectralAnalyzer::new(&params);
        let mut det = DrummerDetector::new(&params);

        // Quiet baseline long enough to clear warmup.
        let mut now = 0;
        for _ in 0..100 {
            let front = FrontEndFrame {
                fast_env: 0.02,
                prev_fast_env: 0.02,
                slow_env: 0.02,
                ..Default::default()
            };
            det.update(&ctx_with_front(&analyzer, front, now));
            now += HOP_MS;
        }

        // A sharp jump: large excess and large rise rate.
        let hit = FrontEndFrame {
            fast_env: 0.5,
            prev_fast_env: 0.02,
            slow_env: 0.03,
            ..Default::default()
        };
        let out = det.update(&ctx_with_front(&analyzer, hit, now));
        assert!(out.would_fire, "sharp envelope jump should fire");

        // The same excess arriving as a slow swell is rejected by the rise gate.
        det.reset();
        now = 0;
        for _ in 0..100 {
            let front = FrontEndFrame {
                fast_env: 0.02,
                prev_fast_env: 0.02,
                slow_env: 0.02,
                ..Default::default()
            };
            det.update(&ctx_with_front(&analyzer, front, now));
            now += HOP_MS;
        }
        let swell = FrontEndFrame {
            fast_env: 0.5,
            prev_fast_env: 0.499,
            slow_env: 0.03,
            ..Default::default()
        };
        let out = det.update(&ctx_with_front(&analyzer, swell, now));
        assert!(!out.would_fire, "slow swells must not fire the drummer");
    }
}
