// Ensemble fusion - turns six detector opinions into at most one onset
//
// Weighted sum of strengths, boosted when several detectors agree, gated by
// a global refractory. Multiple detectors qualifying in the same hop
// collapse into the single emitted event; the contributing set is kept as a
// bitset for telemetry and tuning.

use serde::{Deserialize, Serialize};

use crate::config::{FusionParams, DETECTOR_COUNT};
use crate::detectors::{DetectorKind, DetectorOutput};

/// Which half of the spectrum an onset came from, for the LED generators
/// that split kick and hat responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnsetBand {
    Low,
    High,
}

/// A discrete onset. Created here, consumed by the rhythm tracker and the
/// telemetry assembler in the same hop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OnsetEvent {
    pub timestamp_ms: u64,
    /// Fused strength in [0, 1].
    pub strength: f32,
    pub band: OnsetBand,
    /// Bit per contributing detector, in ensemble order.
    pub detectors: u8,
}

/// Stateful fusion stage; owns the global cooldown.
pub struct FusionStage {
    params: FusionParams,
    last_onset_ms: Option<u64>,
}

impl FusionStage {
    pub fn new(params: &FusionParams) -> Self {
        Self {
            params: params.clone(),
            last_onset_ms: None,
        }
    }

    pub fn set_params(&mut self, params: &FusionParams) {
        self.params = params.clone();
    }

    pub fn reset(&mut self) {
        self.last_onset_ms = None;
    }

    fn weight(&self, kind: DetectorKind) -> f32 {
        let p = &self.params;
        match kind {
            DetectorKind::Drummer => p.weight_drummer,
            DetectorKind::SpectralFlux => p.weight_flux,
            DetectorKind::Hfc => p.weight_hfc,
            DetectorKind::BassBand => p.weight_bass,
            DetectorKind::ComplexDomain => p.weight_complex,
            DetectorKind::MelFlux => p.weight_mel,
        }
    }

    /// Combine one hop of detector outputs; returns the onset, if any.
    pub fn update(
        &mut self,
        outputs: &[DetectorOutput; DETECTOR_COUNT],
        timestamp_ms: u64,
    ) -> Option<OnsetEvent> {
        let p = &self.params;

        let mut combined = 0.0;
        let mut agreeing = 0u32;
        let mut contributing = 0u8;
        for kind in DetectorKind::ALL {
            let out = outputs[kind.index()];
            combined += self.weight(kind) * out.strength;
            if out.would_fire {
                agreeing += 1;
                contributing |= kind.bit();
            }
        }

        let boosted = combined * (1.0 + p.agree_k * agreeing.saturating_sub(1) as f32);

        if boosted < p.fusion_threshold {
            return None;
        }
        let cooled = self
            .last_onset_ms
            .map(|t| timestamp_ms.saturating_sub(t) >= p.fusion_cooldown_ms)
            .unwrap_or(true);
        if !cooled {
            return None;
        }
        self.last_onset_ms = Some(timestamp_ms);

        let bass = outputs[DetectorKind::BassBand.index()].strength;
        let hfc = outputs[DetectorKind::Hfc.index()].strength;
        // Clear margins decide directly; otherwise bass strength against
        // gamma breaks the tie.
        let band = if bass > hfc {
            OnsetBand::Low
        } else if hfc > bass {
            OnsetBand::High
        } else if bass > p.band_gamma {
            OnsetBand::Low
        } else {
            OnsetBand::High
        };

        Some(OnsetEvent {
            timestamp_ms,
            strength: (boosted / p.fusion_range).clamp(0.0, 1.0),
            band,
            detectors: contributing,
        })
    }
}
