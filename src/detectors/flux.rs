// SpectralFlux - half-wave rectified flux on the whitened spectrum
//
// Whitening first makes the flux respond to *changes* in spectral shape
// rather than to absolute loudness, which is what keeps this detector
// usable across the AGC's whole gain range.

use super::{Detector, DetectorKind, DetectorOutput, FrameContext, ThresholdGate};
use crate::config::DetectorBankParams;

pub struct SpectralFluxDetector {
    gate: ThresholdGate,
    bins: usize,
}

impl SpectralFluxDetector {
    pub fn new(params: &DetectorBankParams) -> Self {
        Self {
            gate: ThresholdGate::new("flux", params.flux, params.stats_tau_ms),
            bins: params.flux_bins,
        }
    }
}

impl Detector for SpectralFluxDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::SpectralFlux
    }

    fn reset(&mut self) {
        self.gate.reset();
    }

    fn set_params(&mut self, params: &DetectorBankParams) {
        self.gate.set_params(params.flux, params.stats_tau_ms);
        self.bins = params.flux_bins;
    }

    fn update(&mut self, ctx: &FrameContext<'_>) -> DetectorOutput {
        let sp = ctx.spectral;
        let bins = self.bins.min(sp.whitened.len());
        let mut acc = 0.0;
        for k in 0..bins {
            acc += (sp.whitened[k] - sp.prev_whitened[k]).max(0.0);
        }
        let d = acc / bins.max(1) as f32;
        self.gate.evaluate(d, ctx.timestamp_ms)
    }
}
