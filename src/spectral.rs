// Shared spectral analysis stage
//
// The one place in the pipeline that runs an FFT. Per window it produces the
// Hann-windowed magnitude spectrum, a whitened spectrum (each bin divided by
// its slowly-adapting running mean), mel-band energies from a triangular
// filterbank, and bin phases. Previous-frame copies of everything are
// retained so the difference-based detectors never recompute a transform.
//
// Detectors receive a read-only `&SpectralFrame`; all buffers are sized at
// construction and reused.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

use crate::config::{ema_alpha, DetectorBankParams, HOP_MS, SAMPLE_RATE, SPECTRUM_BINS, WINDOW_SIZE};

/// Time constant of the per-bin whitening mean.
const WHITEN_TAU_MS: f32 = 1000.0;

/// Floor for the whitening divisor.
const WHITEN_FLOOR: f32 = 1e-2;

/// Lower edge of the mel filterbank.
const MEL_LO_HZ: f32 = 50.0;

/// Upper edge of the mel filterbank (Nyquist at 16 kHz).
const MEL_HI_HZ: f32 = 8000.0;

/// Spectral outputs for one window, plus what detectors need of the past.
pub struct SpectralFrame {
    pub magnitude: Vec<f32>,
    pub prev_magnitude: Vec<f32>,
    pub whitened: Vec<f32>,
    pub prev_whitened: Vec<f32>,
    pub phase: Vec<f32>,
    pub prev_phase: Vec<f32>,
    pub prev_prev_phase: Vec<f32>,
    pub mel: Vec<f32>,
    /// Ring of the most recent previous mel frames, newest first via `mel_past`.
    mel_history: Vec<Vec<f32>>,
    mel_head: usize,
    mel_filled: usize,
}

impl SpectralFrame {
    pub(crate) fn new(mel_bands: usize, traj_frames: usize) -> Self {
        Self {
            magnitude: vec![0.0; SPECTRUM_BINS],
            prev_magnitude: vec![0.0; SPECTRUM_BINS],
            whitened: vec![0.0; SPECTRUM_BINS],
            prev_whitened: vec![0.0; SPECTRUM_BINS],
            phase: vec![0.0; SPECTRUM_BINS],
            prev_phase: vec![0.0; SPECTRUM_BINS],
            prev_prev_phase: vec![0.0; SPECTRUM_BINS],
            mel: vec![0.0; mel_bands],
            mel_history: vec![vec![0.0; mel_bands]; traj_frames.max(1)],
            mel_head: 0,
            mel_filled: 0,
        }
    }

    /// Mel frame `age` hops before the current one (age 1 = previous frame).
    pub fn mel_past(&self, age: usize) -> Option<&[f32]> {
        if age == 0 || age > self.mel_filled {
            return None;
        }
        let depth = self.mel_history.len();
        let idx = (self.mel_head + depth - age) % depth;
        Some(&self.mel_history[idx])
    }

    /// How many past mel frames are available.
    pub fn mel_depth(&self) -> usize {
        self.mel_filled
    }

    pub fn bands(&self) -> usize {
        self.mel.len()
    }
}

/// Triangular mel filterbank as sparse per-band (bin, weight) lists.
fn build_mel_filters(bands: usize) -> Vec<Vec<(usize, f32)>> {
    let mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let hz = |m: f32| 700.0 * (10.0_f32.powf(m / 2595.0) - 1.0);

    let lo = mel(MEL_LO_HZ);
    let hi = mel(MEL_HI_HZ);
    let step = (hi - lo) / (bands + 1) as f32;
    let edges: Vec<f32> = (0..bands + 2).map(|i| hz(lo + step * i as f32)).collect();

    let bin_hz = SAMPLE_RATE as f32 / WINDOW_SIZE as f32;
    let mut filters = Vec::with_capacity(bands);
    for b in 0..bands {
        let (f_lo, f_c, f_hi) = (edges[b], edges[b + 1], edges[b + 2]);
        let mut taps = Vec::new();
        for k in 0..SPECTRUM_BINS {
            let f = k as f32 * bin_hz;
            let w = if f <= f_lo || f >= f_hi {
                0.0
            } else if f <= f_c {
                (f - f_lo) / (f_c - f_lo)
            } else {
                (f_hi - f) / (f_hi - f_c)
            };
            if w > 0.0 {
                taps.push((k, w));
            }
        }
        filters.push(taps);
    }
    filters
}

/// The shared FFT stage. Owns its scratch and all retained frames.
pub struct SpectralAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window_fn: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    whiten_mean: Vec<f32>,
    whiten_alpha: f32,
    whiten_primed: bool,
    mel_filters: Vec<Vec<(usize, f32)>>,
    frame: SpectralFrame,
}

impl SpectralAnalyzer {
    pub fn new(params: &DetectorBankParams) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(WINDOW_SIZE);

        // Hann window, same form the rest of the firmware uses.
        let window_fn = (0..WINDOW_SIZE)
            .map(|i| 0.5 * (1.0 - ((2.0 * PI * i as f32) / (WINDOW_SIZE as f32 - 1.0)).cos()))
            .collect();

        Self {
            fft,
            window_fn,
            scratch: vec![Complex::new(0.0, 0.0); WINDOW_SIZE],
            whiten_mean: vec![0.0; SPECTRUM_BINS],
            whiten_alpha: ema_alpha(WHITEN_TAU_MS, HOP_MS as f32),
            whiten_primed: false,
            mel_filters: build_mel_filters(params.mel_bands),
            frame: SpectralFrame::new(params.mel_bands, params.mel_traj_frames),
        }
    }

    /// Adopt new parameters; the filterbank and history are rebuilt only if
    /// their geometry actually changed.
    pub fn set_params(&mut self, params: &DetectorBankParams) {
        if params.mel_bands != self.frame.bands()
            || params.mel_traj_frames.max(1) != self.frame.mel_history.len()
        {
            self.mel_filters = build_mel_filters(params.mel_bands);
            self.frame = SpectralFrame::new(params.mel_bands, params.mel_traj_frames);
        }
    }

    pub fn reset(&mut self) {
        let bands = self.frame.bands();
        let depth = self.frame.mel_history.len();
        self.frame = SpectralFrame::new(bands, depth);
        self.whiten_mean.iter_mut().for_each(|m| *m = 0.0);
        self.whiten_primed = false;
    }

    /// Analyze one full window (all SPECTRUM_BINS outputs refer to it).
    pub fn process(&mut self, window: &[f32]) {
        debug_assert_eq!(window.len(), WINDOW_SIZE);
        let f = &mut self.frame;

        // Retire the current frame into the "previous" slots.
        std::mem::swap(&mut f.prev_magnitude, &mut f.magnitude);
        std::mem::swap(&mut f.prev_whitened, &mut f.whitened);
        std::mem::swap(&mut f.prev_prev_phase, &mut f.prev_phase);
        std::mem::swap(&mut f.prev_phase, &mut f.phase);
        // prev_phase now holds the last frame, phase holds the frame before
        // last and is about to be overwritten.
        f.mel_history[f.mel_head].copy_from_slice(&f.mel);
        f.mel_head = (f.mel_head + 1) % f.mel_history.len();
        f.mel_filled = (f.mel_filled + 1).min(f.mel_history.len());

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            *slot = Complex::new(window[i] * self.window_fn[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        for k in 0..SPECTRUM_BINS {
            let c = self.scratch[k];
            f.magnitude[k] = c.norm();
            f.phase[k] = c.arg();
        }

        if self.whiten_primed {
            for k in 0..SPECTRUM_BINS {
                self.whiten_mean[k] += self.whiten_alpha * (f.magnitude[k] - self.whiten_mean[k]);
                f.whitened[k] = f.magnitude[k] / self.whiten_mean[k].max(WHITEN_FLOOR);
            }
        } else {
            // Seed the running means so the first frame doesn't explode.
            for k in 0..SPECTRUM_BINS {
                self.whiten_mean[k] = f.magnitude[k];
                f.whitened[k] = if f.magnitude[k] > WHITEN_FLOOR { 1.0 } else { 0.0 };
            }
            self.whiten_primed = true;
        }

        for (b, taps) in self.mel_filters.iter().enumerate() {
            let mut acc = 0.0;
            for &(k, w) in taps {
                acc += w * f.magnitude[k];
            }
            f.mel[b] = acc;
        }
    }

    pub fn frame(&self) -> &SpectralFrame {
        &self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_window(freq: f32, amp: f32, offset: usize) -> Vec<f32> {
        (0..WINDOW_SIZE)
            .map(|i| {
                let t = (offset + i) as f32 / SAMPLE_RATE as f32;
                amp * (2.0 * PI * freq * t).sin()
            })
            .collect()
    }

    #[test]
    fn test_magnitude_peak_at_sine_bin() {
        let mut analyzer = SpectralAnalyzer::new(&DetectorBankParams::default());
        analyzer.process(&sine_window(1000.0, 0.5, 0));

        let frame = analyzer.frame();
        let peak_bin = frame
            .magnitude
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(k, _)| k)
            .unwrap();
        // 1 kHz at 31.25 Hz per bin is bin 32.
        assert!(
            (31..=33).contains(&peak_bin),
            "expected peak near bin 32, got {}",
            peak_bin
        );
    }

    #[test]
    fn test_whitening_flattens_steady_tone() {
        let mut analyzer = SpectralAnalyzer::new(&DetectorBankParams::default());
        for hop in 0..120 {
            analyzer.process(&sine_window(1000.0, 0.5, hop * 256));
        }
        let frame = analyzer.frame();
        // After ~2 s the running mean has converged on the tone: the
        // whitened peak bin should sit near 1, not near the raw magnitude.
        let peak = frame.whitened[32];
        assert!(peak < 3.0, "whitened peak {} not flattened", peak);
        assert!(frame.magnitude[32] > 10.0, "raw magnitude should be large");
    }

    #[test]
    fn test_mel_energy_lands_in_right_band() {
        let mut analyzer = SpectralAnalyzer::new(&DetectorBankParams::default());
        analyzer.process(&sine_window(100.0, 0.5, 0));
        let low_frame_band = argmax(&analyzer.frame().mel);

        analyzer.reset();
        analyzer.process(&sine_window(4000.0, 0.5, 0));
        let high_frame_band = argmax(&analyzer.frame().mel);

        assert!(
            low_frame_band < high_frame_band,
            "100 Hz should excite a lower band than 4 kHz ({} vs {})",
            low_frame_band,
            high_frame_band
        );
    }

    #[test]
    fn test_previous_frames_rotate() {
        let mut analyzer = SpectralAnalyzer::new(&DetectorBankParams::default());
        analyzer.process(&sine_window(1000.0, 0.5, 0));
        let first_mag: Vec<f32> = analyzer.frame().magnitude.clone();

        analyzer.process(&sine_window(2000.0, 0.5, 256));
        let frame = analyzer.frame();
        assert_eq!(frame.prev_magnitude, first_mag);
        assert_ne!(frame.magnitude, first_mag);
    }

    #[test]
    fn test_mel_history_ages() {
        let mut analyzer = SpectralAnalyzer::new(&DetectorBankParams::default());
        assert!(analyzer.frame().mel_past(1).is_none());

        analyzer.process(&sine_window(500.0, 0.5, 0));
        let first_mel = analyzer.frame().mel.clone();

        analyzer.process(&sine_window(500.0, 0.5, 256));
        let past = analyzer.frame().mel_past(1).expect("one frame of history");
        assert_eq!(past, first_mel.as_slice());
    }

    #[test]
    fn test_filterbank_covers_all_bands() {
        let filters = build_mel_filters(24);
        assert_eq!(filters.len(), 24);
        for (b, taps) in filters.iter().enumerate() {
            assert!(!taps.is_empty(), "band {} has no taps", b);
        }
    }

    fn argmax(values: &[f32]) -> usize {
        values
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(i, _)| i)
            .unwrap()
    }
}
