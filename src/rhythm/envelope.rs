// Onset envelope and autocorrelation
//
// Every hop pushes one sample into a decaying spike train (an onset adds
// its strength on top of the exponential tail). Tempo evidence comes from
// the normalized autocorrelation of that train over the lag range the BPM
// bounds allow, with quadratic interpolation around each peak so the lag
// estimate isn't stuck on the 16 ms hop grid.

use crate::config::{ema_alpha, HOP_MS};

/// Capacity of the envelope ring in hops (~8.2 s at 16 ms per hop).
pub const ENVELOPE_LEN: usize = 512;

pub struct OnsetEnvelope {
    buf: Vec<f32>,
    head: usize,
    filled: usize,
    decay: f32,
    value: f32,
}

impl OnsetEnvelope {
    pub fn new(tau_ms: f32) -> Self {
        Self {
            buf: vec![0.0; ENVELOPE_LEN],
            head: 0,
            filled: 0,
            decay: 1.0 - ema_alpha(tau_ms, HOP_MS as f32),
            value: 0.0,
        }
    }

    pub fn set_tau(&mut self, tau_ms: f32) {
        self.decay = 1.0 - ema_alpha(tau_ms, HOP_MS as f32);
    }

    pub fn reset(&mut self) {
        self.buf.iter_mut().for_each(|v| *v = 0.0);
        self.head = 0;
        self.filled = 0;
        self.value = 0.0;
    }

    /// Advance one hop; `spike` is the onset strength (0 when none).
    pub fn push(&mut self, spike: f32) {
        self.value = self.value * self.decay + spike;
        self.buf[self.head] = self.value;
        self.head = (self.head + 1) % ENVELOPE_LEN;
        self.filled = (self.filled + 1).min(ENVELOPE_LEN);
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Copy the ring into `out` oldest-first.
    pub fn linearize(&self, out: &mut Vec<f32>) {
        out.clear();
        let start = (self.head + ENVELOPE_LEN - self.filled) % ENVELOPE_LEN;
        for i in 0..self.filled {
            out.push(self.buf[(start + i) % ENVELOPE_LEN]);
        }
    }
}

/// One interpolated autocorrelation peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcfPeak {
    /// Lag in (fractional) hops.
    pub lag_hops: f32,
    /// Normalized height in [0, 1].
    pub height: f32,
}

/// Normalized autocorrelation of `env` for lags `lag_min..=lag_max`.
///
/// `out[i]` holds r(lag_min + i) / r(0). Lags the buffer cannot support
/// are written as zero.
pub fn autocorrelate(env: &[f32], lag_min: usize, lag_max: usize, out: &mut Vec<f32>) {
    out.clear();
    let n = env.len();
    let energy: f32 = env.iter().map(|v| v * v).sum();
    if energy <= f32::EPSILON || lag_min > lag_max {
        out.resize(lag_max.saturating_sub(lag_min) + 1, 0.0);
        return;
    }
    for lag in lag_min..=lag_max {
        if lag >= n {
            out.push(0.0);
            continue;
        }
        let mut acc = 0.0;
        for i in lag..n {
            acc += env[i] * env[i - lag];
        }
        out.push(acc / energy);
    }
}

/// Local maxima of the ACF above `min_height`, strongest first, at most
/// `max_peaks`, with quadratic interpolation of the lag.
pub fn pick_peaks(
    acf: &[f32],
    lag_min: usize,
    min_height: f32,
    max_peaks: usize,
    out: &mut Vec<AcfPeak>,
) {
    out.clear();
    if acf.len() < 3 {
        return;
    }
    for i in 1..acf.len() - 1 {
        let (left, center, right) = (acf[i - 1], acf[i], acf[i + 1]);
        if center > left && center >= right && center >= min_height {
            let denom = left - 2.0 * center + right;
            let delta = if denom.abs() > f32::EPSILON {
                (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
            } else {
                0.0
            };
            let height = center - 0.25 * (left - right) * delta;
            out.push(AcfPeak {
                lag_hops: (lag_min + i) as f32 + delta,
                height: height.clamp(0.0, 1.0),
            });
        }
    }
    out.sort_by(|a, b| b.height.partial_cmp(&a.height).unwrap_or(std::cmp::Ordering::Equal));
    out.truncate(max_peaks);
}
