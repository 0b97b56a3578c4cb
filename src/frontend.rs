// Adaptive microphone front-end
//
// Produces a level signal that downstream generators can consume regardless
// of how loud the room is: DC removal, fast/slow envelopes, decaying
// peak/valley trackers, a hardware AGC that steps the amplifier gain, and
// the peak/valley-normalized level mapping. Also raises the coarse
// transient flag used by the drummer detector and the LED "hit" path.
//
// Invariants kept per window: peak >= valley >= 0, level in [0, 1], gain
// index in [0, hw_gain_max], at most one gain step per hw_step_ms.

use crate::config::{ema_alpha, FrontEndParams, HOP_MS};

/// Raw abs-peak below which the valley floor is considered silence.
const VALLEY_FLOOR: f32 = 0.005;

/// Abs-peak treated as amplifier saturation for the stuck-gain warning.
const SATURATION: f32 = 0.98;

const EPS: f32 = 1e-4;

/// Per-window front-end outputs, copied by value into the hop context.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrontEndFrame {
    /// Peak/valley-normalized level in [0, 1]; what the LED generators eat.
    pub level: f32,
    /// Fast envelope (raw amplitude units).
    pub fast_env: f32,
    /// Fast envelope of the previous window, for rise-rate gates.
    pub prev_fast_env: f32,
    /// Slow envelope (raw amplitude units).
    pub slow_env: f32,
    /// Decaying max tracker (raw, pre-mapping).
    pub peak: f32,
    /// Decaying min tracker (raw, pre-mapping).
    pub valley: f32,
    /// RMS of the newest hop after DC removal.
    pub rms: f32,
    /// Hardware gain index currently requested.
    pub hw_gain: u8,
    /// True when this window decided a gain step (apply at next boundary).
    pub gain_changed: bool,
    /// Coarse transient flag with its own refractory.
    pub transient: bool,
}

/// Stateful front-end; owns every tracker privately.
pub struct AdaptiveMic {
    params: FrontEndParams,
    dc: f32,
    fast_env: f32,
    prev_fast_env: f32,
    slow_env: f32,
    peak: f32,
    valley: f32,
    dc_alpha: f32,
    fast_alpha: f32,
    slow_alpha: f32,
    peak_alpha: f32,
    valley_alpha: f32,
    gain: u8,
    hi_run: u32,
    lo_run: u32,
    last_gain_step_ms: Option<u64>,
    last_transient_ms: Option<u64>,
    saturated_windows: u32,
    stuck_warned: bool,
}

impl AdaptiveMic {
    pub fn new(params: &FrontEndParams) -> Self {
        let mut mic = Self {
            params: params.clone(),
            dc: 0.0,
            fast_env: 0.0,
            prev_fast_env: 0.0,
            slow_env: 0.0,
            peak: 0.0,
            valley: 0.0,
            dc_alpha: 0.0,
            fast_alpha: 0.0,
            slow_alpha: 0.0,
            peak_alpha: 0.0,
            valley_alpha: 0.0,
            gain: params.hw_gain_max / 2,
            hi_run: 0,
            lo_run: 0,
            last_gain_step_ms: None,
            last_transient_ms: None,
            saturated_windows: 0,
            stuck_warned: false,
        };
        mic.set_params(params);
        mic
    }

    /// Adopt a new parameter bundle without resetting tracker state.
    pub fn set_params(&mut self, params: &FrontEndParams) {
        let hop = HOP_MS as f32;
        self.dc_alpha = ema_alpha(params.dc_tau_ms, hop);
        self.fast_alpha = ema_alpha(params.fast_tau_ms, hop);
        self.slow_alpha = ema_alpha(params.slow_tau_ms, hop);
        self.peak_alpha = ema_alpha(params.peak_tau_ms, hop);
        self.valley_alpha = ema_alpha(params.valley_tau_ms, hop);
        self.gain = self.gain.min(params.hw_gain_max);
        self.params = params.clone();
    }

    pub fn reset(&mut self) {
        self.dc = 0.0;
        self.fast_env = 0.0;
        self.prev_fast_env = 0.0;
        self.slow_env = 0.0;
        self.peak = 0.0;
        self.valley = 0.0;
        self.gain = self.params.hw_gain_max / 2;
        self.hi_run = 0;
        self.lo_run = 0;
        self.last_gain_step_ms = None;
        self.last_transient_ms = None;
        self.saturated_windows = 0;
        self.stuck_warned = false;
    }

    /// Advance every tracker over the newest hop of samples.
    pub fn process(&mut self, hop: &[f32], timestamp_ms: u64, alive: bool) -> FrontEndFrame {
        let mean = hop.iter().sum::<f32>() / hop.len().max(1) as f32;
        self.dc += self.dc_alpha * (mean - self.dc);

        let mut abs_peak = 0.0_f32;
        let mut sum_sq = 0.0_f32;
        for &s in hop {
            let centered = s - self.dc;
            abs_peak = abs_peak.max(centered.abs());
            sum_sq += centered * centered;
        }
        let rms = (sum_sq / hop.len().max(1) as f32).sqrt();

        self.prev_fast_env = self.fast_env;
        self.fast_env += self.fast_alpha * (rms - self.fast_env);
        self.slow_env += self.slow_alpha * (rms - self.slow_env);

        // Peak rises instantly, releases toward the fast envelope; the
        // valley mirrors it with slow upward drift.
        if abs_peak > self.peak {
            self.peak = abs_peak;
        } else {
            self.peak += self.peak_alpha * (self.fast_env - self.peak).min(0.0);
        }
        if abs_peak >= SATURATION {
            self.saturated_windows += 1;
        } else {
            self.saturated_windows = 0;
        }
        if rms < self.valley {
            self.valley = rms;
        } else {
            self.valley += self.valley_alpha * (self.fast_env - self.valley).max(0.0);
        }
        self.valley = self.valley.clamp(0.0, self.peak);

        let gain_changed = self.update_agc(timestamp_ms);

        let span = (self.peak - self.valley).max(EPS);
        let level = ((self.fast_env - self.valley) / span).clamp(0.0, 1.0);

        let transient = alive && self.check_transient(timestamp_ms);

        FrontEndFrame {
            level,
            fast_env: self.fast_env,
            prev_fast_env: self.prev_fast_env,
            slow_env: self.slow_env,
            peak: self.peak,
            valley: self.valley,
            rms,
            hw_gain: self.gain,
            gain_changed,
            transient,
        }
    }

    /// Step the hardware gain when the peak tracker sits outside the target
    /// band long enough. One step per hw_step_ms at most.
    fn update_agc(&mut self, timestamp_ms: u64) -> bool {
        let p = &self.params;
        if self.peak > p.hw_target_hi {
            self.hi_run += 1;
            self.lo_run = 0;
        } else if self.peak < p.hw_target_lo {
            self.lo_run += 1;
            self.hi_run = 0;
        } else {
            self.hi_run = 0;
            self.lo_run = 0;
        }

        let rate_ok = self
            .last_gain_step_ms
            .map(|t| timestamp_ms.saturating_sub(t) >= p.hw_step_ms)
            .unwrap_or(true);
        if !rate_ok {
            return false;
        }

        if self.hi_run >= p.hw_hold_windows {
            self.hi_run = 0;
            if self.gain > 0 {
                self.gain -= 1;
                self.last_gain_step_ms = Some(timestamp_ms);
                log::debug!("[FrontEnd] gain step down to {}", self.gain);
                self.stuck_warned = false;
                return true;
            }
            // Can't back off any further while the input keeps clipping.
            if self.saturated_windows >= p.hw_hold_windows && !self.stuck_warned {
                log::warn!("[FrontEnd] gain stuck at 0 with saturating input");
                self.stuck_warned = true;
            }
        } else if self.lo_run >= p.hw_hold_windows {
            self.lo_run = 0;
            if self.gain < p.hw_gain_max {
                self.gain += 1;
                self.last_gain_step_ms = Some(timestamp_ms);
                log::debug!("[FrontEnd] gain step up to {}", self.gain);
                return true;
            }
        }
        false
    }

    fn check_transient(&mut self, timestamp_ms: u64) -> bool {
        let p = &self.params;
        let cooled = self
            .last_transient_ms
            .map(|t| timestamp_ms.saturating_sub(t) >= p.cooldown_ms)
            .unwrap_or(true);
        let hit = self.fast_env > self.slow_env * p.attack_mult
            && self.fast_env > p.hit_thresh * self.valley.max(VALLEY_FLOOR);
        if cooled && hit {
            self.last_transient_ms = Some(timestamp_ms);
            true
        } else {
            false
        }
    }

    pub fn gain(&self) -> u8 {
        self.gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrontEndParams, HOP_SIZE};

    fn hop_of(amp: f32) -> Vec<f32> {
        // Alternating-sign block: zero mean, rms == amp.
        (0..HOP_SIZE)
            .map(|i| if i % 2 == 0 { amp } else { -amp })
            .collect()
    }

    fn run_windows(mic: &mut AdaptiveMic, amp: f32, count: u64, start_ms: u64) -> FrontEndFrame {
        let hop = hop_of(amp);
        let mut last = FrontEndFrame::default();
        for i in 0..count {
            last = mic.process(&hop, start_ms + i * HOP_MS, true);
        }
        last
    }

    #[test]
    fn test_level_and_trackers_in_range() {
        let mut mic = AdaptiveMic::new(&FrontEndParams::default());
        for (i, amp) in [0.0, 0.3, 0.05, 0.8, 0.0, 0.4].iter().enumerate() {
            let frame = run_windows(&mut mic, *amp, 20, i as u64 * 20 * HOP_MS);
            assert!((0.0..=1.0).contains(&frame.level), "level out of range");
            assert!(frame.peak >= frame.valley, "peak must dominate valley");
            assert!(frame.valley >= 0.0);
        }
    }

    #[test]
    fn test_agc_steps_down_on_loud_input() {
        let params = FrontEndParams::default();
        let mut mic = AdaptiveMic::new(&params);
        let initial = mic.gain();

        // A second of loud input: peak well above hw_target_hi.
        run_windows(&mut mic, 0.9, 64, 0);
        assert!(
            mic.gain() < initial,
            "gain should step down ({} -> {})",
            initial,
            mic.gain()
        );
    }

    #[test]
    fn test_agc_steps_up_on_quiet_input_and_clamps() {
        let params = FrontEndParams::default();
        let mut mic = AdaptiveMic::new(&params);

        // Long quiet stretch walks the gain to its ceiling, never past it.
        run_windows(&mut mic, 0.01, 1500, 0);
        assert_eq!(mic.gain(), params.hw_gain_max);
    }

    #[test]
    fn test_agc_rate_limited() {
        let params = FrontEndParams::default();
        let mut mic = AdaptiveMic::new(&params);
        let initial = mic.gain();

        // 200 ms at HOP_MS=16 is 12.5 hops; in 14 hops at most one step fits
        // after the hold count is reached.
        run_windows(&mut mic, 0.9, 14, 0);
        assert!(initial - mic.gain() <= 1, "more than one step in 224 ms");
    }

    #[test]
    fn test_transient_flag_and_refractory() {
        let mut mic = AdaptiveMic::new(&FrontEndParams::default());

        // Settle on a quiet floor first.
        run_windows(&mut mic, 0.01, 100, 0);

        let loud = hop_of(0.6);
        let frame = mic.process(&loud, 100 * HOP_MS, true);
        assert!(frame.transient, "jump over the floor should flag a transient");

        // Immediately after, the refractory suppresses a second flag.
        let frame = mic.process(&loud, 101 * HOP_MS, true);
        assert!(!frame.transient, "transient must respect its cooldown");
    }

    #[test]
    fn test_no_transient_when_dead() {
        let mut mic = AdaptiveMic::new(&FrontEndParams::default());
        run_windows(&mut mic, 0.01, 100, 0);
        let frame = mic.process(&hop_of(0.6), 100 * HOP_MS, false);
        assert!(!frame.transient);
    }

    #[test]
    fn test_level_mapping_tracks_steady_state_after_gain_step() {
        let mut mic = AdaptiveMic::new(&FrontEndParams::default());
        let before = run_windows(&mut mic, 0.05, 400, 0);

        // 8x louder input; after the trackers settle the mapped level lands
        // near its old value even though raw amplitudes moved an order of
        // magnitude.
        let after = run_windows(&mut mic, 0.4, 400, 400 * HOP_MS);
        assert!(
            (before.level - after.level).abs() <= 0.1,
            "steady-state level moved too much: {} vs {}",
            before.level,
            after.level
        );
    }

    #[test]
    fn test_set_params_keeps_state() {
        let mut mic = AdaptiveMic::new(&FrontEndParams::default());
        run_windows(&mut mic, 0.3, 50, 0);
        let peak_before = mic.peak;
        let mut params = FrontEndParams::default();
        params.attack_mult = 1.5;
        mic.set_params(&params);
        assert_eq!(mic.peak, peak_before, "reload must not reset trackers");
    }
}
