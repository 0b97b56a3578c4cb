// Rhythm tracker - tempo and beat phase from the onset stream
//
// Onsets feed a decaying envelope; roughly once a second its
// autocorrelation is scanned for periodicities, which become tempo
// hypotheses weighted by a log-BPM prior. Hypotheses earn score when
// onsets land on their predicted grid and fade when they don't. Once one
// is confirmed for enough consecutive beats the tracker locks, refines the
// beat phase on every supporting onset, and emits a beat event each time
// the grid crosses a beat boundary.
//
// State machine: IDLE -> LISTENING -> LOCKED <-> COASTING, back to IDLE
// after silence_grace_ms without an onset.

mod envelope;
mod hypothesis;

pub use envelope::{AcfPeak, OnsetEnvelope, ENVELOPE_LEN};
pub use hypothesis::{tempo_prior, Hypothesis, HypothesisSlab};

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::{RhythmParams, HOP_MS};
use crate::fusion::OnsetEvent;

/// ACF peaks below this normalized height are ignored.
const MIN_ACF_PEAK: f32 = 0.1;

/// Score multiplier applied when an onset misses a hypothesis grid.
const MISS_DECAY: f32 = 0.97;

/// Recent onsets retained for phase fitting.
const RECENT_ONSETS: usize = 64;

/// Confidence granted on the transition into LOCKED.
const LOCK_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Idle,
    Listening,
    Locked,
    Coasting,
}

/// A beat boundary crossed while locked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    pub timestamp_ms: u64,
    pub bpm: f32,
    pub confidence: f32,
}

/// Per-hop tracker outputs, copied into the telemetry record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RhythmFrame {
    pub state: TrackerState,
    /// Best-hypothesis BPM, 0.0 when idle with no hypotheses.
    pub bpm: f32,
    /// Position inside the current beat, [0, 1).
    pub phase: f32,
    pub confidence: f32,
    pub beat: Option<BeatEvent>,
}

struct PendingBeat {
    time_ms: f64,
    supported: bool,
}

pub struct RhythmTracker {
    params: RhythmParams,
    state: TrackerState,
    envelope: OnsetEnvelope,
    slab: HypothesisSlab,
    best: Option<usize>,
    confidence: f32,
    recent_onsets: VecDeque<(u64, f32)>,
    last_onset_ms: Option<u64>,
    next_update_ms: u64,
    next_beat_ms: f64,
    pending_beat: Option<PendingBeat>,
    lin_scratch: Vec<f32>,
    acf_scratch: Vec<f32>,
    peak_scratch: Vec<AcfPeak>,
}

impl RhythmTracker {
    pub fn new(params: &RhythmParams) -> Self {
        Self {
            params: params.clone(),
            state: TrackerState::Idle,
            envelope: OnsetEnvelope::new(params.envelope_tau_ms),
            slab: HypothesisSlab::new(params.k_hypotheses),
            best: None,
            confidence: 0.0,
            recent_onsets: VecDeque::with_capacity(RECENT_ONSETS),
            last_onset_ms: None,
            next_update_ms: params.update_interval_ms,
            next_beat_ms: 0.0,
            pending_beat: None,
            lin_scratch: Vec::with_capacity(ENVELOPE_LEN),
            acf_scratch: Vec::with_capacity(ENVELOPE_LEN / 2),
            peak_scratch: Vec::with_capacity(16),
        }
    }

    pub fn set_params(&mut self, params: &RhythmParams) {
        self.envelope.set_tau(params.envelope_tau_ms);
        self.params = params.clone();
    }

    pub fn reset(&mut self) {
        self.state = TrackerState::Idle;
        self.envelope.reset();
        self.slab.clear();
        self.best = None;
        self.confidence = 0.0;
        self.recent_onsets.clear();
        self.last_onset_ms = None;
        self.next_update_ms = self.params.update_interval_ms;
        self.next_beat_ms = 0.0;
        self.pending_beat = None;
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Best-hypothesis BPM, if any hypothesis exists.
    pub fn bpm(&self) -> Option<f32> {
        self.best
            .and_then(|i| self.slab.get(i))
            .map(|h| h.bpm as f32)
    }

    /// Advance one hop. `onset` is this hop's fused onset, if any.
    pub fn update(&mut self, onset: Option<&OnsetEvent>, now_ms: u64) -> RhythmFrame {
        self.envelope.push(onset.map(|o| o.strength).unwrap_or(0.0));

        if let Some(event) = onset {
            self.note_onset(event, now_ms);
        }

        self.check_silence(now_ms);

        if self.state != TrackerState::Idle && now_ms >= self.next_update_ms {
            self.refresh_hypotheses(now_ms);
            self.next_update_ms = now_ms + self.params.update_interval_ms;
        }

        for (_, hyp) in self.slab.iter_mut() {
            hyp.age_hops += 1;
        }

        let beat = self.advance_beat_grid(now_ms);
        self.try_lock(now_ms);

        self.frame(now_ms, beat)
    }

    fn frame(&self, now_ms: u64, beat: Option<BeatEvent>) -> RhythmFrame {
        let (bpm, phase) = match self.best.and_then(|i| self.slab.get(i)) {
            Some(hyp) => {
                let period = hyp.period_ms();
                let pos = (now_ms as f64 - hyp.phase_ms).rem_euclid(period) / period;
                (hyp.bpm as f32, pos as f32)
            }
            None => (0.0, 0.0),
        };
        RhythmFrame {
            state: self.state,
            bpm,
            phase,
            confidence: self.confidence.clamp(0.0, 1.0),
            beat,
        }
    }

    fn note_onset(&mut self, event: &OnsetEvent, now_ms: u64) {
        if self.recent_onsets.len() == RECENT_ONSETS {
            self.recent_onsets.pop_front();
        }
        self.recent_onsets.push_back((now_ms, event.strength));
        self.last_onset_ms = Some(now_ms);

        if self.state == TrackerState::Idle {
            self.state = TrackerState::Listening;
            log::debug!("[Rhythm] first onset, listening");
        }

        let tol = self.params.match_tol_ms as f64;
        let conf_inc = self.params.conf_inc;
        let best = self.best;
        let locked = matches!(self.state, TrackerState::Locked | TrackerState::Coasting);
        let alpha = (0.35 - 0.25 * self.confidence as f64).clamp(0.10, 0.35);

        let mut matched_beat: Option<f64> = None;
        for (i, hyp) in self.slab.iter_mut() {
            let err = hyp.beat_error_ms(now_ms);
            if err.abs() <= tol {
                hyp.bump(event.strength, conf_inc, now_ms);
                if best == Some(i) {
                    if locked {
                        hyp.correct_phase(err, alpha);
                    }
                    matched_beat = Some(now_ms as f64 - err);
                }
            } else {
                hyp.score *= MISS_DECAY;
                hyp.run = 0;
            }
        }

        // Credit an already-emitted beat this onset matched; support for a
        // beat still ahead is picked up when that beat is emitted.
        if let Some(beat_time) = matched_beat {
            if let Some(pending) = self.pending_beat.as_mut() {
                if (pending.time_ms - beat_time).abs() <= tol {
                    pending.supported = true;
                }
            }
        }
    }

    fn check_silence(&mut self, now_ms: u64) {
        if self.state == TrackerState::Idle {
            return;
        }
        let Some(last) = self.last_onset_ms else {
            return;
        };
        if now_ms.saturating_sub(last) >= self.params.silence_grace_ms {
            log::info!("[Rhythm] {} ms without onsets, going idle", now_ms - last);
            self.state = TrackerState::Idle;
            self.slab.clear();
            self.best = None;
            self.confidence = 0.0;
            self.pending_beat = None;
            self.envelope.reset();
            self.recent_onsets.clear();
        }
    }

    /// Periodic autocorrelation scan and hypothesis bookkeeping.
    fn refresh_hypotheses(&mut self, now_ms: u64) {
        let p = self.params.clone();

        self.envelope.linearize(&mut self.lin_scratch);
        let lag_min = ((60_000.0 / p.bpm_max as f64) / HOP_MS as f64).ceil() as usize;
        // One extra lag past the slow edge so a peak sitting exactly on
        // bpm_min still reads as a local maximum; the bpm filter below
        // rejects anything that interpolates out of range.
        let lag_max = ((60_000.0 / p.bpm_min as f64) / HOP_MS as f64).ceil() as usize + 2;
        let usable = self.lin_scratch.len().saturating_sub(1);

        if usable > lag_min {
            envelope::autocorrelate(
                &self.lin_scratch,
                lag_min,
                lag_max.min(usable),
                &mut self.acf_scratch,
            );
            envelope::pick_peaks(
                &self.acf_scratch,
                lag_min,
                MIN_ACF_PEAK,
                p.k_hypotheses,
                &mut self.peak_scratch,
            );

            let locked = matches!(self.state, TrackerState::Locked | TrackerState::Coasting);
            let keep_phase_of = if locked { self.best } else { None };
            for peak in self.peak_scratch.clone() {
                let lag_ms = peak.lag_hops as f64 * HOP_MS as f64;
                let bpm = 60_000.0 / lag_ms;
                // Interpolation can land a hair outside the range; clamp
                // those back, drop anything genuinely out of bounds.
                if bpm < p.bpm_min as f64 - 1.0 || bpm > p.bpm_max as f64 + 1.0 {
                    continue;
                }
                let bpm = bpm.clamp(p.bpm_min as f64, p.bpm_max as f64);
                let score = peak.height * tempo_prior(bpm, p.prior_center_bpm, p.prior_width);
                let phase = self.fit_phase(bpm);
                self.slab
                    .absorb(bpm, phase, score, now_ms, p.bpm_match_tol, keep_phase_of);
            }
        }

        self.slab.decay_unsupported(now_ms, p.silence_half_ms);
        self.slab.merge_harmonics(&p);
        self.elect_best(now_ms);
    }

    /// Pick or defend the best hypothesis.
    ///
    /// While locked, a challenger must bring min_beats consecutive supports
    /// and a clear score margin to steal the lock; otherwise the incumbent
    /// keeps it even if its score briefly dips.
    fn elect_best(&mut self, now_ms: u64) {
        let center = self.params.prior_center_bpm;
        let width = self.params.prior_width;
        let min_beats = self.params.min_beats;
        let promote = self.params.promote_thresh;
        let incumbent = self.best.filter(|&i| self.slab.get(i).is_some());
        let locked = matches!(self.state, TrackerState::Locked | TrackerState::Coasting);

        if locked {
            let Some(inc) = incumbent else {
                // The locked grid was merged away or pruned.
                self.unlock();
                self.best = self.slab.best_index(center, width);
                return;
            };
            let challenger = self
                .slab
                .iter()
                .filter(|(i, h)| *i != inc && h.run >= min_beats)
                .max_by(|(_, a), (_, b)| {
                    a.score
                        .partial_cmp(&b.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, h)| (i, h.score));
            let incumbent_score = self.slab.get(inc).map(|h| h.score).unwrap_or(0.0);
            if let Some((i, score)) = challenger {
                if score > incumbent_score + promote {
                    log::info!(
                        "[Rhythm] lock overtaken: {:.1} bpm (score {:.2}) replaces {:.1} bpm",
                        self.slab.get(i).map(|h| h.bpm).unwrap_or(0.0),
                        score,
                        self.slab.get(inc).map(|h| h.bpm).unwrap_or(0.0)
                    );
                    self.best = Some(i);
                    self.confidence = LOCK_CONFIDENCE;
                    self.pending_beat = None;
                    if let Some(hyp) = self.slab.get(i) {
                        self.next_beat_ms = hyp.next_beat_after(now_ms);
                    }
                }
            }
        } else {
            self.best = self.slab.best_index(center, width);
        }
    }

    /// LISTENING -> LOCKED once the best hypothesis is both strong and
    /// confirmed by consecutive matched beats.
    fn try_lock(&mut self, now_ms: u64) {
        if self.state != TrackerState::Listening {
            return;
        }
        let p = &self.params;
        let Some(best) = self.best.and_then(|i| self.slab.get(i)) else {
            return;
        };
        if best.score >= p.activate_thresh && best.run >= p.min_beats {
            log::info!(
                "[Rhythm] locked at {:.1} bpm (score {:.2}, {} beats)",
                best.bpm,
                best.score,
                best.run
            );
            self.state = TrackerState::Locked;
            self.confidence = LOCK_CONFIDENCE;
            self.next_beat_ms = best.next_beat_after(now_ms);
            self.pending_beat = None;
        }
    }

    fn unlock(&mut self) {
        log::info!("[Rhythm] lock lost, listening again");
        self.state = TrackerState::Listening;
        self.confidence = 0.0;
        self.pending_beat = None;
        if let Some(hyp) = self.best.and_then(|i| self.slab.get_mut(i)) {
            hyp.run = 0;
        }
    }

    /// Judge the previous beat and emit the next one when its time comes.
    fn advance_beat_grid(&mut self, now_ms: u64) -> Option<BeatEvent> {
        if !matches!(self.state, TrackerState::Locked | TrackerState::Coasting) {
            self.pending_beat = None;
            return None;
        }
        let tol = self.params.match_tol_ms as f64;

        // A beat is judged once its support window has fully passed.
        if let Some(pending) = self.pending_beat.take() {
            if (now_ms as f64) > pending.time_ms + tol {
                if pending.supported {
                    self.confidence = (self.confidence + self.params.conf_inc).min(1.0);
                    self.state = TrackerState::Locked;
                } else {
                    self.confidence = (self.confidence - self.params.conf_dec).max(0.0);
                    self.state = TrackerState::Coasting;
                    if let Some(hyp) = self.best.and_then(|i| self.slab.get_mut(i)) {
                        hyp.score *= 0.9;
                    }
                    if self.confidence < self.params.deactivate_thresh {
                        self.unlock();
                        return None;
                    }
                }
            } else {
                self.pending_beat = Some(pending);
            }
        }

        let best = self.best.and_then(|i| self.slab.get(i))?;
        let period = best.period_ms();
        let bpm = best.bpm as f32;

        // Re-anchor if phase corrections moved the grid out from under us.
        if self.next_beat_ms <= 0.0 || self.next_beat_ms > now_ms as f64 + 2.0 * period {
            self.next_beat_ms = best.next_beat_after(now_ms);
        }

        if (now_ms as f64) >= self.next_beat_ms {
            let event = BeatEvent {
                timestamp_ms: self.next_beat_ms.max(0.0) as u64,
                bpm,
                confidence: self.confidence.clamp(0.0, 1.0),
            };
            // Support may already have arrived just before the boundary.
            let already = self
                .recent_onsets
                .back()
                .map(|&(t, _)| (t as f64 - event.timestamp_ms as f64).abs() <= tol)
                .unwrap_or(false);
            self.pending_beat = Some(PendingBeat {
                time_ms: self.next_beat_ms,
                supported: already,
            });
            self.next_beat_ms += period;
            // Snap back onto the hypothesis grid so phase corrections and
            // tempo blending can't walk the emission times away from it.
            let drift = best.beat_error_ms(self.next_beat_ms.max(0.0) as u64);
            self.next_beat_ms -= drift;
            return Some(event);
        }
        None
    }

    /// Fit a beat phase to the recent onsets by circular mean on the given
    /// period.
    fn fit_phase(&self, bpm: f64) -> f64 {
        let period = 60_000.0 / bpm;
        let mut sx = 0.0_f64;
        let mut sy = 0.0_f64;
        for &(t, strength) in &self.recent_onsets {
            let theta = 2.0 * std::f64::consts::PI * ((t as f64).rem_euclid(period) / period);
            sx += strength as f64 * theta.cos();
            sy += strength as f64 * theta.sin();
        }
        if sx == 0.0 && sy == 0.0 {
            return 0.0;
        }
        let angle = sy.atan2(sx);
        (angle / (2.0 * std::f64::consts::PI) * period).rem_euclid(period)
    }
}
