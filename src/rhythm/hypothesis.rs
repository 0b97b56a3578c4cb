// Tempo hypotheses
//
// A fixed-capacity slab of candidate {bpm, phase} pairs. Slots are plain
// indices; merging transfers score and frees a slot. The log-BPM Gaussian
// prior keeps the tracker from wandering off to implausible tempos when the
// autocorrelation is ambiguous.

use crate::config::RhythmParams;

/// Scores accumulate support up to this cap.
pub const MAX_SCORE: f32 = 2.0;

/// Hypotheses below this score are pruned at the next refresh.
pub const PRUNE_SCORE: f32 = 0.05;

/// A candidate tempo the tracker is tentatively following.
#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub bpm: f64,
    /// Beat-grid offset in [0, period).
    pub phase_ms: f64,
    pub score: f32,
    pub age_hops: u32,
    pub last_support_ms: u64,
    last_halved_ms: u64,
    /// Consecutive onsets that landed on this grid.
    pub run: u32,
}

impl Hypothesis {
    pub fn new(bpm: f64, phase_ms: f64, score: f32, now_ms: u64) -> Self {
        let period = 60_000.0 / bpm;
        Self {
            bpm,
            phase_ms: phase_ms.rem_euclid(period),
            score,
            age_hops: 0,
            last_support_ms: now_ms,
            last_halved_ms: now_ms,
            run: 0,
        }
    }

    pub fn period_ms(&self) -> f64 {
        60_000.0 / self.bpm
    }

    /// Signed distance from `t` to the nearest beat of this grid;
    /// positive means `t` is after the beat.
    pub fn beat_error_ms(&self, t_ms: u64) -> f64 {
        let period = self.period_ms();
        let r = (t_ms as f64 - self.phase_ms).rem_euclid(period);
        if r <= period / 2.0 {
            r
        } else {
            r - period
        }
    }

    /// The first beat time strictly after `t`.
    pub fn next_beat_after(&self, t_ms: u64) -> f64 {
        let period = self.period_ms();
        let k = ((t_ms as f64 - self.phase_ms) / period).floor() + 1.0;
        self.phase_ms + k * period
    }

    /// Nudge the beat grid toward an observed error (already signed).
    pub fn correct_phase(&mut self, error_ms: f64, alpha: f64) {
        let period = self.period_ms();
        self.phase_ms = (self.phase_ms + alpha * error_ms).rem_euclid(period);
    }

    pub fn bump(&mut self, strength: f32, conf_inc: f32, now_ms: u64) {
        self.score = (self.score + conf_inc * strength).min(MAX_SCORE);
        self.run += 1;
        self.last_support_ms = now_ms;
        self.last_halved_ms = now_ms;
    }
}

/// Gaussian prior on log BPM, 1.0 at the center.
pub fn tempo_prior(bpm: f64, center_bpm: f32, width: f32) -> f32 {
    let x = (bpm.ln() - (center_bpm as f64).ln()) / width.max(0.05) as f64;
    (-0.5 * x * x).exp() as f32
}

/// Fixed-capacity, index-based hypothesis store.
pub struct HypothesisSlab {
    slots: Vec<Option<Hypothesis>>,
}

impl HypothesisSlab {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.clamp(1, 8)],
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    pub fn get(&self, index: usize) -> Option<&Hypothesis> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Hypothesis> {
        self.slots.get_mut(index).and_then(|s| s.as_mut())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Hypothesis)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|h| (i, h)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Hypothesis)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|h| (i, h)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold fresh autocorrelation evidence into the slab.
    ///
    /// An existing hypothesis within `bpm_match_tol` adopts the evidence
    /// (score only ever raised, phase refreshed unless `keep_phase_of` says
    /// it is the locked grid); otherwise the evidence claims a free slot or
    /// evicts the weakest slot it beats.
    pub fn absorb(
        &mut self,
        bpm: f64,
        phase_ms: f64,
        score: f32,
        now_ms: u64,
        bpm_match_tol: f32,
        keep_phase_of: Option<usize>,
    ) {
        let mut matched = None;
        for (i, hyp) in self.iter_mut() {
            if (hyp.bpm - bpm).abs() <= bpm_match_tol as f64 {
                matched = Some(i);
                break;
            }
        }

        if let Some(i) = matched {
            let keep_phase = keep_phase_of == Some(i);
            if let Some(hyp) = self.get_mut(i) {
                hyp.score = hyp.score.max(score);
                hyp.bpm = 0.7 * hyp.bpm + 0.3 * bpm;
                if !keep_phase {
                    let period = hyp.period_ms();
                    hyp.phase_ms = phase_ms.rem_euclid(period);
                }
            }
            return;
        }

        // New tempo: free slot first, then the weakest slot it beats.
        if let Some(free) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[free] = Some(Hypothesis::new(bpm, phase_ms, score, now_ms));
            return;
        }
        let weakest = self
            .iter()
            .min_by(|(_, a), (_, b)| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, h)| (i, h.score));
        if let Some((i, weakest_score)) = weakest {
            if score > weakest_score && keep_phase_of != Some(i) {
                self.slots[i] = Some(Hypothesis::new(bpm, phase_ms, score, now_ms));
            }
        }
    }

    /// Halve scores that have gone unsupported too long, drop dead slots.
    pub fn decay_unsupported(&mut self, now_ms: u64, silence_half_ms: u64) {
        for slot in self.slots.iter_mut() {
            if let Some(hyp) = slot {
                let since = now_ms.saturating_sub(hyp.last_support_ms.max(hyp.last_halved_ms));
                if since >= silence_half_ms {
                    hyp.score *= 0.5;
                    hyp.last_halved_ms = now_ms;
                }
                if hyp.score < PRUNE_SCORE {
                    *slot = None;
                }
            }
        }
    }

    /// Merge harmonically related pairs (2:1 always, 3:1 when enabled).
    ///
    /// The slower grid wins only when its beats are strongly confirmed;
    /// otherwise the faster one absorbs the pair.
    pub fn merge_harmonics(&mut self, params: &RhythmParams) {
        let ratios: &[f64] = if params.merge_3to1 { &[2.0, 3.0] } else { &[2.0] };
        loop {
            let mut merge: Option<(usize, usize)> = None;
            'outer: for (i, a) in self.iter() {
                for (j, b) in self.iter() {
                    if i >= j {
                        continue;
                    }
                    let (fast, slow) = if a.bpm >= b.bpm { (i, j) } else { (j, i) };
                    let fast_bpm = self.get(fast).map(|h| h.bpm).unwrap_or(0.0);
                    let slow_bpm = self.get(slow).map(|h| h.bpm).unwrap_or(1.0);
                    for &ratio in ratios {
                        if (fast_bpm - ratio * slow_bpm).abs()
                            <= params.bpm_match_tol as f64 * ratio
                        {
                            merge = Some((fast, slow));
                            break 'outer;
                        }
                    }
                }
            }
            let Some((fast, slow)) = merge else { break };
            let fast_hyp = self.slots[fast].clone().unwrap();
            let slow_hyp = self.slots[slow].clone().unwrap();

            let prefer_slow = slow_hyp.run >= params.min_beats
                && slow_hyp.score + params.promote_thresh >= fast_hyp.score;
            let (winner, loser) = if prefer_slow { (slow, fast) } else { (fast, slow) };
            let loser_score = self.slots[loser].as_ref().map(|h| h.score).unwrap_or(0.0);
            if let Some(hyp) = self.get_mut(winner) {
                hyp.score = (hyp.score + 0.5 * loser_score).min(MAX_SCORE);
            }
            self.slots[loser] = None;
        }
    }

    /// Index of the strongest hypothesis; ties go to the one nearer the
    /// tempo prior.
    pub fn best_index(&self, center_bpm: f32, width: f32) -> Option<usize> {
        let mut best: Option<(usize, f32, f32)> = None;
        for (i, hyp) in self.iter() {
            let prior = tempo_prior(hyp.bpm, center_bpm, width);
            let replace = match best {
                None => true,
                Some((_, score, best_prior)) => {
                    hyp.score > score + f32::EPSILON
                        || ((hyp.score - score).abs() <= f32::EPSILON && prior > best_prior)
                }
            };
            if replace {
                best = Some((i, hyp.score, prior));
            }
        }
        best.map(|(i, _, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prior_peaks_at_center() {
        assert!((tempo_prior(120.0, 120.0, 0.5) - 1.0).abs() < 1e-6);
        assert!(tempo_prior(60.0, 120.0, 0.5) < 1.0);
        // Symmetric in log space: 60 and 240 sit at the same distance.
        let lo = tempo_prior(60.0, 120.0, 0.5);
        let hi = tempo_prior(240.0, 120.0, 0.5);
        assert!((lo - hi).abs() < 1e-6);
    }

    #[test]
    fn test_beat_error_wraps_to_nearest() {
        let hyp = Hypothesis::new(120.0, 0.0, 1.0, 0);
        // Period 500 ms: 30 ms after a beat is +30, 30 ms before is -30.
        assert!((hyp.beat_error_ms(1030) - 30.0).abs() < 1e-9);
        assert!((hyp.beat_error_ms(970) + 30.0).abs() < 1e-9);
        assert_eq!(hyp.beat_error_ms(1000), 0.0);
    }

    #[test]
    fn test_next_beat_after() {
        let hyp = Hypothesis::new(120.0, 100.0, 1.0, 0);
        assert!((hyp.next_beat_after(100) - 600.0).abs() < 1e-9);
        assert!((hyp.next_beat_after(650) - 1100.0).abs() < 1e-9);
    }

    #[test]
    fn test_phase_stays_in_period() {
        let mut hyp = Hypothesis::new(120.0, 480.0, 1.0, 0);
        for _ in 0..100 {
            hyp.correct_phase(60.0, 0.35);
            assert!(hyp.phase_ms >= 0.0 && hyp.phase_ms < hyp.period_ms());
        }
    }

    #[test]
    fn test_absorb_matches_and_evicts() {
        let mut slab = HypothesisSlab::new(2);
        slab.absorb(120.0, 0.0, 0.8, 0, 3.0, None);
        slab.absorb(90.0, 0.0, 0.4, 0, 3.0, None);
        assert_eq!(slab.len(), 2);

        // Within tolerance: merges into the 120 hypothesis, raising its bpm blend.
        slab.absorb(121.0, 10.0, 0.9, 1000, 3.0, None);
        assert_eq!(slab.len(), 2);
        let best = slab.best_index(120.0, 0.5).unwrap();
        assert!((slab.get(best).unwrap().bpm - 120.3).abs() < 0.2);
        assert!((slab.get(best).unwrap().score - 0.9).abs() < 1e-6);

        // A stronger newcomer evicts the weakest slot.
        slab.absorb(150.0, 0.0, 0.6, 2000, 3.0, None);
        assert_eq!(slab.len(), 2);
        assert!(slab.iter().any(|(_, h)| (h.bpm - 150.0).abs() < 1e-6));
        assert!(!slab.iter().any(|(_, h)| (h.bpm - 90.0).abs() < 1e-6));
    }

    #[test]
    fn test_merge_two_to_one_prefers_faster_without_confirmation() {
        let params = RhythmParams::default();
        let mut slab = HypothesisSlab::new(4);
        slab.absorb(60.0, 0.0, 0.5, 0, 3.0, None);
        slab.absorb(120.0, 0.0, 0.5, 0, 3.0, None);
        slab.merge_harmonics(&params);
        assert_eq!(slab.len(), 1);
        let (_, survivor) = slab.iter().next().unwrap();
        assert!((survivor.bpm - 120.0).abs() < 1e-6, "unconfirmed slow grid loses");
        assert!((survivor.score - 0.75).abs() < 1e-6, "winner absorbs half the loser");
    }

    #[test]
    fn test_merge_prefers_confirmed_slower_grid() {
        let params = RhythmParams::default();
        let mut slab = HypothesisSlab::new(4);
        slab.absorb(60.0, 0.0, 0.6, 0, 3.0, None);
        slab.absorb(120.0, 0.0, 0.5, 0, 3.0, None);
        // Confirm the slow grid with min_beats consecutive onsets.
        for (_, hyp) in slab.iter_mut() {
            if (hyp.bpm - 60.0).abs() < 1e-6 {
                for k in 0..params.min_beats {
                    hyp.bump(1.0, 0.0, k as u64 * 1000);
                }
            }
        }
        slab.merge_harmonics(&params);
        assert_eq!(slab.len(), 1);
        let (_, survivor) = slab.iter().next().unwrap();
        assert!((survivor.bpm - 60.0).abs() < 1e-6, "confirmed slow grid wins");
    }

    #[test]
    fn test_decay_halves_then_prunes() {
        let mut slab = HypothesisSlab::new(2);
        slab.absorb(120.0, 0.0, 0.4, 0, 3.0, None);
        slab.decay_unsupported(4000, 4000);
        assert!((slab.iter().next().unwrap().1.score - 0.2).abs() < 1e-6);
        // Not yet another full silence window: no second halving.
        slab.decay_unsupported(6000, 4000);
        assert!((slab.iter().next().unwrap().1.score - 0.2).abs() < 1e-6);
        // Further windows push it below the prune floor.
        slab.decay_unsupported(8000, 4000);
        slab.decay_unsupported(12000, 4000);
        slab.decay_unsupported(16000, 4000);
        assert!(slab.is_empty());
    }
}
