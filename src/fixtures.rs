//! Deterministic PCM fixtures for tests and the CLI's pattern mode.
//!
//! Each spec renders to a mono 16 kHz buffer with a seeded RNG, so a given
//! spec always produces the same samples and the pipeline's output over it
//! is reproducible. The generators double as ground truth: every percussive
//! pattern can report exactly where its hits are.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

use crate::config::SAMPLE_RATE;

/// Declarative description of a renderable test pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub pattern: Pattern,
    pub duration_ms: u32,
    #[serde(default = "default_amplitude")]
    pub amplitude: f32,
    /// Mic-style noise pedestal added to every non-silent pattern; without
    /// it the gaps between hits are digital zeros and trip the dead-input
    /// latch, which no physical microphone ever produces.
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f32,
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pattern {
    /// All zeros; exercises the dead-input path.
    Silence,
    /// Kick drum on every beat.
    Kicks { bpm: f32 },
    /// Kick and snare alternating beat by beat (kick on 1, snare on 2).
    KickSnare { bpm: f32 },
    /// Sustained slow-attack chord, no transients.
    Pad,
    /// Kicks at a fixed tempo whose amplitude jumps by `factor` at `step_at_ms`.
    GainStep { bpm: f32, factor: f32, step_at_ms: u32 },
    /// Kicks at `first_bpm`, switching to `second_bpm` halfway through.
    TempoChange { first_bpm: f32, second_bpm: f32 },
}

fn default_amplitude() -> f32 {
    0.5
}

fn default_noise_floor() -> f32 {
    0.002
}

impl PatternSpec {
    pub fn new(pattern: Pattern, duration_ms: u32) -> Self {
        Self {
            pattern,
            duration_ms,
            amplitude: default_amplitude(),
            noise_floor: default_noise_floor(),
            seed: 0,
        }
    }

    fn total_samples(&self) -> usize {
        (self.duration_ms as u64 * SAMPLE_RATE as u64 / 1000) as usize
    }

    /// Render the spec to mono PCM at the pipeline rate.
    pub fn render(&self) -> Vec<f32> {
        let mut samples = vec![0.0_f32; self.total_samples()];
        let mut rng = StdRng::seed_from_u64(self.seed);

        if !matches!(self.pattern, Pattern::Silence) && self.noise_floor > 0.0 {
            for slot in samples.iter_mut() {
                *slot = rng.gen_range(-self.noise_floor..self.noise_floor);
            }
        }

        match &self.pattern {
            Pattern::Silence => {}
            Pattern::Kicks { bpm } => {
                for t in beat_grid(*bpm, 0, self.duration_ms) {
                    add_kick(&mut samples, t, self.amplitude, &mut rng);
                }
            }
            Pattern::KickSnare { bpm } => {
                // Kick on odd beats, snare on even: events land on every
                // beat of the grid.
                let beat = (60_000.0 / bpm) as u32;
                for t in beat_grid(bpm / 2.0, 0, self.duration_ms) {
                    add_kick(&mut samples, t, self.amplitude, &mut rng);
                }
                for t in beat_grid(bpm / 2.0, beat, self.duration_ms) {
                    add_snare(&mut samples, t, self.amplitude * 0.8, &mut rng);
                }
            }
            Pattern::Pad => add_pad(&mut samples, self.amplitude),
            Pattern::GainStep {
                bpm,
                factor,
                step_at_ms,
            } => {
                for t in beat_grid(*bpm, 0, self.duration_ms) {
                    add_kick(&mut samples, t, self.amplitude, &mut rng);
                }
                let step_idx = ms_to_samples(*step_at_ms);
                for sample in samples.iter_mut().skip(step_idx) {
                    *sample = (*sample * factor).clamp(-1.0, 1.0);
                }
            }
            Pattern::TempoChange {
                first_bpm,
                second_bpm,
            } => {
                let half_ms = self.duration_ms / 2;
                for t in beat_grid(*first_bpm, 0, half_ms) {
                    add_kick(&mut samples, t, self.amplitude, &mut rng);
                }
                for t in beat_grid(*second_bpm, half_ms, self.duration_ms) {
                    add_kick(&mut samples, t, self.amplitude, &mut rng);
                }
            }
        }
        samples
    }

    /// Ground-truth hit times for precision/recall measurements.
    pub fn onset_times_ms(&self) -> Vec<u64> {
        let mut times: Vec<u64> = match &self.pattern {
            Pattern::Silence | Pattern::Pad => Vec::new(),
            Pattern::Kicks { bpm } | Pattern::GainStep { bpm, .. } => {
                beat_grid(*bpm, 0, self.duration_ms).map(u64::from).collect()
            }
            Pattern::KickSnare { bpm } => {
                let beat = (60_000.0 / bpm) as u32;
                let mut all: Vec<u64> = beat_grid(bpm / 2.0, 0, self.duration_ms)
                    .chain(beat_grid(bpm / 2.0, beat, self.duration_ms))
                    .map(u64::from)
                    .collect();
                all.sort_unstable();
                all
            }
            Pattern::TempoChange {
                first_bpm,
                second_bpm,
            } => {
                let half_ms = self.duration_ms / 2;
                beat_grid(*first_bpm, 0, half_ms)
                    .chain(beat_grid(*second_bpm, half_ms, self.duration_ms))
                    .map(u64::from)
                    .collect()
            }
        };
        times.sort_unstable();
        times
    }
}

fn ms_to_samples(ms: u32) -> usize {
    (ms as u64 * SAMPLE_RATE as u64 / 1000) as usize
}

/// Beat times in milliseconds from `start_ms` (inclusive) to `end_ms`.
fn beat_grid(bpm: f32, start_ms: u32, end_ms: u32) -> impl Iterator<Item = u32> {
    let period_ms = 60_000.0 / bpm.max(1.0);
    (0..)
        .map(move |k| start_ms + (k as f32 * period_ms) as u32)
        .take_while(move |&t| t < end_ms)
}

/// Kick: a 60 Hz body with a fast exponential decay and a short click.
fn add_kick(samples: &mut [f32], at_ms: u32, amplitude: f32, rng: &mut StdRng) {
    let start = ms_to_samples(at_ms);
    let length = ms_to_samples(90);
    for i in 0..length {
        let Some(slot) = samples.get_mut(start + i) else {
            break;
        };
        let t = i as f32 / SAMPLE_RATE as f32;
        let body = (2.0 * PI * 60.0 * t).sin() * (-t / 0.030).exp();
        let click = if i < 32 {
            rng.gen_range(-0.4..0.4) * (1.0 - i as f32 / 32.0)
        } else {
            0.0
        };
        *slot = (*slot + amplitude * (body + click)).clamp(-1.0, 1.0);
    }
}

/// Snare: filtered-ish noise burst over a 180 Hz body.
fn add_snare(samples: &mut [f32], at_ms: u32, amplitude: f32, rng: &mut StdRng) {
    let start = ms_to_samples(at_ms);
    let length = ms_to_samples(70);
    for i in 0..length {
        let Some(slot) = samples.get_mut(start + i) else {
            break;
        };
        let t = i as f32 / SAMPLE_RATE as f32;
        let envelope = (-t / 0.020).exp();
        let noise: f32 = rng.gen_range(-1.0..1.0);
        let body = (2.0 * PI * 180.0 * t).sin() * 0.4;
        *slot = (*slot + amplitude * envelope * (0.7 * noise + body)).clamp(-1.0, 1.0);
    }
}

/// Pad: three detuned partials with a 500 ms linear attack, no transients.
fn add_pad(samples: &mut [f32], amplitude: f32) {
    let attack = ms_to_samples(500);
    for (i, slot) in samples.iter_mut().enumerate() {
        let t = i as f32 / SAMPLE_RATE as f32;
        let env = if i < attack {
            i as f32 / attack as f32
        } else {
            1.0
        };
        let chord = (2.0 * PI * 220.0 * t).sin()
            + 0.8 * (2.0 * PI * 277.2 * t).sin()
            + 0.6 * (2.0 * PI * 329.6 * t).sin();
        *slot = amplitude * env * chord / 3.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_is_deterministic() {
        let spec = PatternSpec::new(Pattern::KickSnare { bpm: 120.0 }, 2000);
        assert_eq!(spec.render(), spec.render());
    }

    #[test]
    fn test_silence_is_zero() {
        let spec = PatternSpec::new(Pattern::Silence, 1000);
        let samples = spec.render();
        assert_eq!(samples.len(), 16_000);
        assert!(samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_kick_grid_matches_ground_truth() {
        let spec = PatternSpec::new(Pattern::Kicks { bpm: 120.0 }, 4000);
        let times = spec.onset_times_ms();
        assert_eq!(times, vec![0, 500, 1000, 1500, 2000, 2500, 3000, 3500]);

        let samples = spec.render();
        // Energy right after each hit, near-silence just before the next.
        for &t in &times {
            let at = ms_to_samples(t as u32);
            let peak = samples[at..at + 160].iter().fold(0.0_f32, |m, &s| m.max(s.abs()));
            assert!(peak > 0.2, "hit at {} ms too quiet ({})", t, peak);
        }
        let quiet_at = ms_to_samples(400);
        let quiet = samples[quiet_at..quiet_at + 160]
            .iter()
            .fold(0.0_f32, |m, &s| m.max(s.abs()));
        assert!(quiet < 0.02, "expected near-silence between kicks, got {}", quiet);
    }

    #[test]
    fn test_gain_step_scales_tail() {
        let spec = PatternSpec {
            pattern: Pattern::GainStep {
                bpm: 120.0,
                factor: 8.0,
                step_at_ms: 1000,
            },
            duration_ms: 2000,
            amplitude: 0.05,
            noise_floor: 0.002,
            seed: 0,
        };
        let samples = spec.render();
        let before = samples[..ms_to_samples(1000)]
            .iter()
            .fold(0.0_f32, |m, &s| m.max(s.abs()));
        let after = samples[ms_to_samples(1000)..]
            .iter()
            .fold(0.0_f32, |m, &s| m.max(s.abs()));
        assert!(after > before * 4.0, "step should lift the tail ({} vs {})", before, after);
    }

    #[test]
    fn test_pad_has_no_transients() {
        let spec = PatternSpec::new(Pattern::Pad, 2000);
        let samples = spec.render();
        // Hop-to-hop RMS ratio stays small outside the attack.
        let hop = 256;
        let rms = |w: &[f32]| (w.iter().map(|s| s * s).sum::<f32>() / w.len() as f32).sqrt();
        let mut prev = rms(&samples[8 * hop..9 * hop]);
        for k in 9..(samples.len() / hop) {
            let cur = rms(&samples[k * hop..(k + 1) * hop]);
            assert!(
                cur < prev * 1.6 + 0.01,
                "pad jumped at hop {} ({} -> {})",
                k,
                prev,
                cur
            );
            prev = cur;
        }
    }

    #[test]
    fn test_spec_json_roundtrip() {
        let spec = PatternSpec::new(Pattern::TempoChange { first_bpm: 120.0, second_bpm: 90.0 }, 20_000);
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: PatternSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, spec);
    }
}
