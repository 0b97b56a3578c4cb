// Window assembly - turns the raw sample stream into overlapped windows
//
// `next_window` is the analysis task's only suspension point. Each call
// shifts the rolling window left by one hop and fills the tail with fresh
// samples, so consecutive windows overlap by WINDOW - HOP samples. Window
// timestamps advance by exactly HOP_MS per window, including windows that
// were dropped to catch up, so downstream timestamps never drift.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::ring::SampleConsumer;
use crate::config::{HOP_MS, HOP_SIZE, WINDOW_SIZE};

/// How long the reader naps while waiting for the ring to fill.
const POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Consecutive dropped windows that raise the pipeline-overrun flag.
const OVERRUN_DROPS: u32 = 4;

/// Per-window capture bookkeeping delivered alongside the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStatus {
    /// Milliseconds since boot for the start of this window's newest hop.
    pub timestamp_ms: u64,
    /// False while the dead-input latch is set (only zeros for too long).
    pub alive: bool,
    /// Total windows discarded to catch up since startup.
    pub dropped_windows: u64,
    /// True when at least OVERRUN_DROPS windows were just dropped in a row.
    pub overrun: bool,
    /// Producer-side samples lost to a full ring since startup.
    pub ring_overruns: u64,
}

/// Assembles overlapped analysis windows from the sample ring.
pub struct WindowReader {
    consumer: SampleConsumer,
    window: Vec<f32>,
    hop: Vec<f32>,
    hop_index: u64,
    dropped: u64,
    consecutive_drops: u32,
    zero_ms: u64,
    dead: bool,
    dead_input_ms: u64,
    shutdown: Arc<AtomicBool>,
}

impl WindowReader {
    pub fn new(consumer: SampleConsumer, dead_input_ms: u64, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            consumer,
            window: vec![0.0; WINDOW_SIZE],
            hop: vec![0.0; HOP_SIZE],
            hop_index: 0,
            dropped: 0,
            consecutive_drops: 0,
            zero_ms: 0,
            dead: false,
            dead_input_ms,
            shutdown,
        }
    }

    /// Block until a full window is available and return it with its status.
    ///
    /// Returns `None` when the shutdown flag is set or the producer is gone
    /// and the ring cannot supply another hop.
    pub fn next_window(&mut self) -> Option<(&[f32], WindowStatus)> {
        self.catch_up();

        while self.consumer.available() < HOP_SIZE {
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            if self.consumer.is_abandoned() && self.consumer.available() < HOP_SIZE {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        self.pop_hop();
        self.track_dead_input();

        self.window.copy_within(HOP_SIZE.., 0);
        self.window[WINDOW_SIZE - HOP_SIZE..].copy_from_slice(&self.hop);

        let status = WindowStatus {
            timestamp_ms: self.hop_index * HOP_MS,
            alive: !self.dead,
            dropped_windows: self.dropped,
            overrun: self.consecutive_drops >= OVERRUN_DROPS,
            ring_overruns: self.consumer.shared.overruns(),
        };
        self.hop_index += 1;
        self.consecutive_drops = 0;
        Some((&self.window, status))
    }

    /// Discard backlog when the analysis task has fallen behind.
    ///
    /// Dropped windows still advance the hop counter so timestamps stay on
    /// the HOP_MS grid.
    fn catch_up(&mut self) {
        while self.consumer.available() >= 2 * WINDOW_SIZE {
            self.pop_hop();
            self.track_dead_input();
            self.hop_index += 1;
            self.dropped += 1;
            self.consecutive_drops += 1;
            if self.consecutive_drops == OVERRUN_DROPS {
                log::warn!(
                    "[Capture] analysis behind, dropped {} windows in a row",
                    self.consecutive_drops
                );
            }
        }
    }

    fn pop_hop(&mut self) {
        for slot in self.hop.iter_mut() {
            *slot = self.consumer.consumer.pop().unwrap_or(0.0);
        }
    }

    /// Latch the dead-input flag after a run of pure zeros; any non-zero
    /// sample releases it.
    fn track_dead_input(&mut self) {
        if self.hop.iter().any(|&s| s != 0.0) {
            if self.dead {
                log::info!("[Capture] input recovered after {} ms of silence", self.zero_ms);
            }
            self.dead = false;
            self.zero_ms = 0;
        } else {
            self.zero_ms = self.zero_ms.saturating_add(HOP_MS);
            if !self.dead && self.zero_ms >= self.dead_input_ms {
                log::warn!("[Capture] no signal for {} ms, flagging dead input", self.zero_ms);
                self.dead = true;
            }
        }
    }

    pub fn dropped_windows(&self) -> u64 {
        self.dropped
    }
}
