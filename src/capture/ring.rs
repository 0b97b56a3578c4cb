// Sample ring - lock-free SPSC transport from the capture ISR
//
// One rtrb ring of f32 samples plus a small shared block of atomics: the
// overrun counter (samples the producer could not place) and the hardware
// gain cell the AGC writes and the capture driver reads. Single producer,
// single consumer, no locks.

use rtrb::{Consumer, Producer, RingBuffer};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Counters and the gain cell shared between both ends of the ring.
#[derive(Debug, Default)]
pub struct CaptureShared {
    overruns: AtomicU64,
    gain: AtomicU8,
}

impl CaptureShared {
    /// Samples dropped on the producer side because the ring was full.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Hardware gain index the capture driver should apply.
    pub fn gain(&self) -> u8 {
        self.gain.load(Ordering::Relaxed)
    }

    /// Update the hardware gain index (called by the AGC at window boundaries).
    pub fn set_gain(&self, index: u8) {
        self.gain.store(index, Ordering::Relaxed);
    }
}

/// Producer half, owned by the capture interrupt / audio callback.
pub struct BlockProducer {
    producer: Producer<f32>,
    shared: Arc<CaptureShared>,
}

impl BlockProducer {
    /// Push a block of float samples, counting whatever does not fit.
    ///
    /// Never blocks; bounded time per call. Returns the number written.
    pub fn push_block(&mut self, samples: &[f32]) -> usize {
        let mut written = 0;
        for &sample in samples {
            if self.producer.push(sample).is_err() {
                break;
            }
            written += 1;
        }
        let lost = samples.len() - written;
        if lost > 0 {
            self.shared.overruns.fetch_add(lost as u64, Ordering::Relaxed);
        }
        written
    }

    /// Push a block of raw 16-bit ADC samples.
    pub fn push_block_i16(&mut self, samples: &[i16]) -> usize {
        let mut written = 0;
        for &sample in samples {
            let value = sample as f32 / 32768.0;
            if self.producer.push(value).is_err() {
                break;
            }
            written += 1;
        }
        let lost = samples.len() - written;
        if lost > 0 {
            self.shared.overruns.fetch_add(lost as u64, Ordering::Relaxed);
        }
        written
    }

    /// Current hardware gain index, for the driver to program the amplifier.
    pub fn gain(&self) -> u8 {
        self.shared.gain()
    }

    pub fn shared(&self) -> Arc<CaptureShared> {
        Arc::clone(&self.shared)
    }
}

/// Consumer half, owned by the analysis task's window reader.
pub struct SampleConsumer {
    pub(crate) consumer: Consumer<f32>,
    pub(crate) shared: Arc<CaptureShared>,
}

impl SampleConsumer {
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }

    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }

    pub fn shared(&self) -> Arc<CaptureShared> {
        Arc::clone(&self.shared)
    }
}

/// Create a connected producer/consumer pair over a ring of `capacity` samples.
pub fn sample_ring(capacity: usize) -> (BlockProducer, SampleConsumer) {
    let (producer, consumer) = RingBuffer::new(capacity);
    let shared = Arc::new(CaptureShared::default());
    (
        BlockProducer {
            producer,
            shared: Arc::clone(&shared),
        },
        SampleConsumer { consumer, shared },
    )
}
