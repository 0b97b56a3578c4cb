// Desktop microphone backend (feature "live")
//
// Stands in for the PDM ISR when running on a host: opens the default cpal
// input device, downmixes to mono, decimates to the pipeline rate, and
// pushes blocks into the sample ring from the audio callback. The callback
// never blocks; a full ring just bumps the overrun counter.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::ring::BlockProducer;
use crate::config::SAMPLE_RATE;
use crate::error::PipelineError;

/// Running input stream; capture stops when this is dropped.
pub struct LiveCapture {
    stream: cpal::Stream,
}

impl LiveCapture {
    /// Open the default input device and start feeding the ring.
    pub fn start(mut producer: BlockProducer) -> Result<Self, PipelineError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| PipelineError::StreamOpenFailed {
                reason: "no default input device".to_string(),
            })?;

        let config = device
            .default_input_config()
            .map_err(|e| PipelineError::StreamOpenFailed {
                reason: format!("no default input config: {:?}", e),
            })?;

        let stream_config: cpal::StreamConfig = config.clone().into();
        let channels = stream_config.channels as usize;
        let device_rate = stream_config.sample_rate.0;

        if device_rate % SAMPLE_RATE != 0 {
            return Err(PipelineError::StreamOpenFailed {
                reason: format!(
                    "device rate {} Hz is not an integer multiple of {} Hz",
                    device_rate, SAMPLE_RATE
                ),
            });
        }
        let decimate = (device_rate / SAMPLE_RATE) as usize;
        log::info!(
            "[Capture] live input at {} Hz, {} ch, decimating by {}",
            device_rate,
            channels,
            decimate
        );

        let err_fn = |err| log::error!("[Capture] input stream error: {}", err);

        let mut phase: usize = 0;
        let mut mono: Vec<f32> = Vec::with_capacity(1024);

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        mono.clear();
                        for frame in data.chunks(channels) {
                            if phase == 0 {
                                mono.push(frame.first().copied().unwrap_or(0.0));
                            }
                            phase = (phase + 1) % decimate;
                        }
                        producer.push_block(&mono);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| PipelineError::StreamOpenFailed {
                    reason: format!("{:?}", e),
                })?,
            other => {
                return Err(PipelineError::StreamOpenFailed {
                    reason: format!("unsupported input sample format {:?}", other),
                })
            }
        };

        stream.play().map_err(|e| PipelineError::StreamFailure {
            reason: format!("input start failed: {}", e),
        })?;

        Ok(Self { stream })
    }

    /// Stop capturing.
    pub fn stop(self) {
        drop(self.stream);
    }
}
