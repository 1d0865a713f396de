//! `AudioCapture`: owns the input device, emits [`AudioFrame`]s.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{AudioFrame, SampleFormat};

/// Channel capacity target: roughly 2x one frame period of buffering.
fn channel_capacity(frame_period_ms: u32) -> usize {
    ((40 / frame_period_ms.max(1)) as usize).max(4)
}

pub struct AudioCapture {
    device: cpal::Device,
    native_config: cpal::StreamConfig,
    native_rate: u32,
    native_channels: u16,
    config: AudioConfig,
}

impl AudioCapture {
    /// Resolve the configured (or default) input device. Returns
    /// `DeviceBusy` if no matching device exists or its default config
    /// cannot be read.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = match &config.input_device {
            Some(name) => host
                .input_devices()
                .map_err(|e| VoiceError::DeviceBusy(e.to_string()))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| VoiceError::DeviceBusy(format!("input device '{name}' not found")))?,
            None => host
                .default_input_device()
                .ok_or_else(|| VoiceError::DeviceBusy("no default input device".into()))?,
        };

        let supported = device
            .default_input_config()
            .map_err(|e| VoiceError::DeviceBusy(e.to_string()))?;
        let native_rate = supported.sample_rate();
        let native_channels = supported.channels();

        debug!(
            native_rate,
            native_channels, target_rate = config.input_sample_rate, "resolved input device"
        );

        Ok(Self {
            device,
            native_config: supported.config(),
            native_rate,
            native_channels,
            config: config.clone(),
        })
    }

    /// Begin producing frames on a fresh channel. The returned receiver
    /// closes once `cancel` is triggered and the stream has been torn
    /// down; `stop()` is simply `cancel.cancel()`, which is idempotent.
    pub async fn start(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<AudioFrame>> {
        let out_channels: u16 = if self.config.aggregate_device { 2 } else { 1 };
        let frame_len = (self.config.input_sample_rate * self.config.frame_period_ms / 1000)
            .max(1) as usize;
        let (tx, rx) = mpsc::channel(channel_capacity(self.config.frame_period_ms));

        let native_rate = self.native_rate;
        let native_channels = self.native_channels;
        let target_rate = self.config.input_sample_rate;
        let aggregate = self.config.aggregate_device;

        let stream_config = self.native_config.clone();
        let device = self.device.clone();

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        // The cpal stream and its callback closures are not `Send`-safe to
        // hold across an await point in this task, so build and run it on
        // a dedicated blocking thread that outlives `start()` but not the
        // cancellation token.
        tokio::task::spawn_blocking(move || {
            let mut resample_buf: Vec<VecDeque<f32>> =
                (0..out_channels).map(|_| VecDeque::new()).collect();
            let mut dropped: u64 = 0;
            let mut last_log = Instant::now();

            let err_fn = |e| warn!("capture stream error: {e}");

            let stream_result = device.build_input_stream(
                &stream_config,
                move |data: &[f32], _| {
                    let captured_at = Instant::now();
                    let frames_in = if native_channels == 0 {
                        0
                    } else {
                        data.len() / native_channels as usize
                    };

                    for ch in 0..out_channels as usize {
                        let src_ch = if aggregate {
                            ch.min(native_channels as usize - 1)
                        } else {
                            0
                        };
                        let mut mono = Vec::with_capacity(frames_in);
                        for i in 0..frames_in {
                            if aggregate {
                                mono.push(data[i * native_channels as usize + src_ch]);
                            } else {
                                // Downmix all native channels to mono.
                                let mut sum = 0.0f32;
                                for c in 0..native_channels as usize {
                                    sum += data[i * native_channels as usize + c];
                                }
                                mono.push(sum / native_channels.max(1) as f32);
                            }
                        }
                        let resampled = if native_rate == target_rate {
                            mono
                        } else {
                            downsample(&mono, native_rate, target_rate)
                        };
                        resample_buf[ch].extend(resampled);
                    }

                    while resample_buf[0].len() >= frame_len {
                        let mut interleaved = Vec::with_capacity(frame_len * out_channels as usize);
                        for i in 0..frame_len {
                            for ch in 0..out_channels as usize {
                                interleaved.push(resample_buf[ch][i]);
                            }
                        }
                        for buf in resample_buf.iter_mut() {
                            buf.drain(..frame_len);
                        }

                        let frame = AudioFrame {
                            sample_rate: target_rate,
                            channels: out_channels,
                            sample_format: SampleFormat::F32,
                            samples: interleaved,
                            capture_monotonic_time: captured_at,
                            turn_id: None,
                        };

                        match tx.try_send(frame) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                dropped += 1;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {}
                        }
                    }

                    if dropped > 0 && last_log.elapsed() > Duration::from_secs(2) {
                        warn!(dropped, "capture channel applying back-pressure, frames dropped");
                        last_log = Instant::now();
                    }
                },
                err_fn,
                None,
            );

            let stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::CaptureFailed(e.to_string())));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(VoiceError::CaptureFailed(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Keep the stream alive until cancellation; cpal streams stop
            // producing callbacks once dropped.
            while !cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(20));
            }
            drop(stream);
        });

        ready_rx
            .await
            .map_err(|_| VoiceError::CaptureFailed("capture thread exited before ready".into()))??;

        Ok(rx)
    }

    pub fn list_input_devices() -> Vec<String> {
        let host = cpal::default_host();
        host.input_devices()
            .map(|it| it.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default()
    }
}

/// Linear-interpolation resampler, adequate for the narrow-band speech
/// rates this pipeline deals in.
fn downsample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if input.is_empty() || from_rate == to_rate {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos.floor() as usize;
        let frac = (src_pos - idx as f64) as f32;
        let a = input[idx.min(input.len() - 1)];
        let b = input[(idx + 1).min(input.len() - 1)];
        out.push(a + (b - a) * frac);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsample_same_rate_is_noop() {
        let input = vec![1.0, 2.0, 3.0];
        assert_eq!(downsample(&input, 16_000, 16_000), input);
    }

    #[test]
    fn downsample_empty() {
        assert!(downsample(&[], 48_000, 16_000).is_empty());
    }

    #[test]
    fn downsample_halves_length_at_2x_ratio() {
        let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = downsample(&input, 32_000, 16_000);
        assert_eq!(out.len(), 50);
    }
}
