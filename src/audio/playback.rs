//! `AudioPlayback`: owns the output device, supports streaming submission
//! with back-pressure and immediate abort.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::AudioFrame;

/// A mirrored copy of a frame submitted to the device, tagged with its
/// intended play-out timestamp. Feeds [`crate::audio::aec::AecProcessor`]
/// in the software-AEC deployment mode.
#[derive(Debug, Clone)]
pub struct ReferenceFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub play_out_time: Instant,
}

struct SharedBuffer {
    samples: VecDeque<f32>,
    last_write: Option<Instant>,
    /// Bumped on every `abort()`; a `submit()` in flight when this changes
    /// discards its write instead of appending to the newly-cleared buffer.
    epoch: u64,
}

pub struct AudioPlayback {
    device: cpal::Device,
    stream_config: cpal::StreamConfig,
    sample_rate: u32,
    watermark_samples: usize,
}

pub struct PlaybackHandle {
    state: Arc<Mutex<SharedBuffer>>,
    epoch: Arc<AtomicU64>,
    stream: cpal::Stream,
    watermark_samples: usize,
    reference_tx: broadcast::Sender<ReferenceFrame>,
    sample_rate: u32,
}

impl AudioPlayback {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = match &config.output_device {
            Some(name) => host
                .output_devices()
                .map_err(|e| VoiceError::DeviceBusy(e.to_string()))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| {
                    VoiceError::DeviceBusy(format!("output device '{name}' not found"))
                })?,
            None => host
                .default_output_device()
                .ok_or_else(|| VoiceError::DeviceBusy("no default output device".into()))?,
        };

        let supported = device
            .default_output_config()
            .map_err(|e| VoiceError::DeviceBusy(e.to_string()))?;
        let sample_rate = config.output_sample_rate;
        let watermark_samples =
            (config.playback_watermark_ms * config.output_sample_rate / 1000) as usize;

        Ok(Self {
            device,
            stream_config: supported.config(),
            sample_rate,
            watermark_samples,
        })
    }

    /// Bring up the output stream. The stream plays silence whenever the
    /// shared buffer is empty and stays open for the lifetime of the
    /// returned handle.
    pub fn start(&self) -> Result<PlaybackHandle> {
        let state = Arc::new(Mutex::new(SharedBuffer {
            samples: VecDeque::new(),
            last_write: None,
            epoch: 0,
        }));
        let epoch = Arc::new(AtomicU64::new(0));
        let (reference_tx, _) = broadcast::channel(256);

        let cb_state = state.clone();
        let native_channels = self.stream_config.channels as usize;
        let err_fn = |e| warn!("playback stream error: {e}");

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _| {
                    let mut buf = cb_state.lock().expect("playback buffer poisoned");
                    let frames_needed = data.len() / native_channels.max(1);
                    for i in 0..frames_needed {
                        let sample = buf.samples.pop_front().unwrap_or(0.0);
                        for c in 0..native_channels {
                            data[i * native_channels + c] = sample;
                        }
                    }
                    if !buf.samples.is_empty() || frames_needed > 0 {
                        buf.last_write = Some(Instant::now());
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| VoiceError::Audio(e.to_string()))?;

        stream.play().map_err(|e| VoiceError::Audio(e.to_string()))?;

        Ok(PlaybackHandle {
            state,
            epoch,
            stream,
            watermark_samples: self.watermark_samples,
            reference_tx,
            sample_rate: self.sample_rate,
        })
    }

    pub fn list_output_devices() -> Vec<String> {
        let host = cpal::default_host();
        host.output_devices()
            .map(|it| it.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default()
    }
}

impl PlaybackHandle {
    /// Enqueue a frame; cooperatively blocks while the buffer is above the
    /// watermark so a slow consumer applies back-pressure to its producer.
    pub async fn submit(&self, frame: AudioFrame) -> Result<()> {
        let my_epoch = self.epoch.load(Ordering::SeqCst);

        loop {
            let len = {
                let buf = self.state.lock().expect("playback buffer poisoned");
                buf.samples.len()
            };
            if len < self.watermark_samples {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.epoch.load(Ordering::SeqCst) != my_epoch {
                // Aborted while we were waiting; drop this frame so it is
                // ordered after the abort.
                return Ok(());
            }
        }

        let play_out_time = Instant::now();
        {
            let mut buf = self.state.lock().expect("playback buffer poisoned");
            if buf.epoch != my_epoch {
                return Ok(());
            }
            buf.samples.extend(frame.samples.iter().copied());
        }

        let _ = self.reference_tx.send(ReferenceFrame {
            samples: frame.samples,
            sample_rate: self.sample_rate,
            play_out_time,
        });

        Ok(())
    }

    /// Wait until the enqueued buffer has drained.
    pub async fn flush(&self) -> Result<()> {
        loop {
            let empty = {
                let buf = self.state.lock().expect("playback buffer poisoned");
                buf.samples.is_empty()
            };
            if empty {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Discard pending frames and silence the device. Idempotent; bumps
    /// the epoch so any `submit()` already in flight is ordered after
    /// this call instead of re-populating the buffer.
    pub fn abort(&self) -> Result<()> {
        let mut buf = self.state.lock().expect("playback buffer poisoned");
        buf.samples.clear();
        buf.epoch = buf.epoch.wrapping_add(1);
        self.epoch.store(buf.epoch, Ordering::SeqCst);
        Ok(())
    }

    /// True iff at least one frame has been written to the device within
    /// the last frame period and the buffer is non-empty.
    pub fn is_playing(&self) -> bool {
        let buf = self.state.lock().expect("playback buffer poisoned");
        if buf.samples.is_empty() {
            return false;
        }
        buf.last_write
            .map(|t| t.elapsed() < Duration::from_millis(50))
            .unwrap_or(false)
    }

    /// Subscribe to the reference tap: every frame submitted to the
    /// device, mirrored with its intended play-out timestamp.
    pub fn reference_tap(&self) -> broadcast::Receiver<ReferenceFrame> {
        self.reference_tx.subscribe()
    }

    pub fn stop(self) {
        drop(self.stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_shared() -> Arc<Mutex<SharedBuffer>> {
        Arc::new(Mutex::new(SharedBuffer {
            samples: VecDeque::new(),
            last_write: None,
            epoch: 0,
        }))
    }

    #[test]
    fn abort_clears_buffer_and_bumps_epoch() {
        let state = make_shared();
        {
            let mut buf = state.lock().unwrap();
            buf.samples.extend([1.0, 2.0, 3.0]);
        }
        let epoch = Arc::new(AtomicU64::new(0));
        {
            let mut buf = state.lock().unwrap();
            buf.samples.clear();
            buf.epoch = buf.epoch.wrapping_add(1);
            epoch.store(buf.epoch, Ordering::SeqCst);
        }
        let buf = state.lock().unwrap();
        assert!(buf.samples.is_empty());
        assert_eq!(buf.epoch, 1);
        assert_eq!(epoch.load(Ordering::SeqCst), 1);
    }
}
