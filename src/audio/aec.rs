//! `AECProcessor`: echo-cancelled capture frames from a capture + reference
//! pair.
//!
//! Two deployment modes are supported: [`AecMode::Aggregate`], where the
//! capture device already interleaves `{microphone, reference}` in one
//! frame, and [`AecMode::Software`], where reference audio arrives
//! separately (from [`crate::audio::playback::PlaybackHandle::reference_tap`])
//! and is matched to capture frames by timestamp. Software mode is known
//! to be less stable than aggregate mode; this processor is a best-effort
//! cleanup pass, not the guarantee against self-triggering — that guarantee
//! is [`crate::pipeline::barge_in::BargeInController`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fdaf_aec::FdafAec;

use crate::audio::playback::ReferenceFrame;
use crate::config::{AecConfig, NoiseSuppressionLevel};
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{AudioFrame, SampleFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AecMode {
    /// Capture frames already carry `{microphone, reference}` channels.
    Aggregate,
    /// Reference audio arrives independently via a [`ReferenceHandle`].
    Software,
}

/// A timestamped ring buffer of reference samples, fed by the playback
/// reference tap and drained by timestamp alignment rather than plain FIFO
/// order, so a capture frame can select the reference sample that was
/// actually playing `stream_delay_ms` before it was captured.
struct TimestampedReferenceBuffer {
    inner: Mutex<VecDeque<(Instant, f32)>>,
    capacity: usize,
}

impl TimestampedReferenceBuffer {
    fn new(capture_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            // Keep 2s of headroom so drain_for never starves on a slow reference feed.
            capacity: (capture_rate as usize * 2).max(1),
        })
    }

    fn push(&self, frame: &ReferenceFrame) {
        if frame.samples.is_empty() {
            return;
        }
        let period = Duration::from_secs_f64(1.0 / frame.sample_rate.max(1) as f64);
        let mut inner = self.inner.lock().expect("reference buffer poisoned");
        for (i, sample) in frame.samples.iter().enumerate() {
            let t = frame.play_out_time + period * i as u32;
            inner.push_back((t, *sample));
        }
        while inner.len() > self.capacity {
            inner.pop_front();
        }
    }

    /// Select `frame_size` reference samples whose play-out timestamp is
    /// `capture_time - stream_delay_ms`. Zero-fills when the reference is
    /// older than the ring (not yet arrived, or already evicted).
    fn drain_for(&self, capture_time: Instant, stream_delay_ms: u32, frame_size: usize) -> Vec<f32> {
        let target = capture_time
            .checked_sub(Duration::from_millis(stream_delay_ms as u64))
            .unwrap_or(capture_time);
        let mut inner = self.inner.lock().expect("reference buffer poisoned");
        let mut out = Vec::with_capacity(frame_size);
        while out.len() < frame_size {
            match inner.front() {
                Some((t, _)) if *t <= target => {
                    out.push(inner.pop_front().unwrap().1);
                }
                _ => out.push(0.0),
            }
        }
        out
    }

    fn clear(&self) {
        self.inner.lock().expect("reference buffer poisoned").clear();
    }
}

/// Write handle for the reference stream, held by whatever task forwards
/// the playback reference tap into the AEC processor.
#[derive(Clone)]
pub struct ReferenceHandle {
    buf: Arc<TimestampedReferenceBuffer>,
}

impl ReferenceHandle {
    pub fn push(&self, frame: &ReferenceFrame) {
        self.buf.push(frame);
    }

    pub fn clear(&self) {
        self.buf.clear();
    }
}

/// One-pole high-pass filter state, applied per channel.
#[derive(Default)]
struct HighPassState {
    prev_in: f32,
    prev_out: f32,
}

const HIGH_PASS_ALPHA: f32 = 0.97;

impl HighPassState {
    fn apply(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            let out = HIGH_PASS_ALPHA * (self.prev_out + *s - self.prev_in);
            self.prev_in = *s;
            self.prev_out = out;
            *s = out;
        }
    }
}

fn apply_noise_suppression(samples: &mut [f32], level: NoiseSuppressionLevel) {
    let floor = match level {
        NoiseSuppressionLevel::Off => return,
        NoiseSuppressionLevel::Low => 0.01,
        NoiseSuppressionLevel::Moderate => 0.02,
        NoiseSuppressionLevel::High => 0.04,
    };
    let rms = rms_of(samples);
    if rms < floor {
        let attenuation = (rms / floor).clamp(0.0, 1.0);
        for s in samples.iter_mut() {
            *s *= attenuation;
        }
    }
}

fn rms_of(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

pub struct AecProcessor {
    filter: FdafAec,
    frame_size: usize,
    mode: AecMode,
    stream_delay_ms: u32,
    noise_suppression: NoiseSuppressionLevel,
    high_pass: Option<HighPassState>,
    reference: Arc<TimestampedReferenceBuffer>,
}

impl AecProcessor {
    /// Construct the processor and, for software mode, the
    /// [`ReferenceHandle`] the caller should feed from the playback
    /// reference tap. Returns `Aec` on an invalid `fft_size`.
    pub fn new(
        config: &AecConfig,
        mode: AecMode,
        capture_rate: u32,
    ) -> Result<(Self, Option<ReferenceHandle>)> {
        if config.fft_size == 0 || !config.fft_size.is_power_of_two() {
            return Err(VoiceError::Aec(format!(
                "fft_size must be a nonzero power of two, got {}",
                config.fft_size
            )));
        }
        let frame_size = config.fft_size / 2;
        let filter = FdafAec::new(config.fft_size, config.step_size);
        let reference = TimestampedReferenceBuffer::new(capture_rate);

        let handle = match mode {
            AecMode::Software => Some(ReferenceHandle {
                buf: reference.clone(),
            }),
            AecMode::Aggregate => None,
        };

        Ok((
            Self {
                filter,
                frame_size,
                mode,
                stream_delay_ms: config.stream_delay_ms,
                noise_suppression: config.noise_suppression,
                high_pass: config.high_pass_filter.then(HighPassState::default),
                reference,
            },
            handle,
        ))
    }

    /// Run echo cancellation (and, if configured, noise suppression /
    /// high-pass filtering) over one capture frame, returning a
    /// mono frame of the same cadence.
    pub fn process(&mut self, frame: AudioFrame) -> AudioFrame {
        let mut mic = match self.mode {
            AecMode::Aggregate => {
                // Channels are interleaved {mic, reference}; slice them apart.
                if frame.channels < 2 {
                    frame.samples.clone()
                } else {
                    frame
                        .samples
                        .chunks(frame.channels as usize)
                        .map(|c| c[0])
                        .collect::<Vec<_>>()
                }
            }
            AecMode::Software => frame.samples.clone(),
        };

        let reference_frames: Vec<f32> = match self.mode {
            AecMode::Aggregate => frame
                .samples
                .chunks(frame.channels as usize)
                .map(|c| c[1])
                .collect(),
            AecMode::Software => Vec::new(),
        };

        let mut out = Vec::with_capacity(mic.len());
        let mut offset = 0;
        while offset + self.frame_size <= mic.len() {
            let mic_window = &mic[offset..offset + self.frame_size];
            let ref_window = match self.mode {
                AecMode::Aggregate => reference_frames[offset..offset + self.frame_size].to_vec(),
                AecMode::Software => self.reference.drain_for(
                    frame.capture_monotonic_time,
                    self.stream_delay_ms,
                    self.frame_size,
                ),
            };
            out.extend(self.filter.process(&ref_window, mic_window));
            offset += self.frame_size;
        }
        // Sub-frame remainder is passed through unmodified.
        out.extend_from_slice(&mic[offset..]);
        mic.clear();

        apply_noise_suppression(&mut out, self.noise_suppression);
        if let Some(hp) = self.high_pass.as_mut() {
            hp.apply(&mut out);
        }

        AudioFrame {
            sample_rate: frame.sample_rate,
            channels: 1,
            sample_format: SampleFormat::F32,
            samples: out,
            capture_monotonic_time: frame.capture_monotonic_time,
            turn_id: frame.turn_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> AecConfig {
        AecConfig {
            enabled: true,
            fft_size: 256,
            step_size: 0.1,
            stream_delay_ms: 20,
            noise_suppression: NoiseSuppressionLevel::Off,
            high_pass_filter: false,
        }
    }

    fn make_frame(samples: Vec<f32>, channels: u16) -> AudioFrame {
        AudioFrame {
            sample_rate: 16_000,
            channels,
            sample_format: SampleFormat::F32,
            samples,
            capture_monotonic_time: Instant::now(),
            turn_id: None,
        }
    }

    #[test]
    fn invalid_fft_size_returns_error() {
        let mut config = default_config();
        config.fft_size = 100;
        assert!(AecProcessor::new(&config, AecMode::Software, 16_000).is_err());
    }

    #[test]
    fn zero_fft_size_returns_error() {
        let mut config = default_config();
        config.fft_size = 0;
        assert!(AecProcessor::new(&config, AecMode::Software, 16_000).is_err());
    }

    #[test]
    fn software_mode_zero_fills_missing_reference() {
        let config = default_config();
        let (mut aec, handle) = AecProcessor::new(&config, AecMode::Software, 16_000).unwrap();
        assert!(handle.is_some());
        let frame = make_frame(vec![0.1; 256], 1);
        let out = aec.process(frame);
        assert_eq!(out.samples.len(), 256);
        assert_eq!(out.channels, 1);
    }

    #[test]
    fn aggregate_mode_slices_interleaved_channels() {
        let config = default_config();
        let (mut aec, handle) = AecProcessor::new(&config, AecMode::Aggregate, 16_000).unwrap();
        assert!(handle.is_none());
        let interleaved: Vec<f32> = (0..512)
            .map(|i| if i % 2 == 0 { 0.3 } else { 0.3 })
            .collect();
        let frame = make_frame(interleaved, 2);
        let out = aec.process(frame);
        assert_eq!(out.samples.len(), 256);
    }

    #[test]
    fn sub_frame_remainder_passed_through() {
        let config = default_config();
        let (mut aec, _) = AecProcessor::new(&config, AecMode::Software, 16_000).unwrap();
        let frame = make_frame(vec![0.2; 300], 1);
        let out = aec.process(frame);
        // 256-sample window processed + 44-sample remainder passed through.
        assert_eq!(out.samples.len(), 300);
    }

    #[test]
    fn reference_buffer_zero_fills_when_empty() {
        let buf = TimestampedReferenceBuffer::new(16_000);
        let out = buf.drain_for(Instant::now(), 20, 10);
        assert_eq!(out, vec![0.0; 10]);
    }

    #[test]
    fn reference_buffer_caps_capacity() {
        let buf = TimestampedReferenceBuffer::new(100);
        let frame = ReferenceFrame {
            samples: vec![1.0; 1000],
            sample_rate: 100,
            play_out_time: Instant::now(),
        };
        buf.push(&frame);
        assert!(buf.inner.lock().unwrap().len() <= 200);
    }

    #[test]
    fn high_pass_state_attenuates_dc_offset() {
        let mut hp = HighPassState::default();
        let mut samples = vec![1.0; 64];
        hp.apply(&mut samples);
        // A constant-offset input should decay toward zero under a
        // high-pass filter.
        assert!(samples.last().unwrap().abs() < 1.0);
    }
}
