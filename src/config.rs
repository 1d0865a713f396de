//! Pipeline configuration.
//!
//! `PipelineConfig` is loaded from a TOML file (or built programmatically)
//! and handed to [`crate::pipeline::orchestrator::Pipeline`] at
//! construction. Every nested struct derives `Default` and is marked
//! `#[serde(default)]` so a config file only needs to override the fields
//! it cares about.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub audio: AudioConfig,
    pub aec: AecConfig,
    pub asr: AsrConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub barge_in: BargeInConfig,
    pub timeouts: TimeoutsConfig,
    pub memory: MemoryConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any field the file does not set.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| crate::VoiceError::Config(format!("invalid config at {path:?}: {e}")))
    }
}

/// Audio device and frame-cadence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz.
    pub input_sample_rate: u32,
    /// Playback sample rate in Hz.
    pub output_sample_rate: u32,
    /// Capture frame period in milliseconds (default 10 ms).
    pub frame_period_ms: u32,
    /// Named input device, or `None` for the host default.
    pub input_device: Option<String>,
    /// Named output device, or `None` for the host default.
    pub output_device: Option<String>,
    /// Whether the input device is an aggregate device carrying
    /// `{microphone, reference}` interleaved channels (hardware AEC mode).
    pub aggregate_device: bool,
    /// Playback buffer watermark in milliseconds before `submit()` applies
    /// back-pressure.
    pub playback_watermark_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_period_ms: 10,
            input_device: None,
            output_device: None,
            aggregate_device: false,
            playback_watermark_ms: 200,
        }
    }
}

/// Noise suppression aggressiveness for the AEC processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseSuppressionLevel {
    Off,
    Low,
    Moderate,
    High,
}

impl Default for NoiseSuppressionLevel {
    fn default() -> Self {
        NoiseSuppressionLevel::Moderate
    }
}

/// Acoustic echo cancellation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AecConfig {
    pub enabled: bool,
    /// FFT size for the adaptive filter; must be a power of two.
    pub fft_size: usize,
    pub step_size: f32,
    /// Expected round-trip delay from reference submission to echoed
    /// microphone capture, used by software-mode reference selection.
    pub stream_delay_ms: u32,
    pub noise_suppression: NoiseSuppressionLevel,
    pub high_pass_filter: bool,
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fft_size: 1024,
            step_size: 0.05,
            stream_delay_ms: 40,
            noise_suppression: NoiseSuppressionLevel::default(),
            high_pass_filter: true,
        }
    }
}

/// ASR provider connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub sample_rate: u32,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://example-asr.invalid/v1/stream".to_owned(),
            model: "realtime-transcribe-v1".to_owned(),
            api_key: None,
            sample_rate: 16_000,
        }
    }
}

/// LLM provider connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible `/v1/chat/completions` base URL.
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    /// Number of most-recent conversation messages kept in history
    /// (default 20).
    pub max_history_messages: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434/v1".to_owned(),
            api_key: None,
            model: "default".to_owned(),
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 0.95,
            max_history_messages: 20,
        }
    }
}

/// TTS provider connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub endpoint: String,
    pub voice: String,
    pub api_key: Option<String>,
    pub sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://example-tts.invalid/v1/stream".to_owned(),
            voice: "default".to_owned(),
            api_key: None,
            sample_rate: 24_000,
        }
    }
}

/// Barge-in detection tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    pub enabled: bool,
    /// Minimum trimmed ASR event length (Unicode codepoints) that counts as
    /// the start of a new user utterance.
    pub barge_in_min_chars: usize,
    /// When software AEC is active, suppress events arriving within this
    /// many milliseconds of the most recent submitted playback frame.
    pub barge_in_grace_ms: u32,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            barge_in_min_chars: 2,
            barge_in_grace_ms: 200,
        }
    }
}

/// Stage timeout tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Time after the last voiced frame with no ASR final before the
    /// orchestrator forces `flush()`.
    pub asr_final_timeout_ms: u64,
    /// Time after `LLMStream::open` with no token before `LLMTimeout`.
    pub llm_first_token_timeout_ms: u64,
    /// Time after the first `send_text` with no audio before `TTSTimeout`.
    pub tts_first_frame_timeout_ms: u64,
    /// Deadline applied to `MemoryStore` calls.
    pub memory_call_timeout_ms: u64,
    /// Upper bound the pipeline stop sequence is allowed to take.
    pub stop_timeout_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            asr_final_timeout_ms: 8_000,
            llm_first_token_timeout_ms: 10_000,
            tts_first_frame_timeout_ms: 3_000,
            memory_call_timeout_ms: 500,
            stop_timeout_ms: 2_000,
        }
    }
}

/// File-backed `MemoryStore` adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub root_dir: PathBuf,
    pub recall_limit: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_dir: default_memory_root_dir(),
            recall_limit: 5,
        }
    }
}

fn default_memory_root_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("voiced")
        .join("memory")
}
