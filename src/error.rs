//! Error types for the voice pipeline.

/// Top-level error type for the pipeline and its provider adapters.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// The requested input or output device could not be acquired.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// The capture stream failed unrecoverably.
    #[error("capture failed: {0}")]
    CaptureFailed(String),

    /// AEC processor failed to initialize or faulted during operation.
    /// Callers degrade to pass-through rather than propagate this.
    #[error("AEC error: {0}")]
    Aec(String),

    /// ASR session error (transient, see `ASRAuthFailed` for fatal auth errors).
    #[error("ASR error: {0}")]
    Asr(String),

    /// ASR provider rejected credentials or quota.
    #[error("ASR authentication failed: {0}")]
    AsrAuthFailed(String),

    /// LLM stream ended early with a partially delivered token stream;
    /// tokens already delivered remain valid.
    #[error("LLM interrupted: {0}")]
    LlmInterrupted(String),

    /// LLM provider fatal error (auth, quota, malformed request).
    #[error("LLM failed: {0}")]
    LlmFailed(String),

    /// No token arrived before the first-token deadline.
    #[error("LLM first-token timeout")]
    LlmTimeout,

    /// TTS provider fatal error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// No audio arrived before the first-frame deadline.
    #[error("TTS first-frame timeout")]
    TtsTimeout,

    /// Memory store error.
    #[error("memory error: {0}")]
    Memory(String),

    /// Role configuration error.
    #[error("role config error: {0}")]
    Role(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Configuration error: missing credentials, unresolvable device names.
    /// Fatal at startup, never raised from inside a turn.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
