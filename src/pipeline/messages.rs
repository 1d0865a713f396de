//! Data model shared between pipeline stages.
//!
//! These types are the wire format between tasks, not between processes:
//! everything here moves through bounded `tokio::sync::mpsc` channels owned
//! by [`crate::pipeline::orchestrator`].

use std::time::Instant;

/// Monotonically increasing id of one user→assistant turn.
///
/// Every artifact produced while a turn is active (transcripts, tokens,
/// utterances, audio frames) carries this id so a stage can tell whether a
/// frame still belongs to the orchestrator's current turn.
pub type TurnId = u64;

/// Sample layout of an [`AudioFrame`]. The pipeline only ever produces
/// signed 16-bit or float32 PCM; providers are free to convert at their
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    F32,
}

impl Default for SampleFormat {
    fn default() -> Self {
        SampleFormat::S16Le
    }
}

/// An immutable span of linear PCM audio.
///
/// Capture frames are produced at a fixed cadence (default 10 ms). Playback
/// frames may be at a different rate. The declared sample count always
/// equals `samples.len() / channels as usize`.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub samples: Vec<f32>,
    pub capture_monotonic_time: Instant,
    /// The turn this frame belongs to, if produced downstream of a turn
    /// (capture frames predate turn assignment and use `None`).
    pub turn_id: Option<TurnId>,
}

impl AudioFrame {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: SampleFormat::F32,
            samples,
            capture_monotonic_time: Instant::now(),
            turn_id: None,
        }
    }

    pub fn frame_len(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn with_turn(mut self, turn_id: TurnId) -> Self {
        self.turn_id = Some(turn_id);
        self
    }
}

/// One event in the monotonically increasing sequence an [`crate::asr::AsrSession`]
/// produces for an utterance.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    /// Monotonic per-utterance sequence number. Once a sequence is emitted
    /// as final, no later transcript may reuse it.
    pub server_sequence: u64,
    pub start_time: Instant,
    pub end_time: Instant,
}

/// A text fragment from the LLM stream.
#[derive(Debug, Clone)]
pub struct Token {
    pub text: String,
    pub index: u64,
}

/// A sanitized, TTS-ready phrase produced by [`crate::pipeline::sanitizer::TextSanitizer`].
#[derive(Debug, Clone)]
pub struct Utterance {
    pub text: String,
    pub is_terminal: bool,
}

/// A turn-tagged chat message stored in conversation history.
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub role: Role,
    pub text: String,
    pub turn_id: TurnId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// The orchestrator's turn state machine. See
/// [`crate::pipeline::orchestrator`] for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Listening,
    Recognizing,
    Generating,
    Speaking,
    Draining,
    Cancelling,
    Completed,
    Failed,
}

/// Why a turn left the active state machine early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    BargeIn,
    Explicit,
}

/// Outcome of a finished turn, reported on the orchestrator's status channel.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed,
    Cancelled(CancelReason),
    Failed(String),
}
