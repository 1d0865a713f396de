//! `TTSSession`: incremental text-to-speech with an external provider.

pub mod provider;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::pipeline::messages::AudioFrame;

pub use provider::WebSocketTtsSession;

#[async_trait]
pub trait TtsSession: Send {
    /// Enqueue a text fragment for synthesis; the session may buffer
    /// until a sentence boundary.
    async fn send_text(&self, utterance: &str) -> Result<()>;

    /// The channel of synthesized [`AudioFrame`]s. Begins emitting as soon
    /// as the provider returns the first audio.
    fn frames(&mut self) -> &mut mpsc::Receiver<AudioFrame>;

    /// Signal no more text will arrive; the session emits all remaining
    /// audio and closes `frames()`.
    async fn finish(&self) -> Result<()>;

    /// Cancel immediately; `frames()` closes with no guarantee about
    /// unemitted audio.
    async fn abort(&self) -> Result<()>;
}
