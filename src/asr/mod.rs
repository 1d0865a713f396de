//! `ASRSession`: a streaming speech-recognition session with an external
//! provider.

pub mod provider;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::pipeline::messages::{AudioFrame, Transcript};

pub use provider::WebSocketAsrSession;

/// A streaming recognition session. Implementations own their provider
/// connection; [`crate::pipeline::orchestrator::Pipeline`] only ever
/// depends on this trait, never a concrete provider.
#[async_trait]
pub trait AsrSession: Send {
    /// Push a capture frame. Non-blocking; implementations may coalesce
    /// frames internally if the provider requires larger windows.
    fn send(&self, frame: AudioFrame) -> Result<()>;

    /// The channel of `Transcript` events for this session. Closes once
    /// any in-flight final has been emitted after `close()`.
    fn events(&mut self) -> &mut mpsc::Receiver<Transcript>;

    /// Ask the provider to emit a final transcript for whatever has been
    /// sent so far.
    async fn flush(&self) -> Result<()>;

    /// Terminate the session.
    async fn close(&self) -> Result<()>;
}
