//! `LLMStream`: one-shot streaming chat completion with an external
//! provider.

pub mod provider;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::pipeline::messages::{ConversationMessage, Token};

pub use provider::OpenAiChatStream;

/// A tool call the model asked to make, carried in the `End` event of an
/// [`LlmEvent`] stream. Tool execution itself is out of scope; the
/// orchestrator treats a non-empty `tool_calls` list as a same-`TurnId`
/// restart point.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One event from an open [`LlmStream`].
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Token(Token),
    /// Terminal event. Non-empty `tool_calls` signals the orchestrator
    /// should execute them and re-open the stream as a continuation of the
    /// same turn.
    End { tool_calls: Vec<ToolCall> },
}

/// Parameters sourced from [`crate::config::LlmConfig`] at open time.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

#[async_trait]
pub trait LlmStream: Send + Sync {
    /// Open a streaming chat completion. Triggering `cancel` must stop the
    /// network read within <= 100 ms and release the connection.
    async fn open(
        &self,
        messages: &[ConversationMessage],
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<tokio::sync::mpsc::Receiver<LlmEvent>>;
}
