//! `reqwest`-based OpenAI-compatible chat-completions streaming adapter.
//!
//! Built on `reqwest`'s streaming body rather than a blocking client plus
//! a polled `AtomicBool`: an all-async `tokio::select!` against the
//! `CancellationToken` stops the read within one chunk of cancellation
//! without a polling loop.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{GenerationParams, LlmEvent, LlmStream, ToolCall};
use crate::config::LlmConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{ConversationMessage, Role, Token};

pub struct OpenAiChatStream {
    client: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiChatStream {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config: config.clone(),
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.api_url.trim_end_matches('/').trim_end_matches("/v1");
        format!("{base}/v1/chat/completions")
    }

    fn role_str(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[async_trait]
impl LlmStream for OpenAiChatStream {
    async fn open(
        &self,
        messages: &[ConversationMessage],
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        let body = json!({
            "model": self.config.model,
            "messages": messages.iter().map(|m| json!({
                "role": Self::role_str(m.role),
                "content": m.text,
            })).collect::<Vec<_>>(),
            "stream": true,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "max_tokens": params.max_tokens,
        });

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| VoiceError::LlmFailed(format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(VoiceError::LlmFailed(format!(
                "LLM provider rejected credentials: {status}"
            )));
        }
        if !status.is_success() {
            return Err(VoiceError::LlmFailed(format!(
                "LLM provider returned {status}"
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(stream_response(response, tx, cancel));
        Ok(rx)
    }
}

async fn stream_response(
    response: reqwest::Response,
    tx: mpsc::Sender<LlmEvent>,
    cancel: CancellationToken,
) {
    let mut byte_stream = response.bytes_stream();
    // Carries a partial line across chunk boundaries so an SSE event split
    // across two reads still parses correctly.
    let mut carry = String::new();
    let mut index: u64 = 0;
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("LLM stream cancelled");
                return;
            }
            chunk = byte_stream.next() => {
                let Some(chunk) = chunk else {
                    break;
                };
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("LLM stream read error: {e}");
                        break;
                    }
                };
                carry.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = carry.find('\n') {
                    let line = carry[..newline].trim_end_matches('\r').to_string();
                    carry.drain(..=newline);
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        let _ = tx.send(LlmEvent::End { tool_calls: std::mem::take(&mut tool_calls) }).await;
                        return;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    if let Some(delta) = value.pointer("/choices/0/delta") {
                        if let Some(text) = delta.get("content").and_then(Value::as_str) {
                            if !text.is_empty() {
                                let token = Token { text: text.to_owned(), index };
                                index += 1;
                                if tx.send(LlmEvent::Token(token)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                            for call in calls {
                                if let Some(func) = call.get("function") {
                                    let name = func
                                        .get("name")
                                        .and_then(Value::as_str)
                                        .unwrap_or_default()
                                        .to_owned();
                                    let arguments = func
                                        .get("arguments")
                                        .and_then(Value::as_str)
                                        .and_then(|s| serde_json::from_str(s).ok())
                                        .unwrap_or(Value::Null);
                                    tool_calls.push(ToolCall { name, arguments });
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    let _ = tx
        .send(LlmEvent::End {
            tool_calls: std::mem::take(&mut tool_calls),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_v1() {
        let config = LlmConfig {
            api_url: "http://localhost:11434/v1".to_owned(),
            ..LlmConfig::default()
        };
        let stream = OpenAiChatStream::new(&config);
        assert_eq!(stream.endpoint(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn endpoint_handles_no_trailing_v1() {
        let config = LlmConfig {
            api_url: "http://localhost:8080".to_owned(),
            ..LlmConfig::default()
        };
        let stream = OpenAiChatStream::new(&config);
        assert_eq!(stream.endpoint(), "http://localhost:8080/v1/chat/completions");
    }
}
