//! WebSocket-backed [`AsrSession`] adapter for an OpenAI-Realtime-style
//! streaming transcription endpoint.
//!
//! A background task owns the socket and forwards parsed events back to
//! the async caller over an internal channel, the same split a blocking
//! HTTP client would use with a dedicated reader thread, just async end
//! to end since the ASR contract is bidirectional streaming.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::AsrSession;
use crate::config::AsrConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{AudioFrame, Transcript};

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Audio { pcm_base64: String, sample_rate: u32 },
    #[serde(rename = "flush")]
    Flush,
}

#[derive(Deserialize)]
struct ServerEvent {
    text: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    sequence: u64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    fatal: bool,
}

enum Command {
    Frame(Vec<f32>, u32),
    Flush,
    Close,
}

/// A streaming ASR session backed by a WebSocket connection.
pub struct WebSocketAsrSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    event_rx: mpsc::Receiver<Transcript>,
    closed: Arc<AtomicBool>,
}

impl WebSocketAsrSession {
    pub async fn connect(config: &AsrConfig) -> Result<Self> {
        let stream = Self::connect_with_one_retry(config).await?;

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (event_tx, event_rx) = mpsc::channel(64);
        let closed = Arc::new(AtomicBool::new(false));
        let sample_rate = config.sample_rate;

        tokio::spawn(async move {
            let (mut write, mut read) = stream.split();
            let mut utterance_start: Option<Instant> = None;

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(Command::Frame(samples, rate)) => {
                                let bytes: Vec<u8> = samples
                                    .iter()
                                    .flat_map(|s| {
                                        let clamped = (*s * i16::MAX as f32) as i16;
                                        clamped.to_le_bytes()
                                    })
                                    .collect();
                                let msg = ClientMessage::Audio {
                                    pcm_base64: BASE64.encode(bytes),
                                    sample_rate: rate.max(sample_rate),
                                };
                                if let Ok(json) = serde_json::to_string(&msg) {
                                    if write.send(Message::Text(json)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Command::Flush) => {
                                if let Ok(json) = serde_json::to_string(&ClientMessage::Flush) {
                                    let _ = write.send(Message::Text(json)).await;
                                }
                            }
                            Some(Command::Close) | None => {
                                let _ = write.close().await;
                                break;
                            }
                        }
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerEvent>(&text) {
                                    Ok(event) => {
                                        if let Some(err) = event.error {
                                            if event.fatal {
                                                warn!("ASR fatal error: {err}");
                                                break;
                                            }
                                            warn!("ASR transient error: {err}");
                                            continue;
                                        }
                                        let now = Instant::now();
                                        let start = *utterance_start.get_or_insert(now);
                                        if event.is_final {
                                            utterance_start = None;
                                        }
                                        let transcript = Transcript {
                                            text: event.text,
                                            is_final: event.is_final,
                                            server_sequence: event.sequence,
                                            start_time: start,
                                            end_time: now,
                                        };
                                        if event_tx.send(transcript).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => debug!("unparseable ASR event: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("ASR socket error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            cmd_tx,
            event_rx,
            closed,
        })
    }

    async fn connect_with_one_retry(
        config: &AsrConfig,
    ) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>>
    {
        match tokio_tungstenite::connect_async(&config.endpoint).await {
            Ok((stream, response)) => {
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 {
                    return Err(VoiceError::AsrAuthFailed(format!(
                        "ASR endpoint rejected credentials: {}",
                        response.status()
                    )));
                }
                Ok(stream)
            }
            Err(first_err) => {
                warn!("ASR connect failed, retrying once: {first_err}");
                tokio_tungstenite::connect_async(&config.endpoint)
                    .await
                    .map(|(s, _)| s)
                    .map_err(|e| VoiceError::Asr(format!("ASR connect failed after retry: {e}")))
            }
        }
    }
}

#[async_trait]
impl AsrSession for WebSocketAsrSession {
    fn send(&self, frame: AudioFrame) -> Result<()> {
        self.cmd_tx
            .send(Command::Frame(frame.samples, frame.sample_rate))
            .map_err(|e| VoiceError::Channel(e.to_string()))
    }

    fn events(&mut self) -> &mut mpsc::Receiver<Transcript> {
        &mut self.event_rx
    }

    async fn flush(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::Flush)
            .map_err(|e| VoiceError::Channel(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cmd_tx
            .send(Command::Close)
            .map_err(|e| VoiceError::Channel(e.to_string()))
    }
}
