//! WebSocket-backed [`TtsSession`] adapter for a streaming speech-synthesis
//! endpoint.
//!
//! Same connection/task shape as [`crate::asr::provider::WebSocketAsrSession`]:
//! a background task owns the socket, a command channel carries
//! `send_text`/`finish`/`abort` into it, and decoded PCM frames are
//! forwarded out over an `mpsc` channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use super::TtsSession;
use crate::config::TtsConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{AudioFrame, SampleFormat};

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Text { text: String },
    Finish,
    Abort,
}

#[derive(Deserialize)]
struct ServerEvent {
    #[serde(default)]
    pcm_base64: Option<String>,
    #[serde(default)]
    sample_rate: Option<u32>,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    error: Option<String>,
}

enum Command {
    Text(String),
    Finish,
    Abort,
}

pub struct WebSocketTtsSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    frame_rx: mpsc::Receiver<AudioFrame>,
    closed: Arc<AtomicBool>,
}

impl WebSocketTtsSession {
    pub async fn connect(config: &TtsConfig) -> Result<Self> {
        let (stream, response) = tokio_tungstenite::connect_async(&config.endpoint)
            .await
            .map_err(|e| VoiceError::Tts(format!("TTS connect failed: {e}")))?;
        if response.status().as_u16() == 401 || response.status().as_u16() == 403 {
            return Err(VoiceError::Tts(format!(
                "TTS endpoint rejected credentials: {}",
                response.status()
            )));
        }

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let closed = Arc::new(AtomicBool::new(false));
        let default_rate = config.sample_rate;

        tokio::spawn(async move {
            let (mut write, mut read) = stream.split();

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let msg = match cmd {
                            Some(Command::Text(text)) => ClientMessage::Text { text },
                            Some(Command::Finish) => ClientMessage::Finish,
                            Some(Command::Abort) | None => ClientMessage::Abort,
                        };
                        let is_abort = matches!(msg, ClientMessage::Abort);
                        if let Ok(json) = serde_json::to_string(&msg) {
                            let _ = write.send(Message::Text(json)).await;
                        }
                        if is_abort {
                            let _ = write.close().await;
                            break;
                        }
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerEvent>(&text) {
                                    Ok(event) => {
                                        if let Some(err) = event.error {
                                            warn!("TTS provider error: {err}");
                                            continue;
                                        }
                                        if let Some(b64) = event.pcm_base64 {
                                            if let Ok(bytes) = BASE64.decode(b64) {
                                                let samples = bytes
                                                    .chunks_exact(2)
                                                    .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
                                                    .collect::<Vec<_>>();
                                                let frame = AudioFrame {
                                                    sample_rate: event.sample_rate.unwrap_or(default_rate),
                                                    channels: 1,
                                                    sample_format: SampleFormat::F32,
                                                    samples,
                                                    capture_monotonic_time: std::time::Instant::now(),
                                                    turn_id: None,
                                                };
                                                if frame_tx.send(frame).await.is_err() {
                                                    break;
                                                }
                                            }
                                        }
                                        if event.is_final {
                                            break;
                                        }
                                    }
                                    Err(e) => warn!("unparseable TTS event: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("TTS socket error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            cmd_tx,
            frame_rx,
            closed,
        })
    }
}

#[async_trait]
impl TtsSession for WebSocketTtsSession {
    async fn send_text(&self, utterance: &str) -> Result<()> {
        self.cmd_tx
            .send(Command::Text(utterance.to_owned()))
            .map_err(|e| VoiceError::Channel(e.to_string()))
    }

    fn frames(&mut self) -> &mut mpsc::Receiver<AudioFrame> {
        &mut self.frame_rx
    }

    async fn finish(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::Finish)
            .map_err(|e| VoiceError::Channel(e.to_string()))
    }

    async fn abort(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cmd_tx
            .send(Command::Abort)
            .map_err(|e| VoiceError::Channel(e.to_string()))
    }
}
