//! `Pipeline`: the turn state machine that drives capture, ASR, LLM, TTS,
//! and playback through one coherent lifecycle per turn.
//!
//! One long-lived task drives the state machine, talking to collaborator
//! tasks (capture+ASR, TTS+playback) over bounded channels, with a
//! `CancellationToken` carrying interruption through every in-flight await.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::asr::AsrSession;
use crate::audio::aec::{AecMode, AecProcessor};
use crate::audio::capture::AudioCapture;
use crate::audio::playback::{AudioPlayback, PlaybackHandle};
use crate::config::PipelineConfig;
use crate::error::{Result, VoiceError};
use crate::llm::{GenerationParams, LlmEvent, LlmStream, ToolCall};
use crate::memory::MemoryStore;
use crate::pipeline::barge_in::BargeInController;
use crate::pipeline::messages::{
    CancelReason, ConversationMessage, Role, Transcript, TurnId, TurnOutcome, TurnState,
};
use crate::pipeline::sanitizer::TextSanitizer;
use crate::role::RoleConfig;
use crate::tts::TtsSession;

/// How the pipeline sources user turns: from a microphone, or from
/// text handed in through [`Pipeline::submit_text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Voice,
    Text,
}

/// Connects a fresh [`TtsSession`] on demand. A turn opens at most one
/// session; a new one is never reused across turns since providers key
/// session state (voice, prosody context) to the connection.
#[async_trait]
pub trait TtsConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TtsSession>>;
}

/// Default connector backed by the WebSocket TTS provider adapter.
pub struct WebSocketTtsConnector {
    config: crate::config::TtsConfig,
}

impl WebSocketTtsConnector {
    pub fn new(config: crate::config::TtsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TtsConnector for WebSocketTtsConnector {
    async fn connect(&self) -> Result<Box<dyn TtsSession>> {
        let session = crate::tts::WebSocketTtsSession::connect(&self.config).await?;
        Ok(Box::new(session))
    }
}

enum PipelineInput {
    UserText(String),
    Stop,
}

enum InterruptReason {
    Stop,
    BargeIn,
}

/// The full-duplex voice assistant pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    role: RoleConfig,
    mode: PipelineMode,
    llm: Arc<dyn LlmStream>,
    tts_connector: Arc<dyn TtsConnector>,
    memory: Arc<MemoryStore>,
    asr: Mutex<Option<Box<dyn AsrSession>>>,
    capture: Mutex<Option<AudioCapture>>,
    playback: Mutex<Option<AudioPlayback>>,
    aec_mode: AecMode,
    input_tx: mpsc::Sender<PipelineInput>,
    input_rx: Mutex<Option<mpsc::Receiver<PipelineInput>>>,
    status_tx: mpsc::Sender<TurnOutcome>,
    status_rx: Mutex<Option<mpsc::Receiver<TurnOutcome>>>,
    cancel: CancellationToken,
    join: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Pipeline {
    /// Build a text-only pipeline: no audio devices, turns only arrive
    /// through [`submit_text`](Pipeline::submit_text).
    pub fn new_text(
        config: PipelineConfig,
        role: RoleConfig,
        llm: Arc<dyn LlmStream>,
        tts_connector: Arc<dyn TtsConnector>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self::assemble(config, role, PipelineMode::Text, llm, tts_connector, memory, None, None, None)
    }

    /// Build a full-duplex voice pipeline. `asr` is a session the caller
    /// has already connected; it stays open for the pipeline's lifetime
    /// rather than being reconnected per turn.
    pub fn new_voice(
        config: PipelineConfig,
        role: RoleConfig,
        llm: Arc<dyn LlmStream>,
        tts_connector: Arc<dyn TtsConnector>,
        memory: Arc<MemoryStore>,
        asr: Box<dyn AsrSession>,
    ) -> Result<Self> {
        let capture = AudioCapture::new(&config.audio)?;
        let playback = AudioPlayback::new(&config.audio)?;
        Ok(Self::assemble(
            config,
            role,
            PipelineMode::Voice,
            llm,
            tts_connector,
            memory,
            Some(asr),
            Some(capture),
            Some(playback),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: PipelineConfig,
        role: RoleConfig,
        mode: PipelineMode,
        llm: Arc<dyn LlmStream>,
        tts_connector: Arc<dyn TtsConnector>,
        memory: Arc<MemoryStore>,
        asr: Option<Box<dyn AsrSession>>,
        capture: Option<AudioCapture>,
        playback: Option<AudioPlayback>,
    ) -> Self {
        let aec_mode = if config.audio.aggregate_device {
            AecMode::Aggregate
        } else {
            AecMode::Software
        };
        let (input_tx, input_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = mpsc::channel(8);
        Self {
            config,
            role,
            mode,
            llm,
            tts_connector,
            memory,
            asr: Mutex::new(asr),
            capture: Mutex::new(capture),
            playback: Mutex::new(playback),
            aec_mode,
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            status_tx,
            status_rx: Mutex::new(Some(status_rx)),
            cancel: CancellationToken::new(),
            join: Mutex::new(None),
        }
    }

    /// Take ownership of the outcome stream. Call once, before or
    /// shortly after [`start`](Pipeline::start).
    pub async fn take_status_receiver(&self) -> Option<mpsc::Receiver<TurnOutcome>> {
        self.status_rx.lock().await.take()
    }

    /// Start the pipeline: brings up capture/ASR (voice mode) and the
    /// turn state machine, both as background tasks.
    pub async fn start(&self) -> Result<()> {
        let mut input_rx = self
            .input_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| VoiceError::Pipeline("pipeline already started".into()))?;

        let (transcript_tx, mut transcript_rx) = mpsc::channel::<Transcript>(32);

        let playback_handle = match self.playback.lock().await.as_ref() {
            Some(p) => Some(p.start()?),
            None => None,
        };

        if self.mode == PipelineMode::Voice {
            let asr = self
                .asr
                .lock()
                .await
                .take()
                .ok_or_else(|| VoiceError::Pipeline("voice pipeline missing an ASR session".into()))?;
            let capture = self
                .capture
                .lock()
                .await
                .take()
                .ok_or_else(|| VoiceError::Pipeline("voice pipeline missing a capture device".into()))?;
            let aec = if self.config.aec.enabled {
                let (processor, reference_handle) = AecProcessor::new(
                    &self.config.aec,
                    self.aec_mode,
                    self.config.audio.input_sample_rate,
                )?;
                if let (Some(handle), Some(pb)) = (reference_handle, playback_handle.as_ref()) {
                    let mut tap = pb.reference_tap();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                frame = tap.recv() => {
                                    match frame {
                                        Ok(f) => handle.push(&f),
                                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                                    }
                                }
                            }
                        }
                    });
                }
                Some(processor)
            } else {
                None
            };
            let cancel = self.cancel.clone();
            let asr_final_timeout = Duration::from_millis(self.config.timeouts.asr_final_timeout_ms);
            tokio::spawn(run_capture_and_asr(
                capture,
                aec,
                asr,
                transcript_tx,
                asr_final_timeout,
                cancel,
            ));
        }

        let config = self.config.clone();
        let role = self.role.clone();
        let mode = self.mode;
        let llm = self.llm.clone();
        let tts_connector = self.tts_connector.clone();
        let memory = self.memory.clone();
        let status_tx = self.status_tx.clone();
        let cancel = self.cancel.clone();
        let barge_in = BargeInController::new(config.barge_in.clone(), self.aec_mode);

        let handle = tokio::spawn(async move {
            run_loop(
                config,
                role,
                mode,
                llm,
                tts_connector,
                memory,
                playback_handle,
                barge_in,
                &mut input_rx,
                &mut transcript_rx,
                status_tx,
                cancel,
            )
            .await;
        });
        *self.join.lock().await = Some(handle);
        Ok(())
    }

    /// Enqueue a text turn. Valid in both modes; in voice mode it competes
    /// with microphone-sourced turns on a first-arrived basis.
    pub async fn submit_text(&self, text: String) -> Result<()> {
        self.input_tx
            .send(PipelineInput::UserText(text))
            .await
            .map_err(|e| VoiceError::Channel(e.to_string()))
    }

    /// Stop the pipeline: cancels any active turn and shuts down every
    /// background task, waiting up to `timeouts.stop_timeout_ms`.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.input_tx.send(PipelineInput::Stop).await;
        self.cancel.cancel();
        if let Some(handle) = self.join.lock().await.take() {
            let budget = Duration::from_millis(self.config.timeouts.stop_timeout_ms);
            if tokio::time::timeout(budget, handle).await.is_err() {
                warn!("pipeline run loop did not stop within budget");
            }
        }
        Ok(())
    }
}

async fn run_capture_and_asr(
    capture: AudioCapture,
    mut aec: Option<AecProcessor>,
    mut asr: Box<dyn AsrSession>,
    transcript_tx: mpsc::Sender<Transcript>,
    asr_final_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut frames = match capture.start(cancel.clone()).await {
        Ok(f) => f,
        Err(e) => {
            error!("capture failed to start: {e}");
            return;
        }
    };

    // Tracks whether the last voiced frame forwarded to the provider has
    // not yet been answered by a final transcript: if the provider stays
    // silent too long after audio, force a flush rather than waiting
    // indefinitely for a final.
    let mut last_frame_at: Option<Instant> = None;
    let mut awaiting_final = false;

    loop {
        let timeout_deadline = match (last_frame_at, awaiting_final) {
            (Some(t), true) => tokio::time::Instant::from_std(t + asr_final_timeout),
            _ => tokio::time::Instant::now() + Duration::from_secs(3600),
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = asr.close().await;
                break;
            }
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let frame = match aec.as_mut() {
                    Some(a) => a.process(frame),
                    None => frame,
                };
                last_frame_at = Some(Instant::now());
                awaiting_final = true;
                if let Err(e) = asr.send(frame) {
                    warn!("failed to forward frame to ASR: {e}");
                }
            }
            transcript = asr.events().recv() => {
                match transcript {
                    Some(t) => {
                        if t.is_final {
                            awaiting_final = false;
                        }
                        if transcript_tx.send(t).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(timeout_deadline), if awaiting_final => {
                debug!("ASR final timeout elapsed, forcing flush");
                let _ = asr.flush().await;
                awaiting_final = false;
            }
        }
    }
}

async fn recv_transcript_if_voice(
    mode: PipelineMode,
    rx: &mut mpsc::Receiver<Transcript>,
) -> Option<Transcript> {
    if mode != PipelineMode::Voice {
        std::future::pending::<()>().await;
        unreachable!();
    }
    rx.recv().await
}

async fn wait_for_interrupt(
    mode: PipelineMode,
    barge_in: &BargeInController,
    state: TurnState,
    transcript_rx: &mut mpsc::Receiver<Transcript>,
    input_rx: &mut mpsc::Receiver<PipelineInput>,
) -> InterruptReason {
    loop {
        tokio::select! {
            input = input_rx.recv() => {
                match input {
                    Some(PipelineInput::Stop) | None => return InterruptReason::Stop,
                    Some(PipelineInput::UserText(_)) => continue,
                }
            }
            transcript = recv_transcript_if_voice(mode, transcript_rx) => {
                if let Some(t) = transcript {
                    if barge_in.should_trigger(state, &t, Instant::now()) {
                        return InterruptReason::BargeIn;
                    }
                }
            }
        }
    }
}

async fn recv_tts_frame(
    tts: &mut Option<Box<dyn TtsSession>>,
) -> Option<crate::pipeline::messages::AudioFrame> {
    match tts.as_mut() {
        Some(session) => session.frames().recv().await,
        None => std::future::pending().await,
    }
}

/// Stream LLM tokens through the sanitizer into TTS and playback. Runs
/// until the LLM stream ends and all synthesized audio has drained.
async fn synthesize(
    mut llm_rx: mpsc::Receiver<LlmEvent>,
    sanitizer: &mut TextSanitizer,
    assistant_text: &mut String,
    tts: &mut Option<Box<dyn TtsSession>>,
    tts_connector: &Arc<dyn TtsConnector>,
    playback: Option<&PlaybackHandle>,
    barge_in: &BargeInController,
    first_frame_timeout: Duration,
    first_token_timeout: Duration,
) -> Result<Vec<ToolCall>> {
    let mut got_first_frame = false;
    let mut got_first_token = false;
    let mut frame_deadline: Option<tokio::time::Instant> = None;
    let mut token_deadline = Some(tokio::time::Instant::now() + first_token_timeout);
    let mut llm_done = false;
    let mut tool_calls = Vec::new();

    loop {
        if llm_done && tts.is_none() {
            return Ok(tool_calls);
        }

        tokio::select! {
            event = llm_rx.recv(), if !llm_done => {
                got_first_token = true;
                token_deadline = None;
                match event {
                    Some(LlmEvent::Token(tok)) => {
                        assistant_text.push_str(&tok.text);
                        for utterance in sanitizer.push(&tok.text) {
                            if tts.is_none() {
                                *tts = Some(tts_connector.connect().await?);
                                frame_deadline = Some(tokio::time::Instant::now() + first_frame_timeout);
                            }
                            tts.as_ref().unwrap().send_text(&utterance.text).await?;
                        }
                    }
                    Some(LlmEvent::End { tool_calls: calls }) => {
                        tool_calls = calls;
                        if let Some(utterance) = sanitizer.finish() {
                            if tts.is_none() {
                                *tts = Some(tts_connector.connect().await?);
                                frame_deadline = Some(tokio::time::Instant::now() + first_frame_timeout);
                            }
                            tts.as_ref().unwrap().send_text(&utterance.text).await?;
                        }
                        if let Some(session) = tts.as_ref() {
                            session.finish().await?;
                        }
                        llm_done = true;
                    }
                    None => llm_done = true,
                }
            }
            frame = recv_tts_frame(tts), if tts.is_some() => {
                match frame {
                    Some(f) => {
                        got_first_frame = true;
                        frame_deadline = None;
                        if let Some(pb) = playback {
                            pb.submit(f).await?;
                            barge_in.note_playback_submitted(Instant::now());
                        }
                    }
                    None => {
                        if let Some(pb) = playback {
                            pb.flush().await?;
                        }
                        *tts = None;
                        if llm_done {
                            return Ok(tool_calls);
                        }
                    }
                }
            }
            _ = tokio::time::sleep_until(frame_deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600))), if frame_deadline.is_some() && !got_first_frame => {
                return Err(VoiceError::TtsTimeout);
            }
            _ = tokio::time::sleep_until(token_deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600))), if token_deadline.is_some() && !got_first_token => {
                return Err(VoiceError::LlmTimeout);
            }
        }
    }
}

fn trim_history(history: &mut Vec<ConversationMessage>, max_messages: usize) {
    if history.len() > max_messages {
        let overflow = history.len() - max_messages;
        history.drain(0..overflow);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_turn(
    turn_id: TurnId,
    initial_user_text: String,
    history: &mut Vec<ConversationMessage>,
    role: &RoleConfig,
    llm: &Arc<dyn LlmStream>,
    tts_connector: &Arc<dyn TtsConnector>,
    playback: Option<&PlaybackHandle>,
    memory: &Arc<MemoryStore>,
    config: &PipelineConfig,
    mode: PipelineMode,
    barge_in: &BargeInController,
    transcript_rx: &mut mpsc::Receiver<Transcript>,
    input_rx: &mut mpsc::Receiver<PipelineInput>,
) -> TurnOutcome {
    history.push(ConversationMessage {
        role: Role::User,
        text: initial_user_text.clone(),
        turn_id,
    });
    trim_history(history, config.llm.max_history_messages);

    let memory_hits = match tokio::time::timeout(
        Duration::from_millis(config.timeouts.memory_call_timeout_ms),
        memory.search(&initial_user_text, "default", config.memory.recall_limit),
    )
    .await
    {
        Ok(Ok(hits)) => hits,
        _ => Vec::new(),
    };

    let mut system_prompt = role.system_prompt.clone();
    if !memory_hits.is_empty() {
        system_prompt.push_str("\n\nRelevant memory:\n");
        system_prompt.push_str(&memory_hits.join("\n"));
    }

    let mut round_messages = vec![ConversationMessage {
        role: Role::System,
        text: system_prompt,
        turn_id,
    }];
    round_messages.extend(history.iter().cloned());

    let params = GenerationParams {
        temperature: config.llm.temperature,
        max_tokens: config.llm.max_tokens,
        top_p: config.llm.top_p,
    };
    let first_frame_timeout = Duration::from_millis(config.timeouts.tts_first_frame_timeout_ms);
    let first_token_timeout = Duration::from_millis(config.timeouts.llm_first_token_timeout_ms);

    let mut assistant_text = String::new();
    let mut rounds = 0u8;

    loop {
        rounds += 1;
        let cancel = CancellationToken::new();
        let llm_rx = match llm.open(&round_messages, &params, cancel.clone()).await {
            Ok(rx) => rx,
            Err(e) => return TurnOutcome::Failed(e.to_string()),
        };

        let mut sanitizer = TextSanitizer::new();
        let mut tts: Option<Box<dyn TtsSession>> = None;
        let mut round_text = String::new();

        enum Race {
            Interrupted(InterruptReason),
            Finished(Result<Vec<ToolCall>>),
        }

        let race = {
            let synth = synthesize(
                llm_rx,
                &mut sanitizer,
                &mut round_text,
                &mut tts,
                tts_connector,
                playback,
                barge_in,
                first_frame_timeout,
                first_token_timeout,
            );
            tokio::pin!(synth);
            let interrupt = wait_for_interrupt(mode, barge_in, TurnState::Generating, transcript_rx, input_rx);
            tokio::pin!(interrupt);

            tokio::select! {
                biased;
                reason = &mut interrupt => Race::Interrupted(reason),
                result = &mut synth => Race::Finished(result),
            }
        };

        match race {
            Race::Interrupted(reason) => {
                cancel.cancel();
                if let Some(session) = tts.as_ref() {
                    let _ = session.abort().await;
                }
                if let Some(pb) = playback {
                    let _ = pb.abort();
                }
                return match reason {
                    InterruptReason::Stop => TurnOutcome::Cancelled(CancelReason::Explicit),
                    InterruptReason::BargeIn => TurnOutcome::Cancelled(CancelReason::BargeIn),
                };
            }
            Race::Finished(Err(e)) => return TurnOutcome::Failed(e.to_string()),
            Race::Finished(Ok(tool_calls)) => {
                assistant_text.push_str(&round_text);
                if tool_calls.is_empty() || rounds >= 2 {
                    break;
                }
                debug!(turn_id, rounds, "restarting generation after tool call request");
                round_messages.push(ConversationMessage {
                    role: Role::Assistant,
                    text: round_text,
                    turn_id,
                });
                let names: Vec<&str> = tool_calls.iter().map(|c| c.name.as_str()).collect();
                round_messages.push(ConversationMessage {
                    role: Role::System,
                    text: format!(
                        "Tool call(s) requested: {}. No tool executor is configured; \
                         continue the reply without them.",
                        names.join(", ")
                    ),
                    turn_id,
                });
            }
        }
    }

    history.push(ConversationMessage {
        role: Role::Assistant,
        text: assistant_text.clone(),
        turn_id,
    });
    let _ = tokio::time::timeout(
        Duration::from_millis(config.timeouts.memory_call_timeout_ms),
        memory.record_turn("default", &initial_user_text, &assistant_text),
    )
    .await;

    TurnOutcome::Completed
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    config: PipelineConfig,
    role: RoleConfig,
    mode: PipelineMode,
    llm: Arc<dyn LlmStream>,
    tts_connector: Arc<dyn TtsConnector>,
    memory: Arc<MemoryStore>,
    playback: Option<PlaybackHandle>,
    barge_in: BargeInController,
    input_rx: &mut mpsc::Receiver<PipelineInput>,
    transcript_rx: &mut mpsc::Receiver<Transcript>,
    status_tx: mpsc::Sender<TurnOutcome>,
    cancel: CancellationToken,
) {
    let mut history: Vec<ConversationMessage> = Vec::new();
    let mut next_turn_id: TurnId = 0;

    'outer: loop {
        let user_text = tokio::select! {
            _ = cancel.cancelled() => break 'outer,
            input = input_rx.recv() => match input {
                Some(PipelineInput::Stop) | None => break 'outer,
                Some(PipelineInput::UserText(text)) => text,
            },
            transcript = recv_transcript_if_voice(mode, transcript_rx) => {
                match transcript {
                    Some(t) if t.is_final && !t.text.trim().is_empty() => t.text,
                    _ => continue 'outer,
                }
            }
        };

        if user_text.trim().is_empty() {
            continue;
        }

        next_turn_id += 1;
        info!(turn_id = next_turn_id, "starting turn");
        let outcome = run_turn(
            next_turn_id,
            user_text,
            &mut history,
            &role,
            &llm,
            &tts_connector,
            playback.as_ref(),
            &memory,
            &config,
            mode,
            &barge_in,
            transcript_rx,
            input_rx,
        )
        .await;
        info!(turn_id = next_turn_id, outcome = ?outcome, "turn finished");
        if status_tx.send(outcome).await.is_err() {
            break;
        }
    }

    if let Some(pb) = playback {
        pb.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_history_drops_oldest_overflow() {
        let mut history: Vec<ConversationMessage> = (0..5)
            .map(|i| ConversationMessage {
                role: Role::User,
                text: format!("msg {i}"),
                turn_id: i as TurnId,
            })
            .collect();
        trim_history(&mut history, 3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].text, "msg 2");
    }

    #[test]
    fn trim_history_is_noop_under_budget() {
        let mut history: Vec<ConversationMessage> = (0..2)
            .map(|i| ConversationMessage {
                role: Role::User,
                text: format!("msg {i}"),
                turn_id: i as TurnId,
            })
            .collect();
        trim_history(&mut history, 10);
        assert_eq!(history.len(), 2);
    }
}
