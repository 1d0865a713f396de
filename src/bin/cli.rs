//! CLI entry point for the voice assistant pipeline.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use voiced::asr::WebSocketAsrSession;
use voiced::audio::capture::AudioCapture;
use voiced::audio::playback::AudioPlayback;
use voiced::config::PipelineConfig;
use voiced::error::VoiceError;
use voiced::llm::OpenAiChatStream;
use voiced::memory::MemoryStore;
use voiced::pipeline::messages::TurnOutcome;
use voiced::pipeline::orchestrator::{Pipeline, WebSocketTtsConnector};
use voiced::role::RoleConfig;

#[derive(Parser)]
#[command(name = "voiced", version, about = "Full-duplex voice assistant pipeline")]
struct Cli {
    /// Path to a TOML pipeline configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a TOML role configuration file.
    #[arg(short, long)]
    role: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full-duplex voice conversation.
    Voice,
    /// Run a text-only conversation, reading lines from stdin.
    Text,
    /// List available audio input/output devices.
    Devices,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn load_config(cli: &Cli) -> Result<(PipelineConfig, RoleConfig), VoiceError> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    let role = match &cli.role {
        Some(path) => RoleConfig::from_file(path)?,
        None => RoleConfig::default(),
    };
    Ok((config, role))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::from(0),
        Err(e) if e.is_config_or_auth() => {
            error!("{e}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

trait ExitClassification {
    fn is_config_or_auth(&self) -> bool;
}

impl ExitClassification for VoiceError {
    fn is_config_or_auth(&self) -> bool {
        matches!(
            self,
            VoiceError::Config(_) | VoiceError::AsrAuthFailed(_) | VoiceError::Role(_)
        )
    }
}

async fn run(cli: Cli) -> Result<(), VoiceError> {
    let (config, role) = load_config(&cli)?;

    match cli.command {
        Command::Devices => {
            println!("Input devices:");
            for name in AudioCapture::list_input_devices() {
                println!("  {name}");
            }
            println!("Output devices:");
            for name in AudioPlayback::list_output_devices() {
                println!("  {name}");
            }
            Ok(())
        }
        Command::Text => run_text(config, role).await,
        Command::Voice => run_voice(config, role).await,
    }
}

async fn run_text(config: PipelineConfig, role: RoleConfig) -> Result<(), VoiceError> {
    let llm = Arc::new(OpenAiChatStream::new(&config.llm));
    let tts_connector = Arc::new(WebSocketTtsConnector::new(config.tts.clone()));
    let memory = Arc::new(MemoryStore::new(&config.memory)?);
    let pipeline = Pipeline::new_text(config, role, llm, tts_connector, memory);

    drive(pipeline).await
}

async fn run_voice(config: PipelineConfig, role: RoleConfig) -> Result<(), VoiceError> {
    let asr = WebSocketAsrSession::connect(&config.asr).await?;
    let llm = Arc::new(OpenAiChatStream::new(&config.llm));
    let tts_connector = Arc::new(WebSocketTtsConnector::new(config.tts.clone()));
    let memory = Arc::new(MemoryStore::new(&config.memory)?);
    let pipeline = Pipeline::new_voice(config, role, llm, tts_connector, memory, Box::new(asr))?;

    drive(pipeline).await
}

async fn drive(pipeline: Pipeline) -> Result<(), VoiceError> {
    let mut outcomes = pipeline
        .take_status_receiver()
        .await
        .expect("status receiver taken exactly once");
    pipeline.start().await?;

    let mut stdin_lines = spawn_stdin_reader();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl-C, stopping");
                break;
            }
            line = stdin_lines.recv_async() => {
                match line {
                    Some(text) => {
                        if let Err(e) = pipeline.submit_text(text).await {
                            error!("failed to submit text: {e}");
                        }
                    }
                    None => break,
                }
            }
            outcome = outcomes.recv() => {
                match outcome {
                    Some(TurnOutcome::Failed(reason)) => error!("turn failed: {reason}"),
                    Some(other) => info!(?other, "turn outcome"),
                    None => break,
                }
            }
        }
    }

    pipeline.stop().await
}

/// A tiny bridge from blocking stdin reads to the async world, grounded on
/// the same `spawn_blocking` + channel shape used by the audio capture
/// path for cpal's callback API.
struct StdinLines {
    rx: tokio::sync::mpsc::Receiver<String>,
}

impl StdinLines {
    async fn recv_async(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

fn spawn_stdin_reader() -> StdinLines {
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    std::thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(text) => {
                    if tx.blocking_send(text).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    StdinLines { rx }
}
