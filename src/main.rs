//! voice-chatbot-rs: talk to a language model from the terminal.

mod capture;
mod completion;
mod config;
mod console;
mod controller;
mod conversation;
mod error;
mod hotkey;
mod playback;
mod recorder;
mod service;
mod session;
mod transcriber;
mod tts;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::session::{InputMode, Theme};

#[derive(Parser, Debug)]
#[command(name = "voice-chatbot", about = "Voice chatbot: speak or type, hear the reply")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input mode: voice or text
    #[arg(short, long)]
    mode: Option<InputMode>,

    /// Conversation language, e.g. en-US
    #[arg(short, long)]
    language: Option<String>,

    /// Colour theme: light or dark
    #[arg(long)]
    theme: Option<Theme>,

    /// Disable spoken replies
    #[arg(long)]
    no_tts: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Suppress noisy ort/whisper internals; keep stdout for the transcript
    let filter = if args.verbose {
        EnvFilter::new("debug,ort=info,whisper_rs=info,reqwest=info,hyper=info")
    } else {
        EnvFilter::new("info,ort=warn,whisper_rs=warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("voice-chatbot-rs starting");

    if let Some(path) = &args.config {
        if !path.is_file() {
            return Err(format!("Config file not found: {}", path.display()).into());
        }
    }
    let mut config = config::Config::load(args.config.as_deref());
    if let Some(mode) = args.mode {
        config.session.input_mode = mode;
    }
    if let Some(language) = args.language.filter(|l| !l.trim().is_empty()) {
        config.session.language = language;
    }
    if let Some(theme) = args.theme {
        config.session.theme = theme;
    }
    if args.no_tts {
        config.tts.enabled = false;
    }
    info!(
        "Session: mode={}, language={}, theme={}",
        config.session.input_mode, config.session.language, config.session.theme
    );

    // Load Whisper model (blocking, takes a few seconds)
    info!("Loading Whisper model...");
    let transcriber = tokio::task::spawn_blocking({
        let whisper_config = config.whisper.clone();
        move || transcriber::WhisperTranscriber::load(&whisper_config)
    })
    .await?
    .inspect_err(|e| warn!("{e}"))
    .ok();

    let mut recorder = recorder::AudioRecorder::new(
        config.audio.clone(),
        &config.recording,
        config.silence.clone(),
    );
    let recorder = match recorder.open_stream() {
        Ok(()) => Some(recorder),
        Err(e) => {
            warn!("Microphone unavailable: {e}");
            None
        }
    };

    let tts = if config.tts.enabled {
        // Blocks briefly; the audio output stream has to be opened here anyway
        info!("Loading Kokoro TTS model...");
        match tts::KokoroTtsEngine::load(&config.tts) {
            Ok(engine) => {
                info!("TTS ready (voice: {}, speed: {})", config.tts.voice, config.tts.speed);
                if config.session.primary_language() != "en" {
                    warn!("Kokoro voice is English; replies in {} may sound off", config.session.language);
                }
                Some(Arc::new(engine))
            }
            Err(e) => {
                warn!("Failed to load TTS model: {e}");
                None
            }
        }
    } else {
        info!("TTS disabled");
        None
    };

    let credential = config.completion.credential();
    if credential.is_empty() && config.completion.backend == config::CompletionBackend::OpenAi {
        warn!(
            "No API key set (completion.api_key or ${}); requests will be rejected",
            config.completion.api_key_env
        );
    }
    let client = completion::ChatCompletionClient::new(config.completion.clone())?;
    info!(
        "Completion backend: {} at {} (model {})",
        config.completion.backend, config.completion.endpoint, config.completion.model
    );

    let devices = service::Devices {
        recorder,
        transcriber,
        tts,
    };
    let service = service::ChatService::new(config, devices, Arc::new(client), credential);
    service.run().await?;

    Ok(())
}
