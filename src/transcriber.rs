//! Whisper speech-to-text using whisper-rs (whisper.cpp bindings).
//!
//! The GGML model is loaded once at startup; each capture is transcribed on
//! a blocking thread with its own whisper state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::config::WhisperConfig;

const WHISPER_SAMPLE_RATE: f64 = 16000.0;

/// Cheap to clone; the context is shared.
#[derive(Clone)]
pub struct WhisperTranscriber {
    ctx: Arc<WhisperContext>,
}

impl WhisperTranscriber {
    pub fn load(config: &WhisperConfig) -> Result<Self, String> {
        let model_path = find_model(&config.model)?;
        let model_str = model_path
            .to_str()
            .ok_or_else(|| format!("Model path is not valid UTF-8: {}", model_path.display()))?;

        info!("Loading Whisper model from {}", model_path.display());
        let t0 = Instant::now();

        let ctx = WhisperContext::new_with_params(model_str, WhisperContextParameters::default())
            .map_err(|e| format!("Failed to load Whisper model: {e}"))?;

        info!("Whisper model loaded in {}ms", t0.elapsed().as_millis());

        Ok(Self { ctx: Arc::new(ctx) })
    }

    /// Transcribe 16 kHz mono samples. `language` is a primary subtag such
    /// as `en`; an empty hint lets Whisper auto-detect.
    pub fn transcribe(&self, samples: &[f32], language: &str) -> Result<String, String> {
        let t0 = Instant::now();

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| format!("Failed to create whisper state: {e}"))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(if language.is_empty() { None } else { Some(language) });
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_single_segment(true);
        params.set_token_timestamps(false);

        state
            .full(params, samples)
            .map_err(|e| format!("Whisper inference failed: {e}"))?;

        let mut segments = Vec::new();
        for i in 0..state.full_n_segments() {
            if let Some(segment) = state.get_segment(i) {
                if let Ok(text) = segment.to_str_lossy() {
                    segments.push(text.trim().to_string());
                }
            }
        }
        let text = join_segments(&segments);

        let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;
        info!(
            "Transcribed {:.1}s audio in {latency_ms:.0}ms: \"{}\"",
            samples.len() as f64 / WHISPER_SAMPLE_RATE,
            preview(&text, 80)
        );

        Ok(text)
    }
}

fn join_segments(segments: &[String]) -> String {
    segments
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

/// Locate the GGML model: a direct path, or a known filename in the usual
/// directories.
fn find_model(model_name: &str) -> Result<PathBuf, String> {
    let direct = PathBuf::from(model_name);
    if direct.exists() && direct.extension().is_some() {
        return Ok(direct);
    }

    let filenames = [
        format!("ggml-{}.bin", model_name.replace('/', "-")),
        "ggml-base.bin".to_string(),
        "ggml-small.bin".to_string(),
        "ggml-large-v3-turbo.bin".to_string(),
    ];

    let search_dirs: Vec<PathBuf> = [
        std::env::current_dir().ok(),
        dirs::cache_dir().map(|c| c.join("whisper")),
        dirs::data_dir().map(|d| d.join("voice-chatbot")),
    ]
    .into_iter()
    .flatten()
    .collect();

    for dir in &search_dirs {
        for filename in &filenames {
            let path = dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    Err(format!(
        "Whisper GGML model '{model_name}' not found. Download with:\n  \
         wget https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.bin\n\
         Searched in: {search_dirs:?}"
    ))
}
