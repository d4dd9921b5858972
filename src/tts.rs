//! Kokoro TTS engine: text → phonemes → ONNX inference → audio playback.
//!
//! Pipeline:
//! 1. Reply → sentences (split on .!?)
//! 2. Sentence → phonemes (misaki-rs G2P)
//! 3. Phonemes → token IDs (tokenizer.json vocabulary)
//! 4. Token IDs + voice style + speed → ONNX inference → f32 audio (24kHz)
//! 5. Audio → rodio Sink, stoppable at any time
//!
//! Every utterance carries a ticket from [`KokoroTtsEngine::next_ticket`].
//! Only the newest ticket is ever spoken; older ones bail out as soon as
//! they notice.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use ort::value::Tensor;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamBuilder, Sink};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::TTSConfig;

const SAMPLE_RATE: u32 = 24000;
const MAX_TOKENS: usize = 510; // Voice style array first dimension
const STYLE_DIM: usize = 256;

/// Utterance ticket counter. Only the most recently issued ticket is current.
#[derive(Debug, Default)]
struct Tickets(AtomicU64);

impl Tickets {
    fn issue(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, ticket: u64) -> bool {
        ticket == self.0.load(Ordering::SeqCst)
    }
}

/// How an utterance ended, with timing breakdown.
#[derive(Debug, Default)]
pub struct SpeakOutcome {
    pub generate_ms: f64,
    pub playback_ms: f64,
    pub cancelled: bool,
}

pub struct KokoroTtsEngine {
    // ort 2.0 Session::run needs &mut
    session: Mutex<ort::session::Session>,
    phonemizer: misaki_rs::G2P,
    vocab: HashMap<char, i64>,
    /// Style vectors for the configured voice, shape (510, 256).
    styles: Array2<f32>,
    speed: f32,
    output_stream: OutputStream,

    cancel_flag: Arc<AtomicBool>,
    tickets: Tickets,
    speak_lock: AsyncMutex<()>,
    active_sink: Arc<Mutex<Option<Sink>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn resolve(configured: &str, default_name: &str) -> PathBuf {
    if configured.is_empty() {
        std::env::current_dir().unwrap_or_default().join(default_name)
    } else {
        PathBuf::from(configured)
    }
}

impl KokoroTtsEngine {
    /// Load tokenizer, voice, ONNX model, phonemizer and audio output.
    /// Blocking; run at startup.
    pub fn load(config: &TTSConfig) -> Result<Self, String> {
        let t0 = Instant::now();
        let model_path = resolve(&config.model_path, "kokoro-v1.0.onnx");
        let voices_path = resolve(&config.voices_path, "voices-v1.0.bin");
        let tokenizer_path = resolve(&config.tokenizer_path, "tokenizer.json");

        info!("Loading tokenizer from {}", tokenizer_path.display());
        let vocab = load_tokenizer(&tokenizer_path)?;

        info!("Loading voice '{}' from {}", config.voice, voices_path.display());
        let styles = load_voice(&voices_path, &config.voice)?;

        info!("Loading ONNX model from {}", model_path.display());
        let session = ort::session::Session::builder()
            .map_err(|e| format!("Failed to create ONNX session builder: {e}"))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| format!("Failed to set optimization level: {e}"))?
            .with_intra_threads(4)
            .map_err(|e| format!("Failed to set thread count: {e}"))?
            .commit_from_file(&model_path)
            .map_err(|e| format!("Failed to load ONNX model: {e}"))?;

        let phonemizer = misaki_rs::G2P::new(misaki_rs::Language::EnglishUS);

        let output_stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| format!("Failed to open audio output: {e}"))?;

        info!("Kokoro TTS loaded in {}ms", t0.elapsed().as_millis());

        Ok(Self {
            session: Mutex::new(session),
            phonemizer,
            vocab,
            styles,
            speed: config.speed,
            output_stream,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            tickets: Tickets::default(),
            speak_lock: AsyncMutex::new(()),
            active_sink: Arc::new(Mutex::new(None)),
        })
    }

    /// Claim the next utterance ticket, superseding all earlier ones.
    pub fn next_ticket(&self) -> u64 {
        self.tickets.issue()
    }

    /// Speak `text` unless a newer ticket has been issued.
    pub async fn speak(&self, text: &str, ticket: u64) -> SpeakOutcome {
        let _guard = self.speak_lock.lock().await;
        if !self.tickets.is_current(ticket) {
            debug!("Utterance #{ticket} superseded before it started");
            return SpeakOutcome {
                cancelled: true,
                ..SpeakOutcome::default()
            };
        }
        self.cancel_flag.store(false, Ordering::SeqCst);

        let sentences = split_sentences(text.trim());
        let mut outcome = SpeakOutcome::default();

        for (i, sentence) in sentences.iter().enumerate() {
            if self.should_stop(ticket) {
                outcome.cancelled = true;
                info!("Cancelled before sentence {}/{}", i + 1, sentences.len());
                break;
            }

            let t_gen = Instant::now();
            let samples = match self.generate_audio(sentence) {
                Ok(s) => s,
                Err(e) => {
                    warn!("TTS generation failed for sentence {}: {e}", i + 1);
                    continue;
                }
            };
            outcome.generate_ms += t_gen.elapsed().as_secs_f64() * 1000.0;

            if self.should_stop(ticket) {
                outcome.cancelled = true;
                break;
            }
            if samples.is_empty() {
                continue;
            }

            let t_play = Instant::now();
            let interrupted = self.play_audio(samples).await;
            outcome.playback_ms += t_play.elapsed().as_secs_f64() * 1000.0;

            if interrupted {
                outcome.cancelled = true;
                info!("Cancelled during sentence {}/{}", i + 1, sentences.len());
                break;
            }
        }

        outcome
    }

    fn should_stop(&self, ticket: u64) -> bool {
        self.cancel_flag.load(Ordering::SeqCst) || !self.tickets.is_current(ticket)
    }

    /// Generate audio samples for a single sentence.
    fn generate_audio(&self, text: &str) -> Result<Vec<f32>, String> {
        let (phonemes, _tokens) = self
            .phonemizer
            .g2p(text)
            .map_err(|e| format!("Phonemization failed: {e}"))?;

        if phonemes.is_empty() {
            return Ok(Vec::new());
        }

        let token_ids = tokenize(&phonemes, &self.vocab);
        let n_tokens = token_ids.len();

        // Style row is picked by token count (without padding), clamped.
        let style_idx = n_tokens.saturating_sub(2).min(self.styles.nrows() - 1);
        let style_vec: Vec<f32> = self.styles.row(style_idx).to_vec();

        let tokens_array = Array2::from_shape_vec((1, n_tokens), token_ids)
            .map_err(|e| format!("Failed to create tokens tensor: {e}"))?;
        let tokens_tensor = Tensor::from_array(tokens_array)
            .map_err(|e| format!("Failed to create tokens ort tensor: {e}"))?;

        let style_array = Array2::from_shape_vec((1, STYLE_DIM), style_vec)
            .map_err(|e| format!("Failed to create style tensor: {e}"))?;
        let style_tensor = Tensor::from_array(style_array)
            .map_err(|e| format!("Failed to create style ort tensor: {e}"))?;

        let speed_tensor = Tensor::from_array(ndarray::Array1::from_vec(vec![self.speed]))
            .map_err(|e| format!("Failed to create speed ort tensor: {e}"))?;

        let mut session = lock(&self.session);
        let outputs = session
            .run(ort::inputs![
                "tokens" => tokens_tensor,
                "style" => style_tensor,
                "speed" => speed_tensor
            ])
            .map_err(|e| format!("ONNX inference failed: {e}"))?;

        let first_output = outputs.iter().next().ok_or("No output tensor from model")?;
        let (_shape, audio) = first_output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("Failed to extract audio tensor: {e}"))?;

        let samples: Vec<f32> = audio.to_vec();
        debug!(
            "Generated {} samples ({:.1}s)",
            samples.len(),
            samples.len() as f32 / SAMPLE_RATE as f32
        );
        Ok(samples)
    }

    /// Play samples through rodio. Returns true if cancelled mid-way.
    async fn play_audio(&self, samples: Vec<f32>) -> bool {
        let sink = Sink::connect_new(self.output_stream.mixer());
        sink.append(SamplesBuffer::new(1, SAMPLE_RATE, samples));
        *lock(&self.active_sink) = Some(sink);

        let cancel_flag = Arc::clone(&self.cancel_flag);
        let active_sink = Arc::clone(&self.active_sink);

        let cancelled = tokio::task::spawn_blocking(move || loop {
            let finished = lock(&active_sink).as_ref().is_none_or(Sink::empty);
            if finished {
                return false;
            }
            if cancel_flag.load(Ordering::SeqCst) {
                if let Some(sink) = lock(&active_sink).take() {
                    sink.stop();
                }
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        })
        .await
        .unwrap_or(false);

        *lock(&self.active_sink) = None;
        cancelled || self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Stop the current utterance immediately.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        if let Some(sink) = lock(&self.active_sink).take() {
            sink.stop();
            debug!("TTS playback cancelled");
        }
    }
}

// --- Helper functions ---

/// Map phonemes to token IDs with start/end padding. Unknown symbols are
/// skipped; the result is capped to what the voice styles cover.
fn tokenize(phonemes: &str, vocab: &HashMap<char, i64>) -> Vec<i64> {
    let mut ids = Vec::with_capacity(phonemes.len() + 2);
    ids.push(0);
    ids.extend(phonemes.chars().filter_map(|ch| vocab.get(&ch).copied()));
    ids.push(0);
    ids.truncate(MAX_TOKENS);
    ids
}

/// Load tokenizer vocabulary from tokenizer.json.
fn load_tokenizer(path: &Path) -> Result<HashMap<char, i64>, String> {
    let contents =
        fs::read_to_string(path).map_err(|e| format!("Failed to read tokenizer: {e}"))?;

    let data: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse tokenizer JSON: {e}"))?;

    let vocab = data["model"]["vocab"]
        .as_object()
        .ok_or("Missing model.vocab in tokenizer.json")?;

    let mut map = HashMap::new();
    for (token, id) in vocab {
        let id = id.as_i64().ok_or("Token ID is not an integer")?;
        if let Some(ch) = token.chars().next() {
            map.insert(ch, id);
        }
    }

    Ok(map)
}

/// Load one voice's style vectors from the NPZ archive.
fn load_voice(path: &Path, voice: &str) -> Result<Array2<f32>, String> {
    let file = fs::File::open(path).map_err(|e| format!("Failed to open voices file: {e}"))?;
    let mut npz =
        NpzReader::new(file).map_err(|e| format!("Failed to read NPZ voices file: {e}"))?;

    let arr: Array3<f32> = npz
        .by_name(&format!("{voice}.npy"))
        .map_err(|e| format!("Failed to read voice '{voice}': {e}"))?;

    // (510, 1, 256) → (510, 256)
    let (rows, cols) = (arr.shape()[0], arr.shape()[2]);
    if rows == 0 || cols != STYLE_DIM {
        return Err(format!("Voice '{voice}' has unexpected shape {:?}", arr.shape()));
    }
    arr.into_shape_with_order((rows, cols))
        .map_err(|e| format!("Failed to reshape voice '{voice}': {e}"))
}

/// Split text into sentences at .!? followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') && bytes.get(i + 1).is_some_and(u8::is_ascii_whitespace) {
            let s = text[start..=i].trim();
            if !s.is_empty() {
                sentences.push(s);
            }
            start = i + 1;
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_newest_ticket_is_current() {
        let tickets = Tickets::default();
        let first = tickets.issue();
        let second = tickets.issue();
        assert_eq!((first, second), (1, 2));
        assert!(!tickets.is_current(first));
        assert!(tickets.is_current(second));
        assert!(!tickets.is_current(0));
    }

    #[test]
    fn splits_on_sentence_boundaries() {
        assert_eq!(
            split_sentences("Hi there! How are you? I'm fine."),
            ["Hi there!", "How are you?", "I'm fine."]
        );
        assert_eq!(split_sentences("Version 3.5 is out"), ["Version 3.5 is out"]);
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn tokenize_pads_and_skips_unknown() {
        let vocab: HashMap<char, i64> = [('h', 5), ('i', 7)].into_iter().collect();
        assert_eq!(tokenize("hxi", &vocab), [0, 5, 7, 0]);

        let long = "h".repeat(MAX_TOKENS * 2);
        assert_eq!(tokenize(&long, &vocab).len(), MAX_TOKENS);
    }

    #[test]
    fn tokenizer_vocab_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        fs::write(&path, r#"{"model":{"vocab":{"a":1,"b":2,"ə":3}}}"#).unwrap();

        let vocab = load_tokenizer(&path).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab[&'ə'], 3);

        fs::write(&path, r#"{"model":{}}"#).unwrap();
        assert!(load_tokenizer(&path).is_err());
    }
}
