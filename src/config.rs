//! Configuration management for voice-chatbot-rs.
//!
//! Loads config from YAML files in standard locations. Every section and
//! field has a default, so a partial file (or none at all) is fine.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::completion::Credential;
use crate::session::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionBackend {
    #[default]
    OpenAi,
    Ollama,
}

impl fmt::Display for CompletionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::Ollama => write!(f, "ollama"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub backend: CompletionBackend,
    /// Base URL. `/chat/completions` (OpenAI) or `/api/chat` (Ollama) is appended.
    pub endpoint: String,
    pub model: String,
    /// Inline API key. Takes precedence over `api_key_env`.
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout_secs: u64,
    /// `{language}` is replaced with the session language code.
    pub system_prompt: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            backend: CompletionBackend::OpenAi,
            endpoint: "https://api.openai.com/v1".into(),
            model: "gpt-3.5-turbo".into(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".into(),
            max_tokens: 150,
            temperature: 0.7,
            timeout_secs: 30,
            system_prompt: "You are a helpful AI assistant. Keep your responses concise and friendly. \
                            Reply in the language identified by the code {language}."
                .into(),
        }
    }
}

impl CompletionConfig {
    /// Resolve the API key: inline value first, then the environment.
    pub fn credential(&self) -> Credential {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .map(|k| Credential::new(k.trim()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HotkeyConfig {
    /// Push-to-talk: hold the combo to capture, release to stop.
    pub enabled: bool,
    pub combo: Vec<String>,
    pub alt_combos: Vec<Vec<String>>,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            combo: vec!["KEY_LEFTMETA".into(), "KEY_LEFTALT".into()],
            alt_combos: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_size: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            chunk_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub max_duration: f64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self { max_duration: 60.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SilenceConfig {
    pub threshold: f32,
    pub duration: f64,
    pub min_speech_duration: f64,
    pub max_recording_duration: f64,
}

impl Default for SilenceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            duration: 1.5,
            min_speech_duration: 0.5,
            max_recording_duration: 30.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    pub model: String,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model: "base".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TTSConfig {
    pub enabled: bool,
    pub voice: String,
    pub speed: f32,
    /// Empty means `./kokoro-v1.0.onnx`.
    pub model_path: String,
    pub voices_path: String,
    pub tokenizer_path: String,
}

impl Default for TTSConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            voice: "af_heart".into(),
            speed: 0.9,
            model_path: String::new(),
            voices_path: String::new(),
            tokenizer_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub completion: CompletionConfig,
    pub session: SessionConfig,
    pub hotkey: HotkeyConfig,
    pub audio: AudioConfig,
    pub recording: RecordingConfig,
    pub silence: SilenceConfig,
    pub whisper: WhisperConfig,
    pub tts: TTSConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/voice-chatbot/config.yaml
    /// 3. /etc/voice-chatbot/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::config_dir().map(|c| c.join("voice-chatbot/config.yaml")),
                Some(PathBuf::from("/etc/voice-chatbot/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match serde_yml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InputMode, Theme};

    #[test]
    fn defaults_follow_chat_contract() {
        let config = Config::default();
        assert_eq!(config.completion.model, "gpt-3.5-turbo");
        assert_eq!(config.completion.max_tokens, 150);
        assert!((config.completion.temperature - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.session.language, "en-US");
        assert!((config.tts.speed - 0.9).abs() < f32::EPSILON);
        assert!(!config.hotkey.enabled);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let yaml = r#"
completion:
  backend: ollama
  endpoint: http://localhost:11434
  model: llama3.2:3b
session:
  input_mode: text
  theme: dark
silence:
  duration: 2.0
"#;
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.completion.backend, CompletionBackend::Ollama);
        assert_eq!(config.completion.max_tokens, 150);
        assert_eq!(config.session.input_mode, InputMode::Text);
        assert_eq!(config.session.theme, Theme::Dark);
        assert_eq!(config.session.language, "en-US");
        assert!((config.silence.duration - 2.0).abs() < f64::EPSILON);
        assert!((config.silence.threshold - 0.01).abs() < f32::EPSILON);
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "session:\n  language: ja-JP\n").unwrap();

        let config = Config::load(Some(&path));
        assert_eq!(config.session.language, "ja-JP");
    }

    #[test]
    fn load_falls_back_on_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "session: [not, a, map").unwrap();

        let config = Config::load(Some(&path));
        assert_eq!(config.session.language, "en-US");
    }

    #[test]
    fn inline_api_key_wins() {
        let config = CompletionConfig {
            api_key: Some(" sk-inline ".into()),
            api_key_env: "VOICE_CHATBOT_TEST_UNSET_KEY".into(),
            ..CompletionConfig::default()
        };
        assert_eq!(config.credential().expose(), "sk-inline");

        let config = CompletionConfig {
            api_key: None,
            api_key_env: "VOICE_CHATBOT_TEST_UNSET_KEY".into(),
            ..CompletionConfig::default()
        };
        assert!(config.credential().is_empty());
    }
}
