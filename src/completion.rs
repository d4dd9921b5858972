//! Remote language-model completion.
//!
//! Sends one system instruction plus the user's transcript to either an
//! OpenAI-compatible `/chat/completions` endpoint or Ollama's `/api/chat`,
//! and hands the reply back to the service loop through a channel.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{CompletionBackend, CompletionConfig};
use crate::controller::CompletionDispatcher;
use crate::error::CompletionError;

pub type CompletionResult = Result<String, CompletionError>;

/// What the controller asks for: the user's text and the session language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub language: String,
}

/// API key for the completion endpoint. Never printed.
#[derive(Clone, Default)]
pub struct Credential(String);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "Credential(<none>)")
        } else {
            write!(f, "Credential(***)")
        }
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        language: &str,
        credential: &Credential,
    ) -> CompletionResult;
}

// --- Wire types ---

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: ReplyMessage,
}

/// HTTP completion client for both supported backends.
pub struct ChatCompletionClient {
    config: CompletionConfig,
    client: Client,
}

impl ChatCompletionClient {
    pub fn new(config: CompletionConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn url(&self) -> String {
        let base = self.config.endpoint.trim_end_matches('/');
        match self.config.backend {
            CompletionBackend::OpenAi => format!("{base}/chat/completions"),
            CompletionBackend::Ollama => format!("{base}/api/chat"),
        }
    }

    fn system_instruction(&self, language: &str) -> String {
        self.config.system_prompt.replace("{language}", language)
    }

    fn request_body(&self, prompt: &str, language: &str) -> serde_json::Result<serde_json::Value> {
        let system = self.system_instruction(language);
        let messages = vec![
            ChatMessage {
                role: "system",
                content: &system,
            },
            ChatMessage {
                role: "user",
                content: prompt,
            },
        ];

        match self.config.backend {
            CompletionBackend::OpenAi => serde_json::to_value(OpenAiRequest {
                model: &self.config.model,
                messages,
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            }),
            CompletionBackend::Ollama => serde_json::to_value(OllamaRequest {
                model: &self.config.model,
                messages,
                stream: false,
                options: OllamaOptions {
                    temperature: self.config.temperature,
                    num_predict: self.config.max_tokens,
                },
            }),
        }
    }
}

#[async_trait]
impl CompletionClient for ChatCompletionClient {
    async fn complete(
        &self,
        prompt: &str,
        language: &str,
        credential: &Credential,
    ) -> CompletionResult {
        let body = self
            .request_body(prompt, language)
            .map_err(|e| CompletionError::TransientFailure(format!("encode request: {e}")))?;

        debug!("Sending to {} model '{}': {prompt}", self.config.backend, self.config.model);

        let mut request = self.client.post(self.url()).json(&body);
        if !credential.is_empty() {
            request = request.bearer_auth(credential.expose());
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_connect() {
                warn!("Cannot connect to completion endpoint at {}", self.config.endpoint);
            } else if e.is_timeout() {
                warn!("Completion request timed out");
            }
            CompletionError::TransientFailure(e.to_string())
        })?;

        check_status(resp.status())?;

        let text = resp
            .text()
            .await
            .map_err(|e| CompletionError::TransientFailure(format!("read body: {e}")))?;

        parse_reply(self.config.backend, &text)
    }
}

fn check_status(status: StatusCode) -> Result<(), CompletionError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            warn!("Completion endpoint returned {status}; check the API key");
            Err(CompletionError::Unauthorized)
        }
        _ => Err(CompletionError::TransientFailure(format!("status {status}"))),
    }
}

fn parse_reply(backend: CompletionBackend, body: &str) -> CompletionResult {
    let content = match backend {
        CompletionBackend::OpenAi => serde_json::from_str::<OpenAiResponse>(body)
            .map(|r| r.choices.into_iter().next().and_then(|c| c.message.content)),
        CompletionBackend::Ollama => {
            serde_json::from_str::<OllamaResponse>(body).map(|r| r.message.content)
        }
    }
    .map_err(|e| CompletionError::TransientFailure(format!("malformed reply: {e}")))?;

    let reply = content.unwrap_or_default().trim().to_string();
    if reply.is_empty() {
        return Err(CompletionError::TransientFailure("empty reply".into()));
    }
    Ok(reply)
}

/// Runs each request as a tokio task with a bounded wait and sends the
/// outcome to the service loop.
pub struct SpawnedCompletions {
    client: Arc<dyn CompletionClient>,
    credential: Credential,
    timeout: Duration,
    results: mpsc::UnboundedSender<CompletionResult>,
}

impl SpawnedCompletions {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        credential: Credential,
        timeout: Duration,
        results: mpsc::UnboundedSender<CompletionResult>,
    ) -> Self {
        Self {
            client,
            credential,
            timeout,
            results,
        }
    }
}

impl CompletionDispatcher for SpawnedCompletions {
    fn dispatch(&mut self, request: CompletionRequest) {
        let client = Arc::clone(&self.client);
        let credential = self.credential.clone();
        let timeout = self.timeout;
        let results = self.results.clone();

        tokio::spawn(async move {
            let t0 = Instant::now();
            let call = client.complete(&request.prompt, &request.language, &credential);
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(CompletionError::TransientFailure(format!(
                    "no reply within {}s",
                    timeout.as_secs_f64()
                ))),
            };

            let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;
            match &result {
                Ok(reply) => info!("Completion received in {latency_ms:.0}ms ({} chars)", reply.len()),
                Err(e) => warn!("Completion failed after {latency_ms:.0}ms: {e}"),
            }

            if results.send(result).is_err() {
                debug!("Completion result dropped, service loop has exited");
            }
        });
    }
}
