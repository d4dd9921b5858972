//! Voice-interaction controller.
//!
//! Owns the conversation, the session settings and the interaction state,
//! and drives the capture → completion → playback cycle:
//!
//! ```text
//! IDLE → CAPTURING → AWAITING_COMPLETION → IDLE
//! IDLE → AWAITING_COMPLETION (typed input)
//! ```
//!
//! Every entry point is guarded by the current state, so at most one capture
//! session and one completion request exist at a time. Device and network
//! callbacks arrive through the service loop and are fed in one at a time.

use std::fmt;

use tracing::{debug, info, warn};

use crate::completion::CompletionRequest;
use crate::conversation::{ConversationStore, Message, Sender};
use crate::error::{Capability, CompletionError, InteractionError, Rejected};
use crate::session::{InputMode, SessionConfig, Theme};

/// Appended in place of a reply when the completion request fails.
pub const APOLOGY: &str = "Sorry, I couldn't process that request. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionState {
    Idle,
    Capturing,
    AwaitingCompletion,
}

impl fmt::Display for InteractionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Capturing => write!(f, "CAPTURING"),
            Self::AwaitingCompletion => write!(f, "AWAITING_COMPLETION"),
        }
    }
}

/// Speech-to-text device. Each session started with `begin` reports
/// exactly one [`CaptureEvent`], fed back through
/// [`VoiceController::handle_capture_event`].
pub trait CaptureAdapter {
    /// Capability query, checked at the start of every capture.
    fn is_available(&self) -> bool;

    fn begin(&mut self, language: &str) -> Result<(), InteractionError>;

    /// Advisory stop. The session still reports its outcome when done.
    fn end(&mut self);

    /// Periodic housekeeping (silence auto-stop and the like).
    fn poll(&mut self) {}
}

/// Final outcome of one capture session. The session has ended by the time
/// this is sent, so nothing from it can arrive after the next `begin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Transcript(String),
    /// Device error code, e.g. `no-speech`.
    Failed(String),
}

/// Text-to-speech device.
pub trait PlaybackAdapter {
    fn is_available(&self) -> bool;
    fn speak(&mut self, text: &str);
    fn cancel_current(&mut self);
}

/// Issues a completion request whose result comes back later through
/// [`VoiceController::handle_completion`].
pub trait CompletionDispatcher {
    fn dispatch(&mut self, request: CompletionRequest);
}

pub struct VoiceController<C, P, D> {
    capture: C,
    playback: P,
    completions: D,
    state: InteractionState,
    store: ConversationStore,
    session: SessionConfig,
    error: Option<InteractionError>,
    playback_reported: bool,
}

impl<C, P, D> VoiceController<C, P, D>
where
    C: CaptureAdapter,
    P: PlaybackAdapter,
    D: CompletionDispatcher,
{
    pub fn new(capture: C, playback: P, completions: D, session: SessionConfig) -> Self {
        Self {
            capture,
            playback,
            completions,
            state: InteractionState::Idle,
            store: ConversationStore::new(),
            session,
            error: None,
            playback_reported: false,
        }
    }

    // --- Read view ---

    pub fn state(&self) -> InteractionState {
        self.state
    }

    pub fn error(&self) -> Option<&InteractionError> {
        self.error.as_ref()
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> + '_ {
        self.store.iter()
    }

    pub fn capture(&self) -> &C {
        &self.capture
    }

    pub fn capture_mut(&mut self) -> &mut C {
        &mut self.capture
    }

    #[cfg(test)]
    pub fn playback(&self) -> &P {
        &self.playback
    }

    pub fn playback_mut(&mut self) -> &mut P {
        &mut self.playback
    }

    #[cfg(test)]
    pub fn completions(&self) -> &D {
        &self.completions
    }

    // --- Commands ---

    pub fn start_capture(&mut self) -> Result<(), Rejected> {
        if self.state != InteractionState::Idle {
            debug!("start_capture ignored in state {}", self.state);
            return Err(Rejected::Busy(self.state));
        }

        if !self.capture.is_available() {
            warn!("Speech capture is not available");
            self.error = Some(InteractionError::CapabilityUnavailable(Capability::Capture));
            return Err(Rejected::CapabilityUnavailable(Capability::Capture));
        }

        if let Err(e) = self.capture.begin(&self.session.language) {
            warn!("Capture failed to start: {e}");
            self.error = Some(e);
            return Err(Rejected::CaptureStartFailed);
        }

        self.error = None;
        self.transition(InteractionState::Capturing);
        Ok(())
    }

    pub fn stop_capture(&mut self) -> Result<(), Rejected> {
        if self.state != InteractionState::Capturing {
            debug!("stop_capture ignored in state {}", self.state);
            return Err(Rejected::NotCapturing);
        }
        self.capture.end();
        info!("Capture stop requested");
        Ok(())
    }

    pub fn submit_text(&mut self, text: &str) -> Result<(), Rejected> {
        if self.state != InteractionState::Idle {
            debug!("submit_text ignored in state {}", self.state);
            return Err(Rejected::Busy(self.state));
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(Rejected::EmptyText);
        }

        self.error = None;
        self.request_completion(text.to_string());
        Ok(())
    }

    /// Empties the conversation and the error banner. In-flight work keeps
    /// running and its result lands in the emptied log.
    pub fn clear(&mut self) {
        self.store.clear();
        self.error = None;
        info!("Conversation cleared (state {})", self.state);
    }

    pub fn set_language(&mut self, code: &str) {
        let code = code.trim();
        if code.is_empty() {
            return;
        }
        info!("Language: {} → {code}", self.session.language);
        self.session.language = code.to_string();
    }

    pub fn set_input_mode(&mut self, mode: InputMode) {
        info!("Input mode: {} → {mode}", self.session.input_mode);
        self.session.input_mode = mode;
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.session.theme = theme;
    }

    // --- Device and network callbacks ---

    pub fn handle_capture_result(&mut self, transcript: &str) {
        if self.state != InteractionState::Capturing {
            debug!("Dropping stale capture result");
            return;
        }

        let transcript = transcript.trim();
        if transcript.is_empty() {
            self.handle_capture_error("no-speech");
            return;
        }

        self.request_completion(transcript.to_string());
    }

    pub fn handle_capture_error(&mut self, code: &str) {
        if self.state != InteractionState::Capturing {
            debug!("Dropping capture error '{code}' in state {}", self.state);
            return;
        }
        warn!("Speech recognition error: {code}");
        self.error = Some(InteractionError::CaptureFailure(code.to_string()));
        self.transition(InteractionState::Idle);
    }

    pub fn handle_capture_end(&mut self) {
        if self.state == InteractionState::Capturing {
            self.transition(InteractionState::Idle);
        }
    }

    /// Apply a session's outcome and its end in one step.
    pub fn handle_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Transcript(text) => self.handle_capture_result(&text),
            CaptureEvent::Failed(code) => self.handle_capture_error(&code),
        }
        self.handle_capture_end();
    }

    pub fn handle_completion(&mut self, result: Result<String, CompletionError>) {
        if self.state != InteractionState::AwaitingCompletion {
            debug!("Dropping completion result in state {}", self.state);
            return;
        }

        match result {
            Ok(reply) if !reply.trim().is_empty() => {
                let reply = reply.trim().to_string();
                self.store.push(Sender::Assistant, reply.as_str());
                self.play(&reply);
            }
            Ok(_) => {
                warn!("Completion returned an empty reply");
                self.store.push(Sender::Assistant, APOLOGY);
            }
            Err(e) => {
                warn!("{e}");
                self.store.push(Sender::Assistant, APOLOGY);
            }
        }

        self.transition(InteractionState::Idle);
    }

    // --- Internals ---

    fn request_completion(&mut self, prompt: String) {
        self.store.push(Sender::User, prompt.as_str());
        self.transition(InteractionState::AwaitingCompletion);
        self.completions.dispatch(CompletionRequest {
            prompt,
            language: self.session.language.clone(),
        });
    }

    /// Newest reply wins: whatever is playing gets cut off first.
    fn play(&mut self, text: &str) {
        if !self.playback.is_available() {
            if !self.playback_reported {
                self.playback_reported = true;
                self.error = Some(InteractionError::CapabilityUnavailable(Capability::Playback));
            }
            return;
        }
        self.playback.cancel_current();
        self.playback.speak(text);
    }

    fn transition(&mut self, to: InteractionState) {
        info!("State: {} → {to}", self.state);
        self.state = to;
    }
}
