//! Service loop: the single owner of the controller.
//!
//! Console lines, push-to-talk edges, capture events and completion results
//! arrive on channels and are fed to the controller one at a time. A 100 ms
//! tick drives capture auto-stop. After every event the console re-renders
//! whatever changed.

use std::io::{self, Stdout, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::capture::WhisperCapture;
use crate::completion::{CompletionClient, CompletionResult, Credential, SpawnedCompletions};
use crate::config::{Config, HotkeyConfig};
use crate::console::{self, Command, Renderer};
use crate::controller::{
    CaptureAdapter, CaptureEvent, InteractionState, PlaybackAdapter, VoiceController,
};
use crate::error::{Capability, Rejected};
use crate::hotkey::{HotkeyEvent, HotkeyMonitor};
use crate::playback::KokoroPlayback;
use crate::recorder::AudioRecorder;
use crate::session::InputMode;
use crate::transcriber::WhisperTranscriber;
use crate::tts::KokoroTtsEngine;

/// Whatever start-up managed to load. Missing pieces make the matching
/// capability unavailable.
pub struct Devices {
    pub recorder: Option<AudioRecorder>,
    pub transcriber: Option<WhisperTranscriber>,
    pub tts: Option<Arc<KokoroTtsEngine>>,
}

pub struct ChatService<C = WhisperCapture, W = Stdout> {
    controller: VoiceController<C, KokoroPlayback, SpawnedCompletions>,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    completion_rx: mpsc::UnboundedReceiver<CompletionResult>,
    renderer: Renderer<W>,
    hotkey: HotkeyConfig,
}

enum Flow {
    Continue,
    Quit,
}

impl ChatService {
    pub fn new(
        config: Config,
        devices: Devices,
        client: Arc<dyn CompletionClient>,
        credential: Credential,
    ) -> Self {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let capture = WhisperCapture::new(
            devices.recorder,
            devices.transcriber,
            config.silence.threshold,
            capture_tx,
        );
        Self::with_capture(
            config,
            capture,
            capture_rx,
            KokoroPlayback::new(devices.tts),
            client,
            credential,
            io::stdout(),
        )
    }
}

impl<C: CaptureAdapter, W: Write> ChatService<C, W> {
    fn with_capture(
        config: Config,
        capture: C,
        capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
        playback: KokoroPlayback,
        client: Arc<dyn CompletionClient>,
        credential: Credential,
        out: W,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let completions = SpawnedCompletions::new(
            client,
            credential,
            Duration::from_secs(config.completion.timeout_secs),
            completion_tx,
        );

        Self {
            renderer: Renderer::new(out, config.session.theme),
            controller: VoiceController::new(capture, playback, completions, config.session),
            capture_rx,
            completion_rx,
            hotkey: config.hotkey,
        }
    }

    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
        console::spawn_stdin_reader(line_tx);

        let mut hotkey_rx = if self.hotkey.enabled {
            let (hotkey_tx, hotkey_rx) = mpsc::channel::<HotkeyEvent>(16);
            let monitor = HotkeyMonitor::new(&self.hotkey, hotkey_tx);
            tokio::spawn(monitor.run());
            Some(hotkey_rx)
        } else {
            None
        };

        self.greet()?;
        info!("Service ready");

        let mut tick = tokio::time::interval(Duration::from_millis(100));

        loop {
            tokio::select! {
                line = line_rx.recv() => {
                    let Some(line) = line else {
                        info!("Input closed, shutting down");
                        break;
                    };
                    if let Flow::Quit = self.on_line(&line)? {
                        break;
                    }
                }
                Some(event) = self.capture_rx.recv() => {
                    self.controller.handle_capture_event(event);
                }
                Some(result) = self.completion_rx.recv() => {
                    self.controller.handle_completion(result);
                }
                edge = recv_hotkey(&mut hotkey_rx) => {
                    match edge {
                        Some(HotkeyEvent::Pressed) => self.start_capture()?,
                        Some(HotkeyEvent::Released) => self.stop_capture()?,
                        None => {
                            warn!("Push-to-talk monitor stopped");
                            hotkey_rx = None;
                        }
                    }
                }
                _ = tick.tick() => {
                    self.controller.capture_mut().poll();
                }
            }
            self.render()?;
        }

        self.controller.playback_mut().cancel_current();
        if !self.controller.store().is_empty() {
            info!("Session ended after {} messages", self.controller.messages().count());
        }
        Ok(())
    }

    /// First screen. Voice mode without a working microphone starts in text
    /// mode instead.
    fn greet(&mut self) -> io::Result<()> {
        if self.controller.session().input_mode == InputMode::Voice
            && !self.controller.capture().is_available()
        {
            self.fall_back_to_text()?;
        }
        self.renderer.notice("Type /help for commands.")?;
        self.render()
    }

    fn on_line(&mut self, line: &str) -> io::Result<Flow> {
        let command = match console::parse_command(line) {
            Ok(command) => command,
            Err(usage) => {
                self.renderer.notice(&usage)?;
                return Ok(Flow::Continue);
            }
        };

        match command {
            Command::Quit => return Ok(Flow::Quit),
            Command::Help => self.renderer.notice(console::HELP)?,
            Command::StartCapture => self.start_capture()?,
            Command::StopCapture => self.stop_capture()?,
            Command::Toggle => self.toggle_capture()?,
            Command::Submit(text) => {
                if let Err(rejected) = self.controller.submit_text(&text) {
                    self.report(&rejected)?;
                }
            }
            Command::Clear => self.controller.clear(),
            Command::SetLanguage(code) => {
                self.controller.set_language(&code);
                let session = self.controller.session();
                let notice = format!(
                    "Language: {} (speech recognition: {})",
                    session.language,
                    session.primary_language()
                );
                self.renderer.notice(&notice)?;
            }
            Command::SetMode(mode) => self.controller.set_input_mode(mode),
            Command::SetTheme(theme) => {
                self.controller.set_theme(theme);
                self.renderer.set_theme(theme);
            }
        }
        Ok(Flow::Continue)
    }

    /// Empty line: the microphone button. Only meaningful in voice mode.
    fn toggle_capture(&mut self) -> io::Result<()> {
        if self.controller.session().input_mode != InputMode::Voice {
            return Ok(());
        }
        match self.controller.state() {
            InteractionState::Capturing => self.stop_capture(),
            _ => self.start_capture(),
        }
    }

    fn start_capture(&mut self) -> io::Result<()> {
        match self.controller.start_capture() {
            Ok(()) => Ok(()),
            Err(Rejected::CapabilityUnavailable(Capability::Capture)) => self.fall_back_to_text(),
            Err(rejected) => self.report(&rejected),
        }
    }

    fn stop_capture(&mut self) -> io::Result<()> {
        match self.controller.stop_capture() {
            Ok(()) => Ok(()),
            Err(rejected) => self.report(&rejected),
        }
    }

    fn fall_back_to_text(&mut self) -> io::Result<()> {
        if self.controller.session().input_mode == InputMode::Text {
            return Ok(());
        }
        warn!("Speech capture unavailable, switching to text input");
        self.controller.set_input_mode(InputMode::Text);
        self.renderer.notice("Voice input is unavailable, switched to text mode.")
    }

    fn report(&mut self, rejected: &Rejected) -> io::Result<()> {
        match rejected {
            // Already on screen as the error banner.
            Rejected::CapabilityUnavailable(_) | Rejected::CaptureStartFailed => Ok(()),
            Rejected::Busy(InteractionState::AwaitingCompletion) => {
                self.renderer.notice("Still waiting for the last reply.")
            }
            Rejected::Busy(InteractionState::Capturing) => {
                self.renderer.notice("Still listening. Press Enter or /stop first.")
            }
            other => self.renderer.notice(&format!("Ignored: {other}")),
        }
    }

    fn render(&mut self) -> io::Result<()> {
        let c = &self.controller;
        self.renderer.render(c.store(), c.state(), c.error(), c.session())
    }
}

async fn recv_hotkey(rx: &mut Option<mpsc::Receiver<HotkeyEvent>>) -> Option<HotkeyEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::conversation::Sender;
    use crate::error::InteractionError;

    /// Microphone whose `end` immediately reports the scripted outcome.
    struct ScriptedMic {
        available: bool,
        active: bool,
        begins: usize,
        outcome: CaptureEvent,
        events: mpsc::UnboundedSender<CaptureEvent>,
    }

    impl CaptureAdapter for ScriptedMic {
        fn is_available(&self) -> bool {
            self.available
        }

        fn begin(&mut self, _language: &str) -> Result<(), InteractionError> {
            if self.active {
                return Err(InteractionError::CaptureFailure("audio-capture".into()));
            }
            self.active = true;
            self.begins += 1;
            Ok(())
        }

        fn end(&mut self) {
            if self.active {
                self.active = false;
                let _ = self.events.send(self.outcome.clone());
            }
        }
    }

    struct Echo;

    #[async_trait]
    impl CompletionClient for Echo {
        async fn complete(
            &self,
            prompt: &str,
            _language: &str,
            _credential: &Credential,
        ) -> CompletionResult {
            Ok(format!("echo: {prompt}"))
        }
    }

    type TestService = ChatService<ScriptedMic, Vec<u8>>;

    fn service(mic_available: bool, outcome: CaptureEvent) -> TestService {
        let (tx, rx) = mpsc::unbounded_channel();
        let mic = ScriptedMic {
            available: mic_available,
            active: false,
            begins: 0,
            outcome,
            events: tx,
        };
        ChatService::with_capture(
            Config::default(),
            mic,
            rx,
            KokoroPlayback::default(),
            Arc::new(Echo),
            Credential::new("sk-test"),
            Vec::new(),
        )
    }

    fn printed(s: &TestService) -> String {
        String::from_utf8_lossy(s.renderer.output()).into_owned()
    }

    /// Deliver whatever the microphone has queued, as the loop would.
    fn pump_capture(s: &mut TestService) {
        while let Ok(event) = s.capture_rx.try_recv() {
            s.controller.handle_capture_event(event);
        }
    }

    #[test]
    fn starts_in_text_mode_without_microphone() {
        let mut s = service(false, CaptureEvent::Failed("no-speech".into()));
        s.greet().unwrap();

        assert_eq!(s.controller.session().input_mode, InputMode::Text);
        assert_eq!(s.controller.error(), None);
        assert!(printed(&s).contains("switched to text mode"));
        assert!(printed(&s).contains("Type a message and press Enter"));
    }

    #[test]
    fn listen_without_microphone_falls_back_to_text() {
        let mut s = service(false, CaptureEvent::Failed("no-speech".into()));
        s.on_line("/listen").unwrap();

        assert_eq!(s.controller.state(), InteractionState::Idle);
        assert_eq!(s.controller.session().input_mode, InputMode::Text);
        assert_eq!(
            s.controller.error(),
            Some(&InteractionError::CapabilityUnavailable(Capability::Capture))
        );
    }

    #[tokio::test]
    async fn empty_line_toggles_only_in_voice_mode() {
        let mut s = service(true, CaptureEvent::Transcript("hello".into()));
        s.on_line("/mode text").unwrap();
        s.on_line("").unwrap();
        assert_eq!(s.controller.state(), InteractionState::Idle);
        assert_eq!(s.controller.capture().begins, 0);

        s.on_line("/mode voice").unwrap();
        s.on_line("").unwrap();
        assert_eq!(s.controller.state(), InteractionState::Capturing);
        s.on_line("").unwrap();
        pump_capture(&mut s);
        assert_eq!(s.controller.state(), InteractionState::AwaitingCompletion);
    }

    #[tokio::test]
    async fn failed_capture_then_relisten_keeps_new_capture() {
        let mut s = service(true, CaptureEvent::Failed("no-speech".into()));
        s.on_line("/listen").unwrap();
        s.on_line("/stop").unwrap();
        pump_capture(&mut s);
        assert_eq!(s.controller.state(), InteractionState::Idle);

        s.on_line("/listen").unwrap();
        assert_eq!(s.controller.state(), InteractionState::Capturing);
        assert_eq!(s.controller.error(), None);

        // Nothing from the first session is left to end the second one.
        assert!(s.capture_rx.try_recv().is_err());
        assert_eq!(s.controller.state(), InteractionState::Capturing);
        assert!(s.controller.capture().active);
        assert_eq!(s.controller.capture().begins, 2);
    }

    #[tokio::test]
    async fn typed_message_round_trip() {
        let mut s = service(true, CaptureEvent::Failed("no-speech".into()));
        s.on_line("  hello  ").unwrap();
        assert_eq!(s.controller.state(), InteractionState::AwaitingCompletion);

        s.on_line("again").unwrap();
        s.on_line("/listen").unwrap();
        assert!(printed(&s).contains("Still waiting for the last reply."));
        assert_eq!(s.controller.store().len(), 1);

        let result = s.completion_rx.recv().await.unwrap();
        s.controller.handle_completion(result);
        s.render().unwrap();

        let messages: Vec<_> = s
            .controller
            .messages()
            .map(|m| (m.sender(), m.text().to_string()))
            .collect();
        assert_eq!(
            messages,
            [
                (Sender::User, "hello".to_string()),
                (Sender::Assistant, "echo: hello".to_string()),
            ]
        );
        assert_eq!(s.controller.state(), InteractionState::Idle);
        assert!(printed(&s).contains("AI: echo: hello"));
        // No TTS engine loaded.
        assert_eq!(
            s.controller.error(),
            Some(&InteractionError::CapabilityUnavailable(Capability::Playback))
        );
    }

    #[test]
    fn rejected_commands_become_notices() {
        let mut s = service(true, CaptureEvent::Failed("no-speech".into()));
        s.on_line("/stop").unwrap();
        assert!(printed(&s).contains("Ignored: not capturing"));

        s.on_line("/listen").unwrap();
        s.on_line("/listen").unwrap();
        assert!(printed(&s).contains("Still listening"));

        s.on_line("/bogus").unwrap();
        assert!(printed(&s).contains("unknown command '/bogus'"));
    }

    #[test]
    fn settings_and_quit() {
        let mut s = service(true, CaptureEvent::Failed("no-speech".into()));
        s.on_line("/lang pt-BR").unwrap();
        assert_eq!(s.controller.session().language, "pt-BR");
        assert!(printed(&s).contains("speech recognition: pt"));

        s.on_line("/theme dark").unwrap();
        assert_eq!(s.controller.session().theme, crate::session::Theme::Dark);

        assert!(matches!(s.on_line("/quit"), Ok(Flow::Quit)));
    }
}
