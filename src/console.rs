//! Line-oriented terminal front end.
//!
//! Parses one command per stdin line and renders the controller's public
//! state: new transcript messages, a status line when the state changes and
//! an error banner when the error changes. Output goes to stdout; logs stay
//! on stderr.

use std::io::{self, Write};

use crossterm::style::{Color, Stylize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::controller::InteractionState;
use crate::conversation::{ConversationStore, Message, Sender};
use crate::error::InteractionError;
use crate::session::{InputMode, SessionConfig, Theme};

pub const HELP: &str = "\
Commands:
  <text>              send a message
  <enter>             start/stop listening (voice mode)
  /listen, /stop      start or stop listening
  /clear              clear the conversation
  /lang <code>        set the language, e.g. /lang fr-FR
  /mode voice|text    switch input mode
  /theme light|dark   switch colours
  /help               show this help
  /quit               exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartCapture,
    StopCapture,
    /// Empty line: the microphone button.
    Toggle,
    Submit(String),
    Clear,
    SetLanguage(String),
    SetMode(InputMode),
    SetTheme(Theme),
    Help,
    Quit,
}

/// Parse one input line. `Err` carries a usage message for the user.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Toggle);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Submit(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    match name.to_ascii_lowercase().as_str() {
        "listen" => Ok(Command::StartCapture),
        "stop" => Ok(Command::StopCapture),
        "clear" => Ok(Command::Clear),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        "lang" | "language" if arg.is_empty() => Err("usage: /lang <code>".into()),
        "lang" | "language" => Ok(Command::SetLanguage(arg.to_string())),
        "mode" => arg.parse().map(Command::SetMode),
        "theme" => arg.parse().map(Command::SetTheme),
        other => Err(format!("unknown command '/{other}', try /help")),
    }
}

/// Forward stdin lines until EOF. The channel closes when stdin does.
pub fn spawn_stdin_reader(tx: mpsc::Sender<String>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {e}");
                    break;
                }
            }
        }
    });
}

struct Palette {
    user: Color,
    assistant: Color,
    status: Color,
    error: Color,
    notice: Color,
}

impl Palette {
    fn for_theme(theme: Theme) -> Self {
        match theme {
            Theme::Light => Self {
                user: Color::DarkBlue,
                assistant: Color::DarkGreen,
                status: Color::DarkGrey,
                error: Color::DarkRed,
                notice: Color::DarkMagenta,
            },
            Theme::Dark => Self {
                user: Color::Cyan,
                assistant: Color::Green,
                status: Color::Grey,
                error: Color::Red,
                notice: Color::Magenta,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Message(Sender, String),
    Status(String),
    Error(String),
    Notice(String),
}

pub fn status_text(state: InteractionState, mode: InputMode) -> &'static str {
    match (state, mode) {
        (InteractionState::Capturing, _) => "Listening... Speak now!",
        (InteractionState::AwaitingCompletion, _) => "AI is thinking...",
        (InteractionState::Idle, InputMode::Voice) => "Press Enter to start talking",
        (InteractionState::Idle, InputMode::Text) => "Type a message and press Enter",
    }
}

fn format_message(message: &Message) -> String {
    let who = match message.sender() {
        Sender::User => "You",
        Sender::Assistant => "AI",
    };
    format!("{} {who}: {}", message.timestamp().format("%H:%M"), message.text())
}

/// Prints only what changed since the previous render.
pub struct Renderer<W> {
    out: W,
    palette: Palette,
    printed: usize,
    epoch: u64,
    last_status: Option<(InteractionState, InputMode)>,
    last_error: Option<InteractionError>,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W, theme: Theme) -> Self {
        Self {
            out,
            palette: Palette::for_theme(theme),
            printed: 0,
            epoch: 0,
            last_status: None,
            last_error: None,
        }
    }

    #[cfg(test)]
    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.palette = Palette::for_theme(theme);
    }

    /// Work out the lines to print for the current state.
    pub fn frame(
        &mut self,
        store: &ConversationStore,
        state: InteractionState,
        error: Option<&InteractionError>,
        session: &SessionConfig,
    ) -> Vec<Line> {
        let mut lines = Vec::new();

        if store.epoch() != self.epoch {
            self.epoch = store.epoch();
            self.printed = 0;
            lines.push(Line::Notice("[conversation cleared]".into()));
        }

        for message in store.iter().skip(self.printed) {
            lines.push(Line::Message(message.sender(), format_message(message)));
        }
        self.printed = store.len();

        if error != self.last_error.as_ref() {
            self.last_error = error.cloned();
            if let Some(e) = error {
                lines.push(Line::Error(e.to_string()));
            }
        }

        let status = (state, session.input_mode);
        if self.last_status != Some(status) {
            self.last_status = Some(status);
            lines.push(Line::Status(status_text(state, session.input_mode).into()));
        }

        lines
    }

    pub fn render(
        &mut self,
        store: &ConversationStore,
        state: InteractionState,
        error: Option<&InteractionError>,
        session: &SessionConfig,
    ) -> io::Result<()> {
        for line in self.frame(store, state, error, session) {
            self.write_line(&line)?;
        }
        self.out.flush()
    }

    pub fn notice(&mut self, text: &str) -> io::Result<()> {
        self.write_line(&Line::Notice(text.to_string()))?;
        self.out.flush()
    }

    fn write_line(&mut self, line: &Line) -> io::Result<()> {
        let p = &self.palette;
        match line {
            Line::Message(Sender::User, text) => writeln!(self.out, "{}", text.as_str().with(p.user)),
            Line::Message(Sender::Assistant, text) => {
                writeln!(self.out, "{}", text.as_str().with(p.assistant))
            }
            Line::Status(text) => writeln!(self.out, "{}", text.as_str().with(p.status).italic()),
            Line::Error(text) => writeln!(self.out, "{}", text.as_str().with(p.error).bold()),
            Line::Notice(text) => writeln!(self.out, "{}", text.as_str().with(p.notice)),
        }
    }
}
