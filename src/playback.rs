//! Playback adapter over the Kokoro engine.
//!
//! `speak` returns immediately; synthesis and audio run on a spawned task.
//! Each call takes a fresh ticket so only the newest reply is heard.

use std::sync::Arc;

use tracing::{debug, info};

use crate::controller::PlaybackAdapter;
use crate::tts::KokoroTtsEngine;

#[derive(Default)]
pub struct KokoroPlayback {
    engine: Option<Arc<KokoroTtsEngine>>,
}

impl KokoroPlayback {
    pub fn new(engine: Option<Arc<KokoroTtsEngine>>) -> Self {
        Self { engine }
    }
}

impl PlaybackAdapter for KokoroPlayback {
    fn is_available(&self) -> bool {
        self.engine.is_some()
    }

    fn speak(&mut self, text: &str) {
        let Some(engine) = &self.engine else {
            return;
        };
        let engine = Arc::clone(engine);
        let ticket = engine.next_ticket();
        let text = text.to_string();

        tokio::spawn(async move {
            let outcome = engine.speak(&text, ticket).await;
            if outcome.cancelled {
                debug!("Utterance #{ticket} interrupted");
            } else {
                info!(
                    "Spoke utterance #{ticket} (gen={:.0}ms, play={:.0}ms)",
                    outcome.generate_ms, outcome.playback_ms
                );
            }
        });
    }

    fn cancel_current(&mut self) {
        if let Some(engine) = &self.engine {
            engine.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_engine_is_unavailable_noop() {
        let mut playback = KokoroPlayback::default();
        assert!(!playback.is_available());
        playback.cancel_current();
        playback.speak("hello");
    }
}
