//! Speech capture adapter: microphone recorder plus Whisper.
//!
//! `begin` starts buffering, `end` asks for a stop, and `poll` (driven by
//! the service tick) finishes the capture once a stop was requested or
//! silence auto-stop fired. Each session reports exactly one event, a
//! transcript or a failure code.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::controller::{CaptureAdapter, CaptureEvent};
use crate::error::InteractionError;
use crate::recorder::{self, AudioRecorder};
use crate::session::primary_subtag;
use crate::transcriber::WhisperTranscriber;

pub const NO_SPEECH: &str = "no-speech";
pub const TRANSCRIPTION_FAILED: &str = "transcription-failed";
pub const AUDIO_CAPTURE: &str = "audio-capture";

struct ActiveCapture {
    language: String,
    stop_requested: bool,
}

pub struct WhisperCapture {
    recorder: Option<AudioRecorder>,
    transcriber: Option<WhisperTranscriber>,
    silence_threshold: f32,
    events: mpsc::UnboundedSender<CaptureEvent>,
    active: Option<ActiveCapture>,
}

impl WhisperCapture {
    /// Either half may be missing; the adapter then reports itself
    /// unavailable.
    pub fn new(
        recorder: Option<AudioRecorder>,
        transcriber: Option<WhisperTranscriber>,
        silence_threshold: f32,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        Self {
            recorder,
            transcriber,
            silence_threshold,
            events,
            active: None,
        }
    }

    fn emit(&self, event: CaptureEvent) {
        // The receiver only goes away when the service loop exits.
        let _ = self.events.send(event);
    }

    fn finish(&self, capture: ActiveCapture, samples: Vec<f32>, sample_rate: u32) {
        if samples.is_empty() || recorder::is_silent(&samples, self.silence_threshold) {
            info!("No speech captured");
            self.emit(CaptureEvent::Failed(NO_SPEECH.into()));
            return;
        }

        let Some(transcriber) = self.transcriber.clone() else {
            self.emit(CaptureEvent::Failed(TRANSCRIPTION_FAILED.into()));
            return;
        };

        info!(
            "Captured {:.1}s of audio, transcribing",
            samples.len() as f64 / f64::from(sample_rate)
        );

        let events = self.events.clone();
        let language = primary_subtag(&capture.language).to_string();
        tokio::spawn(async move {
            let outcome =
                tokio::task::spawn_blocking(move || transcriber.transcribe(&samples, &language)).await;

            let event = match outcome {
                Ok(Ok(text)) if !text.trim().is_empty() => CaptureEvent::Transcript(text),
                Ok(Ok(_)) => CaptureEvent::Failed(NO_SPEECH.into()),
                Ok(Err(e)) => {
                    warn!("{e}");
                    CaptureEvent::Failed(TRANSCRIPTION_FAILED.into())
                }
                Err(e) => {
                    warn!("Transcription task failed: {e}");
                    CaptureEvent::Failed(TRANSCRIPTION_FAILED.into())
                }
            };
            let _ = events.send(event);
        });
    }
}

impl CaptureAdapter for WhisperCapture {
    fn is_available(&self) -> bool {
        self.transcriber.is_some() && self.recorder.as_ref().is_some_and(AudioRecorder::is_open)
    }

    fn begin(&mut self, language: &str) -> Result<(), InteractionError> {
        let Some(recorder) = &self.recorder else {
            return Err(InteractionError::CaptureFailure(AUDIO_CAPTURE.into()));
        };
        if self.active.is_some() {
            return Err(InteractionError::CaptureFailure(AUDIO_CAPTURE.into()));
        }

        recorder.start();
        self.active = Some(ActiveCapture {
            language: language.to_string(),
            stop_requested: false,
        });
        Ok(())
    }

    fn end(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.stop_requested = true;
        }
    }

    fn poll(&mut self) {
        let (Some(active), Some(recorder)) = (&self.active, &self.recorder) else {
            return;
        };
        if !active.stop_requested && !recorder.should_auto_stop() {
            return;
        }
        if !active.stop_requested {
            info!("Auto-stop triggered by silence detection");
        }

        let samples = recorder.stop();
        let sample_rate = recorder.sample_rate();
        if let Some(capture) = self.active.take() {
            self.finish(capture, samples, sample_rate);
        }
    }
}
