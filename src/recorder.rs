//! Microphone recording with cpal.
//!
//! The input stream stays open for the whole session so a capture starts
//! without device latency. Samples are only buffered while a capture is
//! active. Silence after speech, or hitting the length cap, flags the
//! capture for auto-stop; the capture adapter picks that up on its next poll.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tracing::{debug, info, warn};

use crate::config::{AudioConfig, RecordingConfig, SilenceConfig};

pub struct AudioRecorder {
    config: AudioConfig,
    shared: Arc<Mutex<Buffering>>,
    stream: Option<Stream>,
}

/// Capture buffer plus silence-detection state, shared with the cpal
/// callback thread.
struct Buffering {
    silence: SilenceConfig,
    max_samples: usize,
    active: bool,
    buffer: Vec<f32>,
    started_at: Option<Instant>,
    silence_since: Option<Instant>,
    heard_speech: bool,
    auto_stop: bool,
}

impl Buffering {
    fn new(silence: SilenceConfig, max_samples: usize) -> Self {
        Self {
            silence,
            max_samples,
            active: false,
            buffer: Vec::new(),
            started_at: None,
            silence_since: None,
            heard_speech: false,
            auto_stop: false,
        }
    }

    fn start(&mut self, now: Instant) {
        self.buffer.clear();
        self.active = true;
        self.started_at = Some(now);
        self.silence_since = None;
        self.heard_speech = false;
        self.auto_stop = false;
    }

    fn stop(&mut self) -> Vec<f32> {
        self.active = false;
        self.started_at = None;
        std::mem::take(&mut self.buffer)
    }

    /// Append one chunk from the device and update auto-stop.
    fn ingest(&mut self, data: &[f32], now: Instant) {
        if !self.active || self.auto_stop {
            return;
        }

        let room = self.max_samples.saturating_sub(self.buffer.len());
        self.buffer.extend_from_slice(&data[..data.len().min(room)]);
        if self.buffer.len() >= self.max_samples {
            warn!("Max recording length reached");
            self.auto_stop = true;
            return;
        }

        let Some(started) = self.started_at else {
            return;
        };
        let elapsed = now.duration_since(started).as_secs_f64();
        if elapsed >= self.silence.max_recording_duration {
            info!("Max capture duration reached ({}s)", self.silence.max_recording_duration);
            self.auto_stop = true;
            return;
        }

        if rms_energy(data) >= self.silence.threshold {
            self.heard_speech = true;
            self.silence_since = None;
            return;
        }

        // Only trailing silence ends a capture, and not before the minimum.
        if !self.heard_speech || elapsed < self.silence.min_speech_duration {
            return;
        }
        let since = *self.silence_since.get_or_insert(now);
        if now.duration_since(since).as_secs_f64() >= self.silence.duration {
            debug!("Silence for {}s, auto-stopping", self.silence.duration);
            self.auto_stop = true;
        }
    }
}

impl AudioRecorder {
    pub fn new(audio: AudioConfig, recording: &RecordingConfig, silence: SilenceConfig) -> Self {
        let max_samples = (recording.max_duration * f64::from(audio.sample_rate)) as usize;
        Self {
            config: audio,
            shared: Arc::new(Mutex::new(Buffering::new(silence, max_samples))),
            stream: None,
        }
    }

    /// Open the default input device. Call once at startup.
    pub fn open_stream(&mut self) -> Result<(), String> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device = cpal::default_host()
            .default_input_device()
            .ok_or("No input audio device available")?;
        info!("Using audio input: {}", device.name().unwrap_or_else(|_| "unknown".into()));

        let stream_config = StreamConfig {
            channels: self.config.channels,
            sample_rate: SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.config.chunk_size),
        };

        let shared = Arc::clone(&self.shared);
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    shared
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .ingest(data, Instant::now());
                },
                move |err| warn!("Audio input error: {err}"),
                None,
            )
            .map_err(|e| format!("Failed to build input stream: {e}"))?;

        stream
            .play()
            .map_err(|e| format!("Failed to start audio stream: {e}"))?;
        info!("Audio input stream open");

        self.stream = Some(stream);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn start(&self) {
        self.lock().start(Instant::now());
        info!("Recording started");
    }

    /// Stop recording and return the captured mono f32 samples.
    pub fn stop(&self) -> Vec<f32> {
        let samples = self.lock().stop();
        info!(
            "Recording stopped: {:.1}s ({} samples)",
            samples.len() as f64 / f64::from(self.config.sample_rate),
            samples.len()
        );
        samples
    }

    pub fn should_auto_stop(&self) -> bool {
        self.lock().auto_stop
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Buffering> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether a whole capture is too quiet to be worth transcribing.
pub fn is_silent(samples: &[f32], threshold: f32) -> bool {
    let rms = rms_energy(samples);
    debug!("Audio RMS energy: {rms:.4} (threshold: {threshold})");
    rms < threshold
}

fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const LOUD: [f32; 4] = [0.5, -0.5, 0.5, -0.5];
    const QUIET: [f32; 4] = [0.0; 4];

    fn buffering() -> Buffering {
        Buffering::new(SilenceConfig::default(), 16000 * 60)
    }

    fn at(start: Instant, secs: f64) -> Instant {
        start + Duration::from_secs_f64(secs)
    }

    #[test]
    fn ignores_audio_until_started() {
        let mut b = buffering();
        b.ingest(&LOUD, Instant::now());
        assert!(b.buffer.is_empty());
    }

    #[test]
    fn trailing_silence_triggers_auto_stop() {
        let t0 = Instant::now();
        let mut b = buffering();
        b.start(t0);

        b.ingest(&LOUD, at(t0, 0.2));
        b.ingest(&QUIET, at(t0, 0.8));
        assert!(!b.auto_stop);
        b.ingest(&QUIET, at(t0, 2.0));
        assert!(!b.auto_stop);
        b.ingest(&QUIET, at(t0, 2.4));
        assert!(b.auto_stop);

        assert_eq!(b.stop().len(), 16);
        assert!(!b.active);
    }

    #[test]
    fn speech_resets_silence_timer() {
        let t0 = Instant::now();
        let mut b = buffering();
        b.start(t0);

        b.ingest(&LOUD, at(t0, 0.6));
        b.ingest(&QUIET, at(t0, 1.0));
        b.ingest(&LOUD, at(t0, 2.0));
        b.ingest(&QUIET, at(t0, 2.6));
        assert!(!b.auto_stop);
    }

    #[test]
    fn leading_silence_does_not_stop() {
        let t0 = Instant::now();
        let mut b = buffering();
        b.start(t0);

        b.ingest(&QUIET, at(t0, 0.6));
        b.ingest(&QUIET, at(t0, 5.0));
        assert!(!b.auto_stop);
    }

    #[test]
    fn length_caps_trigger_auto_stop() {
        let t0 = Instant::now();
        let mut b = Buffering::new(SilenceConfig::default(), 6);
        b.start(t0);
        b.ingest(&LOUD, at(t0, 0.1));
        b.ingest(&LOUD, at(t0, 0.2));
        assert!(b.auto_stop);
        assert_eq!(b.buffer.len(), 6);

        let mut b = buffering();
        b.start(t0);
        b.ingest(&LOUD, at(t0, 31.0));
        assert!(b.auto_stop);
    }

    #[test]
    fn silence_check() {
        assert!(is_silent(&[], 0.01));
        assert!(is_silent(&QUIET, 0.01));
        assert!(!is_silent(&LOUD, 0.01));
    }
}
