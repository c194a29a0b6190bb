//! Streaming recognition built from live audio plus a batch [`Transcriber`].
//!
//! A session cuts the incoming frames with an energy detector. Each pause in
//! speech re-transcribes everything heard so far and reports it as a partial,
//! which keeps the conversation's stability and silence triggers working.
//! An utterance that reaches `max_utterance` is transcribed once more and
//! reported as final.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{FrameSource, RecognitionSink, SpeechRecognizer, Transcriber};
use crate::error::{RecognitionError, VoiceError};

/// Segmentation knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DictationConfig {
    /// RMS level at or above which a frame counts as speech.
    pub energy_threshold: f32,
    /// Quiet time after speech that triggers a partial transcription.
    pub pause: Duration,
    /// Audio kept from before the first loud frame.
    pub pre_roll: Duration,
    /// Longest utterance before it is forced final.
    pub max_utterance: Duration,
}

impl Default for DictationConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.015,
            pause: Duration::from_millis(400),
            pre_roll: Duration::from_millis(300),
            max_utterance: Duration::from_secs(30),
        }
    }
}

/// Where the segmenter cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Speech stopped for `pause`; the utterance may continue.
    Pause,
    /// The utterance hit `max_utterance`.
    Full,
}

/// Energy-based utterance segmenter over mono frames.
#[derive(Debug, Clone)]
pub struct Segmenter {
    config: DictationConfig,
    sample_rate: u32,
    audio: Vec<f32>,
    heard_speech: bool,
    pause_pending: bool,
    silent_samples: usize,
}

impl Segmenter {
    pub const fn new(config: DictationConfig, sample_rate: u32) -> Self {
        Self {
            config,
            sample_rate,
            audio: Vec::new(),
            heard_speech: false,
            pause_pending: false,
            silent_samples: 0,
        }
    }

    /// Feed one frame; reports a boundary at most once per pause.
    pub fn push(&mut self, frame: &[f32]) -> Option<Boundary> {
        self.audio.extend_from_slice(frame);

        if rms(frame) >= self.config.energy_threshold {
            self.heard_speech = true;
            self.pause_pending = true;
            self.silent_samples = 0;
        } else if self.heard_speech {
            self.silent_samples += frame.len();
        } else {
            let keep = self.samples(self.config.pre_roll);
            if self.audio.len() > keep {
                let excess = self.audio.len() - keep;
                self.audio.drain(..excess);
            }
            return None;
        }

        if self.audio.len() >= self.samples(self.config.max_utterance) {
            return Some(Boundary::Full);
        }
        if self.pause_pending && self.silent_samples >= self.samples(self.config.pause) {
            self.pause_pending = false;
            return Some(Boundary::Pause);
        }
        None
    }

    /// Everything captured since speech began (plus pre-roll).
    pub fn audio(&self) -> &[f32] {
        &self.audio
    }

    /// Hand over the utterance and start afresh.
    pub fn take(&mut self) -> Vec<f32> {
        self.heard_speech = false;
        self.pause_pending = false;
        self.silent_samples = 0;
        std::mem::take(&mut self.audio)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn samples(&self, duration: Duration) -> usize {
        (u128::from(self.sample_rate) * duration.as_millis() / 1000) as usize
    }
}

/// Root mean square of a frame; `0.0` for an empty one.
#[allow(clippy::cast_precision_loss)]
pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame.iter().map(|s| s * s).sum();
    (sum / frame.len() as f32).sqrt()
}

/// [`SpeechRecognizer`] that dictates from a [`FrameSource`].
pub struct DictationRecognizer {
    source: Arc<dyn FrameSource>,
    transcriber: Arc<dyn Transcriber>,
    config: DictationConfig,
    session: Mutex<Option<CancellationToken>>,
}

impl DictationRecognizer {
    pub fn new(
        source: Arc<dyn FrameSource>,
        transcriber: Arc<dyn Transcriber>,
        config: DictationConfig,
    ) -> Self {
        Self {
            source,
            transcriber,
            config,
            session: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DictationRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictationRecognizer")
            .field("config", &self.config)
            .field("active", &self.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl SpeechRecognizer for DictationRecognizer {
    fn start(&self, sink: RecognitionSink) -> Result<(), VoiceError> {
        self.stop();

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        self.source.start(frames_tx)?;

        let cancel = CancellationToken::new();
        let segmenter = Segmenter::new(self.config, self.source.sample_rate());
        tracing::debug!(session = sink.session(), "Dictation session opened");
        tokio::spawn(run_session(
            frames_rx,
            sink,
            Arc::clone(&self.transcriber),
            segmenter,
            cancel.clone(),
        ));
        *self.lock() = Some(cancel);
        Ok(())
    }

    fn stop(&self) {
        if let Some(cancel) = self.lock().take() {
            cancel.cancel();
            self.source.stop();
        }
    }
}

async fn run_session(
    mut frames: mpsc::UnboundedReceiver<Vec<f32>>,
    sink: RecognitionSink,
    transcriber: Arc<dyn Transcriber>,
    mut segmenter: Segmenter,
    cancel: CancellationToken,
) {
    let sample_rate = segmenter.sample_rate;
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            sink.fail(RecognitionError::Fatal("microphone stream closed".into()));
            break;
        };

        let (audio, is_final) = match segmenter.push(&frame) {
            None => continue,
            Some(Boundary::Pause) => (segmenter.audio().to_vec(), false),
            Some(Boundary::Full) => (segmenter.take(), true),
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = transcriber.transcribe(&audio, sample_rate) => result,
        };
        match result {
            Ok(text) if text.is_empty() => {
                tracing::trace!(samples = audio.len(), "No words in segment");
            }
            Ok(text) => {
                if !sink.update(text, is_final) {
                    break;
                }
            }
            Err(error) => {
                sink.fail(error);
                break;
            }
        }
    }
    tracing::debug!(session = sink.session(), "Dictation session closed");
}
