//! Collaborator ports: speech recognition, text generation and synthesis.
//!
//! The conversation actor only ever talks to these traits, so engines and
//! hosted services can be swapped without touching turn-taking logic.
//!
//! ## Adapters shipped with the crate
//!
//! | Module            | Port                  | Service                              |
//! |-------------------|-----------------------|--------------------------------------|
//! | [`openai`]        | [`TextGenerator`]     | OpenAI-compatible chat completions   |
//! | [`elevenlabs`]    | [`SpeechSynthesizer`] | ElevenLabs-compatible streaming TTS  |
//! | [`whisper`]       | [`Transcriber`]       | OpenAI-compatible audio transcription|
//! | [`dictation`]     | [`SpeechRecognizer`]  | any [`FrameSource`] + [`Transcriber`]|

pub mod dictation;
pub mod elevenlabs;
pub mod openai;
pub mod whisper;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::convert::AudioFormat;
use crate::error::{RecognitionError, VoiceError};

// ── Shared types ───────────────────────────────────────────────────

/// One piece of synthesized audio as delivered by the synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Raw sample bytes in `format.encoding`.
    pub data: Bytes,

    /// Declared format of `data`.
    pub format: AudioFormat,

    /// Position of this chunk within its synthesis stream.
    pub seq: u64,
}

/// A completed user/assistant exchange, fed back to the generator as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

/// Incremental response text. The stream ending is the completion marker.
pub type DeltaStream = BoxStream<'static, Result<String, VoiceError>>;

/// Incremental synthesized audio. The stream ending is end-of-stream.
pub type ChunkStream = BoxStream<'static, Result<AudioChunk, VoiceError>>;

/// Default gap allowed between two reads of a streaming response body.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Bound the gap between items of a response body.
///
/// A body that stays silent for `limit` yields one error and ends, so a stalled
/// upstream surfaces as a transport failure instead of hanging the turn.
pub fn stall_guard<S, E>(byte_stream: S, limit: Duration) -> BoxStream<'static, Result<Bytes, String>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    futures_util::stream::unfold(Some(byte_stream.boxed()), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(limit, stream.next()).await {
            Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(stream))),
            Ok(Some(Err(e))) => Some((Err(e.to_string()), Some(stream))),
            Ok(None) => None,
            Err(_) => {
                tracing::warn!(limit_ms = limit.as_millis(), "Response body stalled");
                Some((
                    Err(format!("no data received for {:.1}s", limit.as_secs_f32())),
                    None,
                ))
            }
        }
    })
    .boxed()
}

// ── Speech recognition ─────────────────────────────────────────────

/// What a recognizer reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    Update { text: String, is_final: bool },
    Failed(RecognitionError),
}

/// A recognizer event tagged with the listening session that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizerMessage {
    pub session: u64,
    pub event: RecognizerEvent,
}

/// Where a recognizer delivers its results for one listening session.
///
/// Cloneable and callable from any thread. Results posted after the session
/// ended are discarded by the receiver, so recognizers never need to
/// synchronize with the conversation.
#[derive(Debug, Clone)]
pub struct RecognitionSink {
    session: u64,
    tx: mpsc::UnboundedSender<RecognizerMessage>,
}

impl RecognitionSink {
    #[must_use]
    pub const fn new(session: u64, tx: mpsc::UnboundedSender<RecognizerMessage>) -> Self {
        Self { session, tx }
    }

    /// The listening session this sink belongs to.
    pub const fn session(&self) -> u64 {
        self.session
    }

    /// Report partial (`is_final = false`) or final text.
    ///
    /// Returns `false` once the conversation is gone.
    pub fn update(&self, text: impl Into<String>, is_final: bool) -> bool {
        self.post(RecognizerEvent::Update {
            text: text.into(),
            is_final,
        })
    }

    /// Report a terminal error for this session.
    pub fn fail(&self, error: RecognitionError) -> bool {
        self.post(RecognizerEvent::Failed(error))
    }

    fn post(&self, event: RecognizerEvent) -> bool {
        self.tx
            .send(RecognizerMessage {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Streaming speech-to-text engine.
///
/// `start` begins a new recognition session that reports into `sink` until
/// `stop` is called. Both are called from the conversation actor and must not
/// block.
pub trait SpeechRecognizer: Send + Sync {
    fn start(&self, sink: RecognitionSink) -> Result<(), VoiceError>;

    fn stop(&self);
}

// ── Dictation ──────────────────────────────────────────────────────

/// Batch speech-to-text: one buffer of mono samples in, text out.
#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe `samples` (mono, `sample_rate` Hz). Silence may yield an empty string.
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String, RecognitionError>;
}

/// Live mono audio, e.g. a microphone.
pub trait FrameSource: Send + Sync {
    /// Rate of every frame delivered.
    fn sample_rate(&self) -> u32;

    /// Begin delivering frames into `frames`, replacing any previous receiver.
    fn start(&self, frames: mpsc::UnboundedSender<Vec<f32>>) -> Result<(), VoiceError>;

    fn stop(&self);
}

// ── Text generation ────────────────────────────────────────────────

/// Streaming response generator (LLM).
#[async_trait::async_trait]
pub trait TextGenerator: Send + Sync {
    /// Start generating a response to `prompt` with prior `history`.
    async fn generate(&self, prompt: &str, history: &[Exchange]) -> Result<DeltaStream, VoiceError>;
}

// ── Speech synthesis ───────────────────────────────────────────────

/// Streaming text-to-speech engine.
#[async_trait::async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Start synthesizing `text`; chunks arrive as the service produces them.
    async fn synthesize(&self, text: &str) -> Result<ChunkStream, VoiceError>;
}
