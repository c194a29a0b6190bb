//! Half-duplex voice conversation engine.
//!
//! Listens to the user, decides when they have finished speaking, asks a
//! text generator for a reply, speaks it back, and returns to listening,
//! without ever capturing and playing audio at the same time.
//!
//! # Architecture
//!
//! ```text
//!  recognizer ──▶ TurnCandidate ──▶ EchoGate ──▶ TextGenerator
//!       ▲                                              │
//!       │          AudioArbiter (capture | playback)   ▼
//!       └──────── grace period ◀── StreamingPlayer ◀── SpeechSynthesizer
//! ```
//!
//! [`Conversation`] is the orchestrator. It owns all mutable state on a
//! single task and is driven through a [`ConversationHandle`]; progress is
//! reported as [`ConversationEvent`]s.
//!
//! External engines plug in through the traits in [`backend`]; audio output
//! goes through an [`AudioRenderer`](render::AudioRenderer).
//!
//! # Features
//!
//! - `local-audio`: speaker output on the default device via `rodio`.
//! - `microphone`: default-input capture via `cpal`, for
//!   [`DictationRecognizer`](backend::dictation::DictationRecognizer).

pub mod arbiter;
pub mod backend;
#[cfg(feature = "microphone")]
pub mod capture;
pub mod config;
pub mod conversation;
pub mod convert;
pub mod error;
pub mod gate;
pub mod player;
pub mod render;
pub mod retry;
pub mod turn;

pub use arbiter::{AudioArbiter, AudioLease, AudioMode, AudioRoute, NoopRoute};
pub use backend::{
    AudioChunk, ChunkStream, DeltaStream, Exchange, FrameSource, RecognitionSink,
    SpeechRecognizer, SpeechSynthesizer, TextGenerator, Transcriber,
};
pub use config::{ConversationConfig, SettingsError, VoiceSettings};
pub use conversation::{
    Collaborators, Conversation, ConversationEvent, ConversationHandle, ConversationState,
};
pub use convert::{AudioFormat, OutputFormat, SampleEncoding};
pub use error::{RecognitionError, VoiceError};
pub use gate::{EchoGate, EchoGuardConfig, EchoVerdict};
pub use player::{PlaybackOutcome, StreamingPlayer, SynthesisHandle};
pub use render::{AudioRenderer, PacedRenderer};
pub use retry::{RetryPolicy, RetryRule};
pub use turn::{TurnCandidate, TurnConfig, TurnTrigger, Utterance};
