//! Voice engine error types.

use crate::arbiter::AudioMode;

/// Errors that can occur in the voice engine.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// The audio device is leased to the other mode.
    #[error("Audio device is held for {held_by}")]
    ResourceConflict { held_by: AudioMode },

    /// The platform audio route could not be configured or (de)activated.
    #[error("Audio route error: {0}")]
    Route(String),

    /// No microphone is available.
    #[error("No audio input device found")]
    NoInputDevice,

    /// Failed to open or drive the microphone stream.
    #[error("Audio input stream error: {0}")]
    InputStreamError(String),

    /// Failed to open or drive the audio output stream.
    #[error("Failed to open audio output stream: {0}")]
    OutputStreamError(String),

    /// The dedicated audio thread is gone.
    #[error("Audio thread terminated unexpectedly")]
    AudioThreadDied,

    /// The speech recognizer reported an error.
    #[error(transparent)]
    Recognition(#[from] RecognitionError),

    /// The text-generation service failed (network, API, or stream error).
    #[error("Text generation failed: {0}")]
    GenerationTransport(String),

    /// The speech synthesis service failed (network, API, or stream error).
    #[error("Speech synthesis failed: {0}")]
    SynthesisTransport(String),

    /// An audio chunk could not be converted to the output format.
    #[error("Audio conversion failed: {0}")]
    Conversion(String),

    /// The conversation actor is not running.
    #[error("Conversation is not running")]
    NotActive,

    /// The operation was cancelled by the user.
    #[error("Voice operation cancelled")]
    Cancelled,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Whether this error came from a network/API collaborator.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::GenerationTransport(_) | Self::SynthesisTransport(_)
        )
    }
}

/// Errors pushed by a speech recognizer into its session sink.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecognitionError {
    /// Engine hiccup (e.g. "no speech detected"); the session may be restarted.
    #[error("Transient recognizer error: {0}")]
    Transient(String),

    /// The recognizer cannot continue (permission revoked, engine unavailable).
    #[error("Recognizer failed: {0}")]
    Fatal(String),
}
