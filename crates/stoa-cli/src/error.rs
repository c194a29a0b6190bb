//! CLI-specific error types and exit codes.

use stoa_voice::{SettingsError, VoiceError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    /// Voice engine error.
    #[error("{0}")]
    Voice(String),

    /// Argument parsing error.
    #[error("Invalid arguments: {0}")]
    Arguments(String),

    /// IO error (file not found, permission denied, etc.).
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Audio device could not be opened.
    #[error("Audio device error: {0}")]
    Audio(String),
}

impl CliError {
    /// Map error to an exit code (sysexits.h where one fits).
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Voice(_) => 1,
            Self::Arguments(_) => 2, // EX_USAGE
            Self::Io(_) => 74,       // EX_IOERR
            Self::Config(_) => 78,   // EX_CONFIG
            Self::Audio(_) => 69,    // EX_UNAVAILABLE
        }
    }
}

impl From<VoiceError> for CliError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::OutputStreamError(_)
            | VoiceError::NoInputDevice
            | VoiceError::InputStreamError(_)
            | VoiceError::AudioThreadDied
            | VoiceError::ResourceConflict { .. }
            | VoiceError::Route(_) => Self::Audio(err.to_string()),
            VoiceError::Io(e) => Self::Io(e.to_string()),
            other => Self::Voice(other.to_string()),
        }
    }
}

impl From<SettingsError> for CliError {
    fn from(err: SettingsError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
