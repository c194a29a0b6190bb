//! Conversation settings and their validated runtime form.
//!
//! [`VoiceSettings`] is the serializable, all-optional shape that config files
//! and flags fill in; [`ConversationConfig`] is the resolved value the
//! conversation actor runs with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gate::{DEFAULT_GUARD_WINDOW, DEFAULT_OVERLAP_THRESHOLD, EchoGuardConfig};
use crate::retry::{RetryPolicy, RetryRule};
use crate::turn::{DEFAULT_SILENCE_THRESHOLD, DEFAULT_STABILITY_WINDOW, TurnConfig};

/// Text shown and spoken when a response could not be produced.
pub const DEFAULT_FALLBACK_NOTICE: &str =
    "I apologize, but I couldn't process your request. Please try again.";

/// Default pause between the end of playback and re-opening the microphone.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Default number of exchanges kept as generation context.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

const DEFAULT_RECOGNIZER_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_RECOGNIZER_RETRY_COOLDOWN: Duration = Duration::from_secs(1);

#[allow(clippy::cast_possible_truncation)]
const fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// User-facing voice settings.
///
/// All fields are optional so partial config files and flag overrides can be
/// layered with [`merge`](Self::merge).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VoiceSettings {
    /// How long a repeated partial must stay unchanged to end the turn.
    pub stability_window_ms: Option<u64>,

    /// Silence after the last recognizer update that ends the turn.
    pub silence_threshold_ms: Option<u64>,

    /// Word-overlap ratio (0.0–1.0) at which a transcript is treated as echo.
    pub echo_overlap_threshold: Option<f64>,

    /// Time after speech starts during which every transcript is dropped.
    pub echo_guard_window_ms: Option<u64>,

    /// Playback gain multiplier (0.0–4.0).
    pub gain: Option<f32>,

    /// Return to listening after each reply instead of going idle.
    pub continuous: Option<bool>,

    /// Pause between end of playback and re-opening the microphone.
    pub grace_period_ms: Option<u64>,

    /// Speak replies aloud (otherwise display only).
    pub auto_speak: Option<bool>,

    /// Completed exchanges kept as context for generation.
    pub history_limit: Option<usize>,

    /// Consecutive transient recognizer errors tolerated before giving up.
    pub recognizer_retry_attempts: Option<u32>,

    /// Pause before restarting the recognizer after a transient error.
    pub recognizer_retry_cooldown_ms: Option<u64>,

    /// Text shown and spoken when a reply could not be produced.
    pub fallback_notice: Option<String>,
}

impl VoiceSettings {
    /// Settings with every field set to its default.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            stability_window_ms: Some(millis(DEFAULT_STABILITY_WINDOW)),
            silence_threshold_ms: Some(millis(DEFAULT_SILENCE_THRESHOLD)),
            echo_overlap_threshold: Some(DEFAULT_OVERLAP_THRESHOLD),
            echo_guard_window_ms: Some(millis(DEFAULT_GUARD_WINDOW)),
            gain: Some(1.0),
            continuous: Some(true),
            grace_period_ms: Some(millis(DEFAULT_GRACE_PERIOD)),
            auto_speak: Some(true),
            history_limit: Some(DEFAULT_HISTORY_LIMIT),
            recognizer_retry_attempts: Some(DEFAULT_RECOGNIZER_RETRY_ATTEMPTS),
            recognizer_retry_cooldown_ms: Some(millis(DEFAULT_RECOGNIZER_RETRY_COOLDOWN)),
            fallback_notice: Some(DEFAULT_FALLBACK_NOTICE.to_string()),
        }
    }

    /// Overlay every field that is set in `other`.
    pub fn merge(&mut self, other: &Self) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(
                    if other.$field.is_some() {
                        self.$field.clone_from(&other.$field);
                    }
                )*
            };
        }
        take!(
            stability_window_ms,
            silence_threshold_ms,
            echo_overlap_threshold,
            echo_guard_window_ms,
            gain,
            continuous,
            grace_period_ms,
            auto_speak,
            history_limit,
            recognizer_retry_attempts,
            recognizer_retry_cooldown_ms,
            fallback_notice,
        );
    }

    /// Effective playback gain.
    pub fn effective_gain(&self) -> f32 {
        self.gain.unwrap_or(1.0)
    }

    /// Effective continuous-listening flag.
    pub fn effective_continuous(&self) -> bool {
        self.continuous.unwrap_or(true)
    }

    /// Effective speak-replies flag.
    pub fn effective_auto_speak(&self) -> bool {
        self.auto_speak.unwrap_or(true)
    }

    /// Validate and resolve into the runtime configuration.
    pub fn to_config(&self) -> Result<ConversationConfig, SettingsError> {
        validate_settings(self)?;

        let ms = |value: Option<u64>, default: Duration| {
            value.map_or(default, Duration::from_millis)
        };

        let retry = RetryPolicy {
            recognition: RetryRule::fixed(
                self.recognizer_retry_attempts
                    .unwrap_or(DEFAULT_RECOGNIZER_RETRY_ATTEMPTS),
                ms(
                    self.recognizer_retry_cooldown_ms,
                    DEFAULT_RECOGNIZER_RETRY_COOLDOWN,
                ),
            ),
            ..RetryPolicy::default()
        };

        Ok(ConversationConfig {
            turn: TurnConfig {
                stability_window: ms(self.stability_window_ms, DEFAULT_STABILITY_WINDOW),
                silence_threshold: ms(self.silence_threshold_ms, DEFAULT_SILENCE_THRESHOLD),
            },
            echo: EchoGuardConfig {
                overlap_threshold: self
                    .echo_overlap_threshold
                    .unwrap_or(DEFAULT_OVERLAP_THRESHOLD),
                guard_window: ms(self.echo_guard_window_ms, DEFAULT_GUARD_WINDOW),
            },
            gain: self.effective_gain(),
            continuous: self.effective_continuous(),
            grace_period: ms(self.grace_period_ms, DEFAULT_GRACE_PERIOD),
            auto_speak: self.effective_auto_speak(),
            history_limit: self.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
            retry,
            fallback_notice: self
                .fallback_notice
                .clone()
                .unwrap_or_else(|| DEFAULT_FALLBACK_NOTICE.to_string()),
        })
    }
}

/// Settings validation error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    #[error("Stability window must be between 50 and 5000 ms, got {0}")]
    InvalidStabilityWindow(u64),

    #[error("Silence threshold must be between 100 and 10000 ms, got {0}")]
    InvalidSilenceThreshold(u64),

    #[error("Echo overlap threshold must be in (0.0, 1.0], got {0}")]
    InvalidOverlapThreshold(f64),

    #[error("Gain must be between 0.0 and 4.0, got {0}")]
    InvalidGain(f32),

    #[error("Fallback notice cannot be empty")]
    EmptyFallbackNotice,
}

/// Validate settings values.
pub fn validate_settings(settings: &VoiceSettings) -> Result<(), SettingsError> {
    if let Some(window) = settings.stability_window_ms {
        if !(50..=5_000).contains(&window) {
            return Err(SettingsError::InvalidStabilityWindow(window));
        }
    }

    if let Some(threshold) = settings.silence_threshold_ms {
        if !(100..=10_000).contains(&threshold) {
            return Err(SettingsError::InvalidSilenceThreshold(threshold));
        }
    }

    if let Some(ratio) = settings.echo_overlap_threshold {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(SettingsError::InvalidOverlapThreshold(ratio));
        }
    }

    if let Some(gain) = settings.gain {
        if !(0.0..=4.0).contains(&gain) {
            return Err(SettingsError::InvalidGain(gain));
        }
    }

    if settings
        .fallback_notice
        .as_ref()
        .is_some_and(|n| n.trim().is_empty())
    {
        return Err(SettingsError::EmptyFallbackNotice);
    }

    Ok(())
}

/// Resolved runtime configuration for one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationConfig {
    pub turn: TurnConfig,
    pub echo: EchoGuardConfig,
    /// Playback gain; samples are clamped to `[-1.0, 1.0]` after scaling.
    pub gain: f32,
    pub continuous: bool,
    pub grace_period: Duration,
    pub auto_speak: bool,
    pub history_limit: usize,
    pub retry: RetryPolicy,
    pub fallback_notice: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            turn: TurnConfig::default(),
            echo: EchoGuardConfig::default(),
            gain: 1.0,
            continuous: true,
            grace_period: DEFAULT_GRACE_PERIOD,
            auto_speak: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
            retry: RetryPolicy::default(),
            fallback_notice: DEFAULT_FALLBACK_NOTICE.to_string(),
        }
    }
}
