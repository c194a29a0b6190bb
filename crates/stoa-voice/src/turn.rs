//! Turn segmentation: partial/final recognizer updates → one utterance.
//!
//! A [`TurnCandidate`] lives for exactly one listening session. Three triggers
//! race to finalize it and the first one wins:
//!
//! 1. **Stability**: the same partial text is reported again after more than
//!    `stability_window` since it was first seen.
//! 2. **Silence**: no update arrives for `silence_threshold`.
//! 3. **Final marker**: the recognizer flags an update as final.
//!
//! The candidate is a pure state machine. Time is passed in, and the silence
//! timer is exposed as a deadline ([`TurnCandidate::silence_deadline`]) that
//! the owner sleeps on and then reports back through
//! [`TurnCandidate::on_silence`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Default time a partial must stay unchanged before it counts as stable.
pub const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_millis(300);

/// Default time without updates before the turn is considered finished.
pub const DEFAULT_SILENCE_THRESHOLD: Duration = Duration::from_millis(600);

/// Timing knobs for turn detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnConfig {
    pub stability_window: Duration,
    pub silence_threshold: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            stability_window: DEFAULT_STABILITY_WINDOW,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
        }
    }
}

/// Which rule finalized an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnTrigger {
    /// The same partial was repeated after the stability window.
    Stability,
    /// No recognizer update arrived for the silence threshold.
    Silence,
    /// The recognizer marked the update as final.
    FinalMarker,
    /// The user typed the turn instead of speaking it.
    Typed,
}

impl fmt::Display for TurnTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stability => "stability",
            Self::Silence => "silence",
            Self::FinalMarker => "final",
            Self::Typed => "typed",
        };
        f.write_str(name)
    }
}

/// A finalized user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utterance {
    pub text: String,
    pub trigger: TurnTrigger,
    pub timestamp: DateTime<Utc>,
}

impl Utterance {
    /// Build an utterance from already-trimmed, non-empty text.
    #[must_use]
    pub fn new(text: impl Into<String>, trigger: TurnTrigger) -> Self {
        Self {
            text: text.into(),
            trigger,
            timestamp: Utc::now(),
        }
    }

    /// A typed turn. Returns `None` for empty or whitespace-only input.
    #[must_use]
    pub fn typed(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(Self::new(text, TurnTrigger::Typed))
        }
    }
}

/// Per-session turn state.
#[derive(Debug)]
pub struct TurnCandidate {
    config: TurnConfig,
    /// Latest text seen, fired or not.
    accumulated: String,
    last_stable_text: Option<String>,
    last_stable_at: Option<Instant>,
    silence_deadline: Option<Instant>,
    fired: bool,
}

impl TurnCandidate {
    #[must_use]
    pub const fn new(config: TurnConfig) -> Self {
        Self {
            config,
            accumulated: String::new(),
            last_stable_text: None,
            last_stable_at: None,
            silence_deadline: None,
            fired: false,
        }
    }

    /// Latest recognizer text (kept for display even after firing).
    pub fn text(&self) -> &str {
        &self.accumulated
    }

    /// Whether this candidate has already produced its utterance.
    pub const fn has_fired(&self) -> bool {
        self.fired
    }

    /// When the silence trigger is due, if armed.
    pub const fn silence_deadline(&self) -> Option<Instant> {
        self.silence_deadline
    }

    /// Record a recognizer update, possibly finalizing the turn.
    pub fn update(&mut self, text: &str, is_final: bool, now: Instant) -> Option<Utterance> {
        text.clone_into(&mut self.accumulated);

        if self.fired {
            return None;
        }

        if is_final {
            if let Some(utterance) = self.fire(TurnTrigger::FinalMarker) {
                return Some(utterance);
            }
        } else if self.is_stable(text, now) {
            if let Some(utterance) = self.fire(TurnTrigger::Stability) {
                return Some(utterance);
            }
        } else if self.last_stable_text.as_deref() != Some(text) {
            self.last_stable_text = Some(text.to_owned());
            self.last_stable_at = Some(now);
        }

        self.silence_deadline = Some(now + self.config.silence_threshold);
        None
    }

    /// Report that the silence deadline may have elapsed.
    ///
    /// Fires with the accumulated text when the deadline has passed. An
    /// elapsed deadline with nothing to say just disarms the timer.
    pub fn on_silence(&mut self, now: Instant) -> Option<Utterance> {
        let deadline = self.silence_deadline?;
        if self.fired || now < deadline {
            return None;
        }
        self.silence_deadline = None;
        self.fire(TurnTrigger::Silence)
    }

    fn is_stable(&self, text: &str, now: Instant) -> bool {
        match (&self.last_stable_text, self.last_stable_at) {
            (Some(stable), Some(at)) => {
                stable == text && now.duration_since(at) > self.config.stability_window
            }
            _ => false,
        }
    }

    fn fire(&mut self, trigger: TurnTrigger) -> Option<Utterance> {
        let text = self.accumulated.trim();
        if text.is_empty() {
            return None;
        }
        let utterance = Utterance::new(text, trigger);
        self.fired = true;
        self.silence_deadline = None;
        tracing::debug!(%trigger, text = %utterance.text, "Turn finalized");
        Some(utterance)
    }
}
