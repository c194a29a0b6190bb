//! Echo gate: keeps the assistant from answering its own voice.
//!
//! Even half-duplex hardware leaks: the tail of playback is still in the room
//! when capture resumes, and the recognizer happily transcribes it. The gate
//! rejects an utterance when either
//!
//! - it arrives before the guard deadline set when synthesis began, or
//! - its word set overlaps the last spoken assistant text by at least the
//!   configured threshold.
//!
//! Overlap is the overlap coefficient `|U ∩ A| / min(|U|, |A|)` over sets of
//! lowercased alphanumeric tokens, so a short echo fragment embedded in a
//! longer transcript (or the reverse) still scores high. The flip side: a
//! very short assistant reply rejects any later utterance that contains all of
//! its words, however long.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

/// Default overlap ratio at or above which an utterance is treated as echo.
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.7;

/// Default time after synthesis begins during which all utterances are dropped.
pub const DEFAULT_GUARD_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoGuardConfig {
    pub overlap_threshold: f64,
    pub guard_window: Duration,
}

impl Default for EchoGuardConfig {
    fn default() -> Self {
        Self {
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
            guard_window: DEFAULT_GUARD_WINDOW,
        }
    }
}

/// What the gate remembers about the assistant's last spoken utterance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EchoGuardState {
    /// Normalized tokens of the last synthesized text.
    pub last_assistant_tokens: BTreeSet<String>,
    /// Utterances strictly before this instant are rejected.
    pub deadline: Option<Instant>,
}

/// Why an utterance was rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EchoVerdict {
    Accept,
    /// Arrived inside the guard window.
    WithinGuardWindow,
    /// Too similar to what the assistant just said.
    Overlap(f64),
}

impl EchoVerdict {
    pub const fn is_accept(self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Echo/barge-in guard for one conversation session.
#[derive(Debug, Clone, Default)]
pub struct EchoGate {
    config: EchoGuardConfig,
    state: EchoGuardState,
}

impl EchoGate {
    #[must_use]
    pub fn new(config: EchoGuardConfig) -> Self {
        Self {
            config,
            state: EchoGuardState::default(),
        }
    }

    pub const fn state(&self) -> &EchoGuardState {
        &self.state
    }

    /// Remember `text` as the assistant's latest speech and open the guard window.
    pub fn start_speaking(&mut self, text: &str, now: Instant) {
        self.state.last_assistant_tokens = tokens(text);
        self.state.deadline = Some(now + self.config.guard_window);
        tracing::debug!(
            tokens = self.state.last_assistant_tokens.len(),
            window_ms = self.config.guard_window.as_millis(),
            "Echo guard armed"
        );
    }

    /// Forget the last assistant utterance (new session, explicit reset).
    pub fn clear(&mut self) {
        self.state = EchoGuardState::default();
    }

    /// Classify a finalized utterance.
    pub fn check(&self, text: &str, now: Instant) -> EchoVerdict {
        if let Some(deadline) = self.state.deadline {
            if now < deadline {
                return EchoVerdict::WithinGuardWindow;
            }
        }

        let ratio = overlap_ratio(&tokens(text), &self.state.last_assistant_tokens);
        if ratio >= self.config.overlap_threshold {
            EchoVerdict::Overlap(ratio)
        } else {
            EchoVerdict::Accept
        }
    }

    /// `true` when the utterance should be treated as a real user turn.
    ///
    /// Rejections are logged at debug level and never surface as errors.
    pub fn should_accept(&self, text: &str, now: Instant) -> bool {
        let verdict = self.check(text, now);
        if !verdict.is_accept() {
            tracing::debug!(?verdict, text, "EchoSuppressed");
        }
        verdict.is_accept()
    }
}

/// Lowercased maximal runs of letters and digits.
pub fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Overlap coefficient of two token sets; `0.0` when either is empty.
#[allow(clippy::cast_precision_loss)]
pub fn overlap_ratio(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    shared as f64 / smaller as f64
}
