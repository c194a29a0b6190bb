//! Retry policy shared by every recoverable failure in the engine.
//!
//! One [`RetryPolicy`] carries a [`RetryRule`] per [`ErrorKind`]; a
//! [`RetryTracker`] counts consecutive failures against it and keeps the log
//! quiet while the same error repeats.

use std::time::Duration;

/// Recoverable failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RecognitionTransient,
    ResourceConflict,
    GenerationTransport,
    SynthesisTransport,
}

/// How often and how patiently to retry one kind of failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryRule {
    /// Retries allowed after consecutive failures; `0` never retries.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub cooldown: Duration,
    /// Growth factor per further attempt (`1.0` = fixed cooldown).
    pub multiplier: f64,
}

impl RetryRule {
    pub const NEVER: Self = Self {
        max_attempts: 0,
        cooldown: Duration::ZERO,
        multiplier: 1.0,
    };

    #[must_use]
    pub const fn fixed(max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            max_attempts,
            cooldown,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        self.cooldown.mul_f64(self.multiplier.powi(exponent))
    }
}

/// Retry rules keyed by error kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub recognition: RetryRule,
    pub resource_conflict: RetryRule,
    pub generation: RetryRule,
    pub synthesis: RetryRule,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            recognition: RetryRule::fixed(5, Duration::from_secs(1)),
            resource_conflict: RetryRule::fixed(1, Duration::ZERO),
            generation: RetryRule::NEVER,
            synthesis: RetryRule::NEVER,
        }
    }
}

impl RetryPolicy {
    pub const fn rule(&self, kind: ErrorKind) -> &RetryRule {
        match kind {
            ErrorKind::RecognitionTransient => &self.recognition,
            ErrorKind::ResourceConflict => &self.resource_conflict,
            ErrorKind::GenerationTransport => &self.generation,
            ErrorKind::SynthesisTransport => &self.synthesis,
        }
    }
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Consecutive-failure counter with burst-suppressed logging.
///
/// The first occurrence of an error is logged at warn level; identical
/// repeats are counted silently and summarized once the burst ends.
#[derive(Debug)]
pub struct RetryTracker {
    policy: RetryPolicy,
    kind: Option<ErrorKind>,
    attempts: u32,
    last_message: Option<String>,
    repeats: u32,
}

impl RetryTracker {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            kind: None,
            attempts: 0,
            last_message: None,
            repeats: 0,
        }
    }

    /// Consecutive failures of the current kind.
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure and decide whether to retry.
    pub fn on_error(&mut self, kind: ErrorKind, message: &str) -> RetryDecision {
        if self.kind == Some(kind) {
            self.attempts += 1;
        } else {
            self.kind = Some(kind);
            self.attempts = 1;
        }

        if self.last_message.as_deref() == Some(message) {
            self.repeats += 1;
            tracing::trace!(?kind, repeats = self.repeats, "Repeated error suppressed");
        } else {
            self.flush_burst();
            tracing::warn!(?kind, error = message, "Recoverable error");
            self.last_message = Some(message.to_owned());
        }

        let rule = self.policy.rule(kind);
        if self.attempts > rule.max_attempts {
            tracing::warn!(?kind, attempts = self.attempts, "Retry budget exhausted, giving up");
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(rule.delay(self.attempts))
        }
    }

    /// A successful operation ends the current burst.
    pub fn on_success(&mut self) {
        if self.kind.is_some() {
            tracing::debug!(attempts = self.attempts, "Recovered after retries");
        }
        self.reset();
    }

    /// Forget all failure history.
    pub fn reset(&mut self) {
        self.flush_burst();
        self.kind = None;
        self.attempts = 0;
        self.last_message = None;
    }

    fn flush_burst(&mut self) {
        if self.repeats > 0 {
            tracing::info!(
                error = self.last_message.as_deref().unwrap_or_default(),
                repeats = self.repeats,
                "Error repeated"
            );
            self.repeats = 0;
        }
    }
}
