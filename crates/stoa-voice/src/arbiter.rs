//! Audio resource arbiter: exclusive ownership of the audio device.
//!
//! The engine is half-duplex: the microphone and the speaker never hold the
//! device at the same time. Every path that wants the device goes through
//! [`AudioArbiter::request`], and exclusivity is enforced here under a single
//! lock.
//!
//! - the platform route is *configured* only when the requested mode differs
//!   from the last configured one;
//! - [`AudioArbiter::release`] deactivates the route but keeps its
//!   configuration for the next acquisition.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::VoiceError;

// ── Modes and leases ───────────────────────────────────────────────

/// What the audio device is being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioMode {
    /// Microphone capture for speech recognition.
    Capture,

    /// Speaker playback of synthesized speech.
    Playback,
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => f.write_str("capture"),
            Self::Playback => f.write_str("playback"),
        }
    }
}

/// Current owner of the audio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioLease {
    /// Nobody holds the device.
    #[default]
    None,

    /// Held for microphone capture.
    Capture,

    /// Held for speaker playback.
    Playback,
}

impl AudioLease {
    /// The held mode, if any.
    #[must_use]
    pub const fn mode(self) -> Option<AudioMode> {
        match self {
            Self::None => None,
            Self::Capture => Some(AudioMode::Capture),
            Self::Playback => Some(AudioMode::Playback),
        }
    }
}

impl From<AudioMode> for AudioLease {
    fn from(mode: AudioMode) -> Self {
        match mode {
            AudioMode::Capture => Self::Capture,
            AudioMode::Playback => Self::Playback,
        }
    }
}

// ── Platform route ─────────────────────────────────────────────────

/// The platform audio route (session category, sample rate, active flag).
///
/// Implementations are called with the arbiter lock held, so they must not
/// call back into the arbiter.
#[cfg_attr(test, mockall::automock)]
pub trait AudioRoute: Send + Sync {
    /// Configure the route for `mode`.
    fn configure(&self, mode: AudioMode) -> Result<(), VoiceError>;

    /// Activate or deactivate the configured route.
    fn set_active(&self, active: bool) -> Result<(), VoiceError>;
}

/// Route for desktop hosts, where capture and playback need no session setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRoute;

impl AudioRoute for NoopRoute {
    fn configure(&self, mode: AudioMode) -> Result<(), VoiceError> {
        tracing::debug!(%mode, "Audio route configured");
        Ok(())
    }

    fn set_active(&self, active: bool) -> Result<(), VoiceError> {
        tracing::trace!(active, "Audio route activation changed");
        Ok(())
    }
}

// ── Arbiter ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ArbiterState {
    lease: AudioLease,
    configured: Option<AudioMode>,
}

/// Exclusive owner of the audio device for one conversation session.
///
/// Construct one per session and share it by `Arc`; there is no process-wide
/// instance.
pub struct AudioArbiter {
    route: Arc<dyn AudioRoute>,
    state: Mutex<ArbiterState>,
}

impl AudioArbiter {
    /// Create an arbiter that drives `route`.
    #[must_use]
    pub fn new(route: Arc<dyn AudioRoute>) -> Self {
        Self {
            route,
            state: Mutex::new(ArbiterState::default()),
        }
    }

    /// Create an arbiter with a [`NoopRoute`].
    #[must_use]
    pub fn desktop() -> Self {
        Self::new(Arc::new(NoopRoute))
    }

    /// The current lease holder.
    pub fn lease(&self) -> AudioLease {
        self.lock().lease
    }

    /// Acquire the device for `mode`.
    ///
    /// Requesting the mode already held is a no-op. Requesting the other mode
    /// fails with [`VoiceError::ResourceConflict`]; the holder must
    /// [`release`](Self::release) first.
    pub fn request(&self, mode: AudioMode) -> Result<(), VoiceError> {
        let mut state = self.lock();

        match state.lease.mode() {
            Some(held) if held == mode => return Ok(()),
            Some(held) => {
                tracing::debug!(requested = %mode, held_by = %held, "Audio lease conflict");
                return Err(VoiceError::ResourceConflict { held_by: held });
            }
            None => {}
        }

        if state.configured != Some(mode) {
            self.route.configure(mode)?;
            state.configured = Some(mode);
        }
        self.route.set_active(true)?;
        state.lease = mode.into();

        tracing::debug!(%mode, "Audio lease acquired");
        Ok(())
    }

    /// Release whichever lease is held. Idempotent; never fails.
    ///
    /// The route stays configured for the last mode.
    pub fn release(&self) {
        let mut state = self.lock();
        let Some(held) = state.lease.mode() else {
            return;
        };
        state.lease = AudioLease::None;

        if let Err(e) = self.route.set_active(false) {
            tracing::warn!(error = %e, "Failed to deactivate audio route");
        }
        tracing::debug!(mode = %held, "Audio lease released");
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        // The state is two plain enums; a panic mid-update cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for AudioArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioArbiter")
            .field("lease", &self.lease())
            .finish_non_exhaustive()
    }
}
