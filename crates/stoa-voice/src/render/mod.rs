//! Audio output: where converted samples are actually played.
//!
//! | Renderer           | Feature       | Output                                     |
//! |--------------------|---------------|--------------------------------------------|
//! | [`PacedRenderer`]  | always        | none; completes each chunk in real time    |
//! | `LocalRenderer`    | `local-audio` | default output device via `rodio`          |

#[cfg(feature = "local-audio")]
mod local;
mod paced;

#[cfg(feature = "local-audio")]
pub use local::LocalRenderer;
pub use paced::PacedRenderer;

use crate::convert::OutputFormat;
use crate::error::VoiceError;

/// Invoked from the renderer's own thread once a scheduled chunk has been
/// played out.
pub type RenderedCallback = Box<dyn FnOnce() + Send + 'static>;

/// A sink for interleaved `f32` samples in [`output_format`](Self::output_format).
pub trait AudioRenderer: Send + Sync {
    /// Format every scheduled buffer must already be in.
    fn output_format(&self) -> OutputFormat;

    /// Queue `samples` after everything already scheduled.
    ///
    /// `on_rendered` fires exactly once when the buffer has played, unless
    /// [`stop`](Self::stop) discards it first, in which case it is dropped
    /// without being called.
    fn schedule(&self, samples: Vec<f32>, on_rendered: RenderedCallback) -> Result<(), VoiceError>;

    /// Silence output immediately and discard everything queued.
    fn stop(&self);
}
