//! Terminal stand-in for a microphone.
//!
//! While the conversation is listening, each typed line is delivered to the
//! current recognition session as a final transcript, so it goes through the
//! same turn detection and echo guard as speech would.

use std::sync::{Mutex, MutexGuard, PoisonError};

use stoa_voice::{RecognitionSink, SpeechRecognizer, VoiceError};

#[derive(Debug, Default)]
pub struct KeyboardRecognizer {
    sink: Mutex<Option<RecognitionSink>>,
}

impl KeyboardRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a recognition session is open.
    pub fn is_listening(&self) -> bool {
        self.lock().is_some()
    }

    /// Hand a typed line to the open session.
    ///
    /// Returns `false` when no session is open or the conversation is gone.
    pub fn deliver(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        self.lock()
            .as_ref()
            .is_some_and(|sink| sink.update(line, true))
    }

    fn lock(&self) -> MutexGuard<'_, Option<RecognitionSink>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SpeechRecognizer for KeyboardRecognizer {
    fn start(&self, sink: RecognitionSink) -> Result<(), VoiceError> {
        tracing::trace!(session = sink.session(), "Keyboard session opened");
        *self.lock() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        if let Some(sink) = self.lock().take() {
            tracing::trace!(session = sink.session(), "Keyboard session closed");
        }
    }
}
