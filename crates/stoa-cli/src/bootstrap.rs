//! CLI bootstrap - the composition root.
//!
//! This is the only place where concrete adapters are chosen:
//! - Text generation: OpenAI-compatible chat completions
//! - Speech synthesis: ElevenLabs-compatible streaming TTS
//! - Audio output: the default device (`local-audio`) or the paced renderer
//! - Speech input: typed lines, or microphone dictation (`microphone`)
//!
//! Handlers receive a [`CliContext`] and ask it for what they need.

use std::path::PathBuf;
use std::sync::Arc;

use stoa_voice::backend::ChunkStream;
use stoa_voice::backend::elevenlabs::ElevenLabsSynthesizer;
use stoa_voice::backend::openai::OpenAiGenerator;
use stoa_voice::{
    AudioArbiter, AudioRenderer, Collaborators, ConversationConfig, OutputFormat, PacedRenderer,
    SpeechRecognizer, SpeechSynthesizer, VoiceError, VoiceSettings,
};

use crate::config::StoaSettings;
use crate::error::CliError;

/// Bootstrap options taken from global flags.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub config_path: Option<PathBuf>,
    pub no_audio: bool,
}

/// Loaded settings plus adapter factories for command handlers.
#[derive(Debug)]
pub struct CliContext {
    settings: StoaSettings,
    voice: VoiceSettings,
    no_audio: bool,
}

/// Load and validate settings.
pub fn bootstrap(config: CliConfig) -> Result<CliContext, CliError> {
    let settings = StoaSettings::load(config.config_path.as_deref())?;
    let voice = settings.effective_voice()?;
    Ok(CliContext {
        settings,
        voice,
        no_audio: config.no_audio,
    })
}

impl CliContext {
    pub const fn settings(&self) -> &StoaSettings {
        &self.settings
    }

    /// Voice settings with defaults applied.
    pub const fn voice(&self) -> &VoiceSettings {
        &self.voice
    }

    pub fn conversation_config(&self) -> Result<ConversationConfig, CliError> {
        Ok(self.voice.to_config()?)
    }

    pub fn generator(&self, system_prompt: Option<String>) -> Result<OpenAiGenerator, CliError> {
        let mut config = self.settings.openai_config()?;
        if let Some(prompt) = system_prompt {
            config.system_prompt = prompt;
        }
        Ok(OpenAiGenerator::new(config)?)
    }

    pub fn synthesizer(&self) -> Result<ElevenLabsSynthesizer, CliError> {
        Ok(ElevenLabsSynthesizer::new(
            self.settings.elevenlabs_config()?,
        )?)
    }

    /// The synthesizer, or one that fails every request when speech is not
    /// configured. Used where speaking is optional.
    pub fn optional_synthesizer(&self) -> Result<(Arc<dyn SpeechSynthesizer>, OutputFormat), CliError> {
        match self.synthesizer() {
            Ok(synthesizer) => {
                let format = mono(synthesizer.format().sample_rate);
                Ok((Arc::new(synthesizer), format))
            }
            Err(CliError::Config(reason)) => {
                tracing::info!(%reason, "Speech synthesis disabled");
                let rate = self
                    .settings
                    .tts
                    .sample_rate
                    .unwrap_or(stoa_voice::backend::elevenlabs::ElevenLabsConfig::default().sample_rate);
                Ok((Arc::new(UnavailableSynthesizer { reason }), mono(rate)))
            }
            Err(e) => Err(e),
        }
    }

    /// Dictation from the default input device through the transcription endpoint.
    #[cfg(feature = "microphone")]
    pub fn microphone(&self) -> Result<Arc<dyn SpeechRecognizer>, CliError> {
        use stoa_voice::backend::dictation::{DictationConfig, DictationRecognizer};
        use stoa_voice::backend::whisper::WhisperTranscriber;
        use stoa_voice::capture::MicrophoneCapture;

        let transcriber = WhisperTranscriber::new(self.settings.whisper_config()?)?;
        let capture = MicrophoneCapture::new()?;
        Ok(Arc::new(DictationRecognizer::new(
            Arc::new(capture),
            Arc::new(transcriber),
            DictationConfig::default(),
        )))
    }

    #[cfg(not(feature = "microphone"))]
    #[allow(clippy::unused_self)]
    pub fn microphone(&self) -> Result<Arc<dyn SpeechRecognizer>, CliError> {
        Err(CliError::Config(
            "this build has no microphone support (rebuild with --features microphone)".into(),
        ))
    }

    /// Open the default output device, falling back to silent paced playback.
    pub fn renderer(&self, format: OutputFormat) -> Result<Arc<dyn AudioRenderer>, CliError> {
        #[cfg(feature = "local-audio")]
        {
            if !self.no_audio {
                match stoa_voice::render::LocalRenderer::new(format) {
                    Ok(renderer) => return Ok(Arc::new(renderer)),
                    Err(e) => {
                        tracing::warn!(error = %e, "No audio output, playback will be silent");
                    }
                }
            }
        }

        tracing::debug!(no_audio = self.no_audio, "Using paced renderer");
        Ok(Arc::new(PacedRenderer::new(format)?))
    }

    pub fn collaborators(
        &self,
        recognizer: Arc<dyn SpeechRecognizer>,
        generator: OpenAiGenerator,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        renderer: Arc<dyn AudioRenderer>,
    ) -> Collaborators {
        Collaborators {
            recognizer,
            generator: Arc::new(generator),
            synthesizer,
            renderer,
            arbiter: Arc::new(AudioArbiter::desktop()),
        }
    }
}

const fn mono(sample_rate: u32) -> OutputFormat {
    OutputFormat {
        sample_rate,
        channels: 1,
    }
}

/// Stands in when no synthesis credentials are configured.
#[derive(Debug)]
struct UnavailableSynthesizer {
    reason: String,
}

#[async_trait::async_trait]
impl SpeechSynthesizer for UnavailableSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<ChunkStream, VoiceError> {
        Err(VoiceError::SynthesisTransport(self.reason.clone()))
    }
}
