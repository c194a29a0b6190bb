//! Layered CLI settings: TOML file, then environment, then flags.
//!
//! ```toml
//! [voice]
//! silence_threshold_ms = 800
//! continuous = true
//!
//! [llm]
//! model = "gpt-4o-mini"
//!
//! [tts]
//! voice_id = "JBFqnCBsd6RMkjVDRZzb"
//!
//! [stt]
//! language = "en"
//! ```
//!
//! API keys are only read from the environment (`OPENAI_API_KEY`,
//! `ELEVENLABS_API_KEY`, or a `.env` file) and are never printed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stoa_voice::VoiceSettings;
use stoa_voice::backend::elevenlabs::{self, ElevenLabsConfig};
use stoa_voice::backend::openai::{self, OpenAiConfig};
use stoa_voice::backend::whisper::{self, WhisperConfig};

use crate::error::CliError;

/// Settings file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "stoa.toml";

/// Persona used when no system prompt is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a Stoic philosopher and mentor in the tradition of \
Marcus Aurelius, Epictetus and Seneca. Answer in two or three short spoken sentences, plainly and \
warmly, and end with a question that invites reflection when it helps. Never use lists, markdown or \
emoji; your words will be read aloud.";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmSettings {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsSettings {
    pub base_url: Option<String>,
    pub voice_id: Option<String>,
    pub model_id: Option<String>,
    pub sample_rate: Option<u32>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

/// Microphone transcription; shares the `[llm]` endpoint and key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SttSettings {
    pub model: Option<String>,
    pub language: Option<String>,
}

/// Everything `stoa` can be configured with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoaSettings {
    pub voice: VoiceSettings,
    pub llm: LlmSettings,
    pub tts: TtsSettings,
    pub stt: SttSettings,
}

impl StoaSettings {
    /// Load from `path` (must exist) or from `./stoa.toml` (optional), then
    /// overlay the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, CliError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::from_file(&fallback)?
                } else {
                    Self::default()
                }
            }
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, CliError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CliError::Io(format!("{}: {e}", path.display())))?;
        let settings: Self = toml::from_str(&text)
            .map_err(|e| CliError::Config(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "Loaded settings file");
        Ok(settings)
    }

    /// Overlay environment variables read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = non_empty("OPENAI_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        if let Some(model) = non_empty("STOA_LLM_MODEL") {
            self.llm.model = Some(model);
        }
        if let Some(key) = non_empty("ELEVENLABS_API_KEY") {
            self.tts.api_key = Some(key);
        }
        if let Some(voice) = non_empty("STOA_VOICE_ID") {
            self.tts.voice_id = Some(voice);
        }
    }

    /// Voice settings with defaults filled in, validated.
    pub fn effective_voice(&self) -> Result<VoiceSettings, CliError> {
        let mut voice = VoiceSettings::with_defaults();
        voice.merge(&self.voice);
        stoa_voice::config::validate_settings(&voice)?;
        Ok(voice)
    }

    /// Every setting resolved to the value that will be used.
    pub fn effective(&self) -> Result<Self, CliError> {
        let tts_defaults = ElevenLabsConfig::default();
        let mut shown = self.clone();
        shown.voice = self.effective_voice()?;
        shown
            .llm
            .base_url
            .get_or_insert_with(|| openai::DEFAULT_BASE_URL.to_string());
        shown
            .llm
            .model
            .get_or_insert_with(|| openai::DEFAULT_MODEL.to_string());
        shown
            .llm
            .system_prompt
            .get_or_insert_with(|| DEFAULT_SYSTEM_PROMPT.to_string());
        shown.tts.base_url.get_or_insert(tts_defaults.base_url);
        shown.tts.voice_id.get_or_insert(tts_defaults.voice_id);
        shown.tts.model_id.get_or_insert(tts_defaults.model_id);
        shown.tts.sample_rate.get_or_insert(tts_defaults.sample_rate);
        shown
            .stt
            .model
            .get_or_insert_with(|| whisper::DEFAULT_MODEL.to_string());
        Ok(shown)
    }

    pub fn system_prompt(&self) -> &str {
        self.llm
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    pub fn openai_config(&self) -> Result<OpenAiConfig, CliError> {
        let api_key = self.llm.api_key.clone().ok_or_else(|| {
            CliError::Config("OPENAI_API_KEY is not set (environment or .env)".into())
        })?;
        Ok(OpenAiConfig {
            base_url: self
                .llm
                .base_url
                .clone()
                .unwrap_or_else(|| openai::DEFAULT_BASE_URL.to_string()),
            api_key,
            model: self
                .llm
                .model
                .clone()
                .unwrap_or_else(|| openai::DEFAULT_MODEL.to_string()),
            system_prompt: self.system_prompt().to_string(),
            temperature: self.llm.temperature,
            ..OpenAiConfig::default()
        })
    }

    pub fn elevenlabs_config(&self) -> Result<ElevenLabsConfig, CliError> {
        let api_key = self.tts.api_key.clone().ok_or_else(|| {
            CliError::Config("ELEVENLABS_API_KEY is not set (environment or .env)".into())
        })?;
        let defaults = ElevenLabsConfig::default();
        Ok(ElevenLabsConfig {
            base_url: self
                .tts
                .base_url
                .clone()
                .unwrap_or_else(|| elevenlabs::DEFAULT_BASE_URL.to_string()),
            api_key,
            voice_id: self.tts.voice_id.clone().unwrap_or(defaults.voice_id),
            model_id: self.tts.model_id.clone().unwrap_or(defaults.model_id),
            sample_rate: self.tts.sample_rate.unwrap_or(defaults.sample_rate),
            ..ElevenLabsConfig::default()
        })
    }

    pub fn whisper_config(&self) -> Result<WhisperConfig, CliError> {
        let api_key = self.llm.api_key.clone().ok_or_else(|| {
            CliError::Config("OPENAI_API_KEY is not set (environment or .env)".into())
        })?;
        Ok(WhisperConfig {
            base_url: self
                .llm
                .base_url
                .clone()
                .unwrap_or_else(|| whisper::DEFAULT_BASE_URL.to_string()),
            api_key,
            model: self
                .stt
                .model
                .clone()
                .unwrap_or_else(|| whisper::DEFAULT_MODEL.to_string()),
            language: self.stt.language.clone(),
            ..WhisperConfig::default()
        })
    }
}
