//! Batch transcription against an OpenAI-compatible `/audio/transcriptions`
//! endpoint.
//!
//! Samples are uploaded as a 16-bit PCM WAV file in a multipart form; the JSON
//! reply carries the text.

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::multipart;
use serde::Deserialize;

use super::{DEFAULT_READ_TIMEOUT, Transcriber};
use crate::error::{RecognitionError, VoiceError};

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default transcription model.
pub const DEFAULT_MODEL: &str = "whisper-1";

#[derive(Clone)]
pub struct WhisperConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// ISO-639-1 hint such as `"en"`; the service detects the language when unset.
    pub language: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            language: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl fmt::Debug for WhisperConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhisperConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// [`Transcriber`] backed by a hosted Whisper endpoint.
#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    client: reqwest::Client,
    config: WhisperConfig,
}

impl WhisperTranscriber {
    pub fn new(config: WhisperConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| RecognitionError::Fatal(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/audio/transcriptions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn form(&self, wav: Vec<u8>) -> Result<multipart::Form, RecognitionError> {
        let file = multipart::Part::bytes(wav)
            .file_name("speech.wav")
            .mime_str("audio/wav")
            .map_err(|e| RecognitionError::Fatal(e.to_string()))?;
        let mut form = multipart::Form::new()
            .text("model", self.config.model.clone())
            .text("response_format", "json")
            .part("file", file);
        if let Some(language) = &self.config.language {
            form = form.text("language", language.clone());
        }
        Ok(form)
    }
}

#[async_trait::async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String, RecognitionError> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = encode_wav(samples, sample_rate);
        tracing::debug!(bytes = wav.len(), model = %self.config.model, "Requesting transcription");

        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.config.api_key)
            .multipart(self.form(wav)?)
            .send()
            .await
            .map_err(|e| RecognitionError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(status_error(status, detail.trim()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RecognitionError::Transient(e.to_string()))?;
        parse_transcript(&body)
    }
}

/// Credentials and routing problems will not fix themselves; everything else
/// is worth another listening attempt.
fn status_error(status: StatusCode, detail: &str) -> RecognitionError {
    let message = format!("HTTP {status}: {detail}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            RecognitionError::Fatal(message)
        }
        _ => RecognitionError::Transient(message),
    }
}

fn parse_transcript(body: &str) -> Result<String, RecognitionError> {
    let response: TranscriptionResponse = serde_json::from_str(body)
        .map_err(|e| RecognitionError::Transient(format!("malformed transcription reply: {e}")))?;
    Ok(response.text.trim().to_string())
}

/// Encode mono samples as a 16-bit PCM WAV file.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    const HEADER_LEN: usize = 44;
    let data_len = (samples.len() * 2) as u32;

    let mut wav = Vec::with_capacity(HEADER_LEN + samples.len() * 2);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        let pcm = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        wav.extend_from_slice(&pcm.to_le_bytes());
    }
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn wav_header_describes_mono_pcm16() {
        let wav = encode_wav(&[0.0; 160], 16_000);

        assert_eq!(wav.len(), 44 + 320);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32_at(&wav, 4), 36 + 320);
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(u32_at(&wav, 24), 16_000);
        assert_eq!(u32_at(&wav, 28), 32_000);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u32_at(&wav, 40), 320);
    }

    #[test]
    fn wav_samples_are_clamped() {
        let wav = encode_wav(&[2.0, -2.0, 0.5], 16_000);
        let pcm: Vec<i16> = wav[44..]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(pcm, vec![i16::MAX, -i16::MAX, 16_383]);
    }

    #[test]
    fn transcript_is_trimmed() {
        assert_eq!(
            parse_transcript(r#"{"text":"  What is virtue? "}"#).unwrap(),
            "What is virtue?"
        );
        assert!(matches!(
            parse_transcript("<html>"),
            Err(RecognitionError::Transient(_))
        ));
    }

    #[test]
    fn auth_failures_are_fatal() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "bad key"),
            RecognitionError::Fatal(_)
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            RecognitionError::Transient(_)
        ));
    }

    #[test]
    fn url_targets_transcriptions() {
        let transcriber = WhisperTranscriber::new(WhisperConfig {
            base_url: "http://localhost:8080/v1/".into(),
            ..WhisperConfig::default()
        })
        .unwrap();
        assert_eq!(transcriber.url(), "http://localhost:8080/v1/audio/transcriptions");
    }

    #[tokio::test]
    async fn empty_audio_skips_the_request() {
        let transcriber = WhisperTranscriber::new(WhisperConfig {
            base_url: "http://127.0.0.1:9".into(),
            ..WhisperConfig::default()
        })
        .unwrap();
        assert_eq!(transcriber.transcribe(&[], 16_000).await.unwrap(), "");
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = WhisperConfig {
            api_key: "sk-secret".into(),
            ..WhisperConfig::default()
        };
        assert!(!format!("{config:?}").contains("sk-secret"));
    }
}
