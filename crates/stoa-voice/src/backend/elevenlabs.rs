//! Streaming speech synthesis against an ElevenLabs-compatible API.
//!
//! Audio is requested as raw 16-bit PCM so chunks can be scheduled as soon as
//! they arrive, without a container to demux. HTTP chunk boundaries do not
//! respect sample boundaries, so an odd trailing byte is carried into the
//! next chunk.

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::{AudioChunk, ChunkStream, DEFAULT_READ_TIMEOUT, SpeechSynthesizer, stall_guard};
use crate::convert::AudioFormat;
use crate::error::VoiceError;

pub const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io/v1";
pub const DEFAULT_VOICE_ID: &str = "JBFqnCBsd6RMkjVDRZzb";
pub const DEFAULT_MODEL_ID: &str = "eleven_turbo_v2_5";

/// Rates the service can stream as raw PCM.
const PCM_RATES: [u32; 4] = [16_000, 22_050, 24_000, 44_100];

/// Voice shaping parameters sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceTuning {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceTuning {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.6,
            style: 0.1,
            use_speaker_boost: false,
        }
    }
}

#[derive(Clone)]
pub struct ElevenLabsConfig {
    pub base_url: String,
    pub api_key: String,
    pub voice_id: String,
    pub model_id: String,
    pub tuning: VoiceTuning,
    /// PCM output rate; must be one of the service's PCM rates.
    pub sample_rate: u32,
    /// 0 (best quality) to 4 (lowest latency).
    pub optimize_streaming_latency: u8,
    pub connect_timeout: Duration,
    /// Longest silence tolerated while the response body streams.
    pub read_timeout: Duration,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            voice_id: DEFAULT_VOICE_ID.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            tuning: VoiceTuning::default(),
            sample_rate: 22_050,
            optimize_streaming_latency: 4,
            connect_timeout: Duration::from_secs(10),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl fmt::Debug for ElevenLabsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevenLabsConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("voice_id", &self.voice_id)
            .field("model_id", &self.model_id)
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceTuning,
}

/// [`SpeechSynthesizer`] backed by the text-to-speech streaming endpoint.
#[derive(Debug, Clone)]
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    config: ElevenLabsConfig,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: ElevenLabsConfig) -> Result<Self, VoiceError> {
        if !PCM_RATES.contains(&config.sample_rate) {
            return Err(VoiceError::SynthesisTransport(format!(
                "unsupported PCM rate {} Hz (expected one of {PCM_RATES:?})",
                config.sample_rate
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| VoiceError::SynthesisTransport(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Format of every chunk this synthesizer yields.
    pub const fn format(&self) -> AudioFormat {
        AudioFormat::pcm16(self.config.sample_rate, 1)
    }

    fn url(&self) -> String {
        format!(
            "{}/text-to-speech/{}/stream?output_format=pcm_{}&optimize_streaming_latency={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.voice_id,
            self.config.sample_rate,
            self.config.optimize_streaming_latency,
        )
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<ChunkStream, VoiceError> {
        let request = SpeechRequest {
            text,
            model_id: &self.config.model_id,
            voice_settings: self.config.tuning,
        };

        tracing::debug!(
            voice = %self.config.voice_id,
            chars = text.len(),
            "Requesting speech"
        );

        let response = self
            .client
            .post(self.url())
            .header("xi-api-key", &self.config.api_key)
            .header("Accept", "audio/pcm")
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceError::SynthesisTransport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::SynthesisTransport(format!(
                "HTTP {status}: {}",
                detail.trim()
            )));
        }

        let body = stall_guard(response.bytes_stream(), self.config.read_timeout);
        Ok(pcm_chunks(body, self.format()))
    }
}

struct PcmState<S> {
    stream: S,
    carry: BytesMut,
    format: AudioFormat,
    seq: u64,
    done: bool,
}

/// Split a raw PCM16 byte stream into sample-aligned [`AudioChunk`]s.
///
/// A dangling odd byte at the very end of the stream is dropped.
pub fn pcm_chunks<S, E>(byte_stream: S, format: AudioFormat) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = PcmState {
        stream: byte_stream.boxed(),
        carry: BytesMut::new(),
        format,
        seq: 0,
        done: false,
    };
    let width = format.encoding.bytes_per_sample();

    futures_util::stream::unfold(state, move |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            match st.stream.next().await {
                Some(Ok(bytes)) => {
                    st.carry.extend_from_slice(&bytes);
                    let whole = st.carry.len() - st.carry.len() % width;
                    if whole == 0 {
                        continue;
                    }
                    let chunk = AudioChunk {
                        data: st.carry.split_to(whole).freeze(),
                        format: st.format,
                        seq: st.seq,
                    };
                    st.seq += 1;
                    return Some((Ok(chunk), st));
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(VoiceError::SynthesisTransport(e.to_string())), st));
                }
                None => {
                    if !st.carry.is_empty() {
                        tracing::debug!(bytes = st.carry.len(), "Dropping partial trailing sample");
                    }
                    return None;
                }
            }
        }
    })
    .boxed()
}
