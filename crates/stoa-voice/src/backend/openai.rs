//! Streaming text generation against an OpenAI-compatible chat-completions API.
//!
//! The response is Server-Sent Events: `data: {json}` lines carrying
//! `choices[0].delta.content`, terminated by `data: [DONE]`.

use std::fmt;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde_json::json;

use super::{DEFAULT_READ_TIMEOUT, DeltaStream, Exchange, TextGenerator, stall_guard};
use crate::error::VoiceError;

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default chat model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Persona prepended as the system message; omitted when empty.
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub connect_timeout: Duration,
    /// Longest silence tolerated while the response body streams.
    pub read_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: String::new(),
            temperature: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

/// [`TextGenerator`] backed by a chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiGenerator {
    pub fn new(config: OpenAiConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| VoiceError::GenerationTransport(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Chat messages for one request: persona, prior exchanges, new prompt.
    fn messages(&self, prompt: &str, history: &[Exchange]) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        if !self.config.system_prompt.is_empty() {
            messages.push(json!({ "role": "system", "content": self.config.system_prompt }));
        }
        for exchange in history {
            messages.push(json!({ "role": "user", "content": exchange.user }));
            messages.push(json!({ "role": "assistant", "content": exchange.assistant }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));
        messages
    }
}

#[async_trait::async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, prompt: &str, history: &[Exchange]) -> Result<DeltaStream, VoiceError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut body = json!({
            "model": self.config.model,
            "messages": self.messages(prompt, history),
            "stream": true,
        });
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }

        tracing::debug!(model = %self.config.model, history = history.len(), "Requesting completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::GenerationTransport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::GenerationTransport(format!(
                "HTTP {status}: {}",
                detail.trim()
            )));
        }

        let body = stall_guard(response.bytes_stream(), self.config.read_timeout);
        Ok(sse_deltas(body))
    }
}

// ── SSE parsing ────────────────────────────────────────────────────

enum SseLine {
    Delta(String),
    Done,
    Error(String),
    Skip,
}

fn parse_line(line: &str) -> SseLine {
    let line = line.trim();
    // Blank keep-alives and comments
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
        tracing::warn!(data, "Unparseable SSE payload");
        return SseLine::Skip;
    };
    if let Some(error) = value.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown error");
        return SseLine::Error(message.to_string());
    }
    match value["choices"][0]["delta"]["content"].as_str() {
        Some(content) if !content.is_empty() => SseLine::Delta(content.to_string()),
        _ => SseLine::Skip,
    }
}

struct SseState<S> {
    stream: S,
    buf: BytesMut,
    done: bool,
}

/// Turn an SSE byte stream into a stream of non-empty content deltas.
///
/// The stream ends at `[DONE]` or when the upstream closes; an upstream error
/// is yielded once and ends the stream.
pub fn sse_deltas<S, E>(byte_stream: S) -> DeltaStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = SseState {
        stream: byte_stream.boxed(),
        buf: BytesMut::new(),
        done: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }

        loop {
            let line = if let Some(end) = find_newline(&st.buf) {
                st.buf.split_to(end)
            } else if st.done {
                return None;
            } else {
                match st.stream.next().await {
                    Some(Ok(chunk)) => {
                        st.buf.extend_from_slice(&chunk);
                        continue;
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(VoiceError::GenerationTransport(e.to_string())), st));
                    }
                    // Upstream closed: flush a trailing unterminated line
                    None => {
                        st.done = true;
                        if st.buf.is_empty() {
                            return None;
                        }
                        st.buf.split()
                    }
                }
            };

            match parse_line(&String::from_utf8_lossy(&line)) {
                SseLine::Delta(text) => return Some((Ok(text), st)),
                SseLine::Done => return None,
                SseLine::Error(message) => {
                    st.done = true;
                    return Some((Err(VoiceError::GenerationTransport(message)), st));
                }
                SseLine::Skip => {}
            }
        }
    })
    .boxed()
}

/// Position just past the next newline.
fn find_newline(buf: &BytesMut) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n').map(|pos| pos + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn delta(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({ "choices": [{ "delta": { "content": content } }] })
        )
    }

    async fn collect(parts: Vec<Result<&'static [u8], String>>) -> Vec<Result<String, String>> {
        let byte_stream = stream::iter(parts.into_iter().map(|p| p.map(Bytes::from_static)));
        sse_deltas(byte_stream)
            .map(|item| item.map_err(|e| e.to_string()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn yields_content_until_done() {
        let payload = format!("{}{}data: [DONE]\n\n{}", delta("Hel"), delta("lo"), delta("ignored"));
        let payload: &'static [u8] = Box::leak(payload.into_bytes().into_boxed_slice());

        let out = collect(vec![Ok(payload)]).await;
        assert_eq!(out, vec![Ok("Hel".to_string()), Ok("lo".to_string())]);
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_reassembled() {
        let line = delta("Stoic");
        let (a, b) = line.split_at(10);
        let a: &'static [u8] = Box::leak(a.as_bytes().to_vec().into_boxed_slice());
        let b: &'static [u8] = Box::leak(b.as_bytes().to_vec().into_boxed_slice());

        let out = collect(vec![Ok(a), Ok(b)]).await;
        assert_eq!(out, vec![Ok("Stoic".to_string())]);
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_flushed() {
        let line = delta("end");
        let trimmed: &'static [u8] =
            Box::leak(line.trim_end().as_bytes().to_vec().into_boxed_slice());

        let out = collect(vec![Ok(trimmed)]).await;
        assert_eq!(out, vec![Ok("end".to_string())]);
    }

    #[tokio::test]
    async fn skips_comments_and_role_only_deltas() {
        let role = format!(
            ": keep-alive\n\ndata: {}\n\n",
            json!({ "choices": [{ "delta": { "role": "assistant" } }] })
        );
        let role: &'static [u8] = Box::leak(role.into_bytes().into_boxed_slice());

        let out = collect(vec![Ok(role)]).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn upstream_error_ends_stream() {
        let out = collect(vec![Err("connection reset".to_string()), Ok(b"data: x\n" as &[u8])]).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].as_ref().unwrap_err().contains("connection reset"));
    }

    #[tokio::test]
    async fn api_error_payload_is_transport_error() {
        let out = collect(vec![Ok(
            b"data: {\"error\":{\"message\":\"rate limited\"}}\n\n" as &[u8]
        )])
        .await;
        assert_eq!(
            out,
            vec![Err("Text generation failed: rate limited".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_becomes_transport_error() {
        let first: &'static [u8] = Box::leak(delta("Virtue").into_bytes().into_boxed_slice());
        let body = stream::iter([Ok::<_, String>(Bytes::from_static(first))]).chain(stream::pending());
        let out: Vec<_> = sse_deltas(stall_guard(body, DEFAULT_READ_TIMEOUT)).collect().await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().ok().map(String::as_str), Some("Virtue"));
        assert!(matches!(out[1], Err(VoiceError::GenerationTransport(_))));
    }

    #[test]
    fn messages_include_persona_and_history() {
        let generator = OpenAiGenerator::new(OpenAiConfig {
            system_prompt: "Be stoic.".into(),
            ..OpenAiConfig::default()
        })
        .unwrap();
        let history = [Exchange {
            user: "hi".into(),
            assistant: "greetings".into(),
        }];

        let messages = generator.messages("what is virtue?", &history);
        let roles: Vec<&str> = messages.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[3]["content"], "what is virtue?");
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = OpenAiConfig {
            api_key: "sk-secret".into(),
            ..OpenAiConfig::default()
        };
        assert!(!format!("{config:?}").contains("sk-secret"));
    }
}
