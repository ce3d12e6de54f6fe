// Gemini image backend over the streamGenerateContent SSE endpoint

use super::backend::{ChunkStream, GenerationChunk, GenerationRequest, ImageBackend};
use crate::settings::ImageSettings;
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Streams images from the Gemini API
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, api_base: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("renpy-forge/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            api_base: api_base.into(),
        })
    }

    /// Build a backend from settings; `None` when no API key is configured
    pub fn from_settings(settings: &ImageSettings) -> Result<Option<Self>> {
        match settings.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(Some(Self::new(
                key,
                settings.model.clone(),
                settings.api_base.clone(),
            )?)),
            _ => Ok(None),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.api_base.trim_end_matches('/'),
            self.model
        )
    }

    fn request_body(request: &GenerationRequest) -> serde_json::Value {
        serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": request.prompt }]
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE", "TEXT"],
                "imageConfig": { "aspectRatio": request.aspect_ratio }
            }
        })
    }
}

#[async_trait::async_trait]
impl ImageBackend for GeminiBackend {
    async fn generate(&self, request: GenerationRequest) -> Result<ChunkStream> {
        tracing::debug!("Requesting image from {} ({})", self.model, request.aspect_ratio);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::request_body(&request))
            .send()
            .await
            .context("Gemini request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("HTTP {}: {}", status.as_u16(), body);
        }

        let state = SseState {
            body: response.bytes_stream().boxed(),
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        };

        Ok(futures_util::stream::unfold(state, next_chunk).boxed())
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<GenerationChunk>,
    done: bool,
}

async fn next_chunk(mut state: SseState) -> Option<(Result<GenerationChunk>, SseState)> {
    loop {
        if let Some(chunk) = state.pending.pop_front() {
            return Some((Ok(chunk), state));
        }
        if state.done {
            return None;
        }

        let events = match state.body.next().await {
            Some(Ok(bytes)) => state.decoder.push(&bytes),
            Some(Err(e)) => {
                state.done = true;
                return Some((Err(anyhow!(e).context("Gemini stream interrupted")), state));
            }
            None => {
                state.done = true;
                state.decoder.finish()
            }
        };

        for event in events {
            match parse_event(&event) {
                Ok(chunks) => state.pending.extend(chunks),
                Err(e) => {
                    state.done = true;
                    state.pending.clear();
                    return Some((Err(e), state));
                }
            }
        }
    }
}

/// Incremental server-sent-events decoder yielding the data of complete events
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no newline
    scanned: usize,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let line = String::from_utf8_lossy(&self.buffer[consumed..end]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.trim_start().to_string());
            }

            consumed = end + 1;
            self.scanned = consumed;
        }

        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();
        events
    }

    /// Flush a trailing event that was not terminated by a blank line
    pub fn finish(&mut self) -> Vec<String> {
        let mut events = self.push(b"\n");
        if !self.data.is_empty() {
            events.push(self.data.join("\n"));
            self.data.clear();
        }
        events
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Turn one SSE payload into generation chunks
fn parse_event(payload: &str) -> Result<Vec<GenerationChunk>> {
    let response: StreamResponse =
        serde_json::from_str(payload).context("Gemini returned malformed JSON")?;
    if let Some(error) = response.error {
        bail!("Gemini error: {}", error.message);
    }

    let mut chunks = Vec::new();
    let parts = response
        .candidates
        .into_iter()
        .take(1)
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts);

    for part in parts {
        if let Some(inline) = part.inline_data {
            if inline.data.is_empty() {
                continue;
            }
            let data = BASE64_STANDARD
                .decode(inline.data.as_bytes())
                .context("image base64 decode failed")?;
            chunks.push(GenerationChunk::Image {
                mime_type: inline.mime_type,
                data: Bytes::from(data),
            });
        } else if let Some(text) = part.text {
            chunks.push(GenerationChunk::Text(text));
        }
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_decoder_handles_split_events() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        let events = decoder.push(b"1}\r\n\r\ndata: {\"b\":2}\n\n");
        assert_eq!(events, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_sse_decoder_resumes_scan_on_long_lines() {
        let mut decoder = SseDecoder::default();
        let payload = "A".repeat(64 * 1024);
        assert!(decoder.push(b"data: ").is_empty());
        for chunk in payload.as_bytes().chunks(1000) {
            assert!(decoder.push(chunk).is_empty());
            // Partial line bytes are scanned once, not on every push
            assert_eq!(decoder.scanned, decoder.buffer.len());
        }

        let events = decoder.push(b"\n\ndata: next\n");
        assert_eq!(events, vec![payload]);
        assert_eq!(decoder.buffer, b"");
        assert_eq!(decoder.finish(), vec!["next"]);
    }

    #[test]
    fn test_sse_decoder_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"c\":3}").is_empty());
        assert_eq!(decoder.finish(), vec!["{\"c\":3}"]);
    }

    #[test]
    fn test_parse_event_extracts_images_and_text() {
        let payload = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "Here you go" },
                        { "inlineData": { "mimeType": "image/png", "data": BASE64_STANDARD.encode(b"png-bytes") } }
                    ]
                }
            }]
        })
        .to_string();

        let chunks = parse_event(&payload).unwrap();
        assert_eq!(
            chunks,
            vec![
                GenerationChunk::Text("Here you go".to_string()),
                GenerationChunk::Image {
                    mime_type: "image/png".to_string(),
                    data: Bytes::from_static(b"png-bytes"),
                },
            ]
        );
    }

    #[test]
    fn test_parse_event_surfaces_api_errors() {
        let err = parse_event(r#"{"error": {"message": "quota exceeded"}}"#).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn test_from_settings_requires_key() {
        let settings = ImageSettings::default();
        assert!(GeminiBackend::from_settings(&settings).unwrap().is_none());
    }

    #[test]
    fn test_request_body_carries_aspect_ratio() {
        let body = GeminiBackend::request_body(&GenerationRequest {
            prompt: "cafe".to_string(),
            aspect_ratio: "16:9".to_string(),
        });
        assert_eq!(body["generationConfig"]["imageConfig"]["aspectRatio"], "16:9");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "cafe");
    }
}
