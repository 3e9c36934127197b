use super::{
    AudioSpeech, AudioTranscribe, Chat, ChatStream, ChunkStream, Embed, HealthCheck, Image,
    ProviderError, ProviderResult,
};
use crate::wire::{
    ChatChunk, ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, ImageRequest,
    ImageResponse,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// OpenAI-compatible backend. Also serves Azure OpenAI and any other
/// API that speaks the same wire shape behind a different base URL.
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiBackend {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> ProviderResult<T> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|err| ProviderError::new(None, format!("upstream request failed: {err}")))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                Some(status.as_u16()),
                format!("upstream returned {status}: {}", truncate(&detail, 512)),
            ));
        }
        resp.json::<T>()
            .await
            .map_err(|err| ProviderError::new(None, format!("invalid upstream response: {err}")))
    }

    /// Serialize the caller's request, swapping in the provider-side model
    /// name and pinning the stream flag.
    fn upstream_body<R: serde::Serialize>(req: &R, model: &str, stream: Option<bool>) -> ProviderResult<Value> {
        let mut body = serde_json::to_value(req)
            .map_err(|err| ProviderError::new(None, format!("unserializable request: {err}")))?;
        body["model"] = json!(model);
        match stream {
            Some(true) => {
                body["stream"] = json!(true);
                body["stream_options"] = json!({ "include_usage": true });
            }
            Some(false) | None => {
                if let Some(map) = body.as_object_mut() {
                    map.remove("stream");
                    map.remove("stream_options");
                }
            }
        }
        Ok(body)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Parse one SSE `data:` payload into a chunk. `[DONE]` ends the stream.
fn parse_sse_data(data: &str) -> Option<ProviderResult<ChatChunk>> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<ChatChunk>(data) {
        Ok(chunk) => Some(Ok(chunk)),
        Err(err) => Some(Err(ProviderError::new(
            None,
            format!("malformed stream chunk: {err}"),
        ))),
    }
}

#[async_trait]
impl Chat for OpenAiBackend {
    async fn chat(&self, model: &str, req: &ChatRequest) -> ProviderResult<ChatResponse> {
        let body = Self::upstream_body(req, model, Some(false))?;
        self.post_json("/chat/completions", &body).await
    }
}

#[async_trait]
impl ChatStream for OpenAiBackend {
    async fn stream(&self, model: &str, req: &ChatRequest) -> ProviderResult<ChunkStream> {
        let body = Self::upstream_body(req, model, Some(true))?;
        let resp = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::new(None, format!("upstream request failed: {err}")))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                Some(status.as_u16()),
                format!("upstream returned {status}: {}", truncate(&detail, 512)),
            ));
        }

        let (tx, rx) = mpsc::channel::<ProviderResult<ChatChunk>>(16);
        // Receiver drop cancels the forwarder, which drops the byte stream
        // and closes the upstream connection.
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            'outer: while let Some(next) = bytes.next().await {
                let piece = match next {
                    Ok(piece) => piece,
                    Err(err) => {
                        let _ = tx
                            .send(Err(ProviderError::new(None, format!("stream read failed: {err}"))))
                            .await;
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&piece));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    if data.trim() == "[DONE]" {
                        break 'outer;
                    }
                    if let Some(item) = parse_sse_data(data) {
                        if tx.send(item).await.is_err() {
                            debug!("Stream consumer went away, cancelling upstream");
                            break 'outer;
                        }
                    }
                }
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl Embed for OpenAiBackend {
    async fn embed(&self, model: &str, req: &EmbeddingsRequest) -> ProviderResult<EmbeddingsResponse> {
        let body = Self::upstream_body(req, model, None)?;
        self.post_json("/embeddings", &body).await
    }
}

#[async_trait]
impl Image for OpenAiBackend {
    async fn generate(&self, model: &str, req: &ImageRequest) -> ProviderResult<ImageResponse> {
        let body = Self::upstream_body(req, model, None)?;
        self.post_json("/images/generations", &body).await
    }
}

#[async_trait]
impl AudioTranscribe for OpenAiBackend {
    async fn transcribe(
        &self,
        model: &str,
        filename: &str,
        content: Bytes,
    ) -> ProviderResult<Value> {
        let part = reqwest::multipart::Part::bytes(content.to_vec()).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .text("model", model.to_string())
            .part("file", part);
        let resp = self
            .client
            .post(self.url("/audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|err| ProviderError::new(None, format!("upstream request failed: {err}")))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                Some(status.as_u16()),
                format!("upstream returned {status}: {}", truncate(&detail, 512)),
            ));
        }
        resp.json::<Value>()
            .await
            .map_err(|err| ProviderError::new(None, format!("invalid upstream response: {err}")))
    }
}

#[async_trait]
impl AudioSpeech for OpenAiBackend {
    async fn speech(&self, model: &str, req: &Value) -> ProviderResult<Bytes> {
        let mut body = req.clone();
        body["model"] = json!(model);
        let resp = self
            .client
            .post(self.url("/audio/speech"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::new(None, format!("upstream request failed: {err}")))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                Some(status.as_u16()),
                format!("upstream returned {status}: {}", truncate(&detail, 512)),
            ));
        }
        resp.bytes()
            .await
            .map_err(|err| ProviderError::new(None, format!("stream read failed: {err}")))
    }
}

#[async_trait]
impl HealthCheck for OpenAiBackend {
    async fn health(&self) -> ProviderResult<()> {
        let resp = self
            .client
            .get(self.url("/models"))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| ProviderError::new(None, format!("health check failed: {err}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::new(
                Some(resp.status().as_u16()),
                "health check returned failure status",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_data_parses_chunks_and_skips_done() {
        let chunk = parse_sse_data(
            r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"content":"hi"}}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
        assert!(parse_sse_data("[DONE]").is_none());
        assert!(parse_sse_data("").is_none());
        assert!(parse_sse_data("not json").unwrap().is_err());
    }

    #[test]
    fn upstream_body_swaps_model_and_strips_stream() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"model":"alias","messages":[{"role":"user","content":"x"}],"stream":true}"#,
        )
        .unwrap();
        let body = OpenAiBackend::upstream_body(&req, "gpt-4o-mini", Some(false)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert!(body.get("stream").is_none());
        let body = OpenAiBackend::upstream_body(&req, "gpt-4o-mini", Some(true)).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }
}
