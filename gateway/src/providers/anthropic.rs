use super::{Chat, ChatStream, ChunkStream, HealthCheck, ProviderError, ProviderResult};
use crate::wire::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, ChatChoice, ChunkChoice, ChunkDelta, Usage,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Anthropic Messages API backend. Translates between the OpenAI wire shape
/// the gateway speaks and Anthropic's native request/response format.
pub struct AnthropicBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicBackend {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// System messages move to the top-level `system` field; the rest keep
    /// their role order.
    fn upstream_body(&self, model: &str, req: &ChatRequest, stream: bool) -> Value {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for msg in &req.messages {
            if msg.role == "system" {
                system_parts.push(msg.text());
            } else {
                messages.push(json!({ "role": msg.role, "content": msg.text() }));
            }
        }
        let mut body = json!({
            "model": model,
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n"));
        }
        if let Some(temperature) = req.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = req.top_p {
            body["top_p"] = json!(top_p);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn post_messages(&self, body: &Value) -> ProviderResult<reqwest::Response> {
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|err| ProviderError::new(None, format!("upstream request failed: {err}")))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                Some(status.as_u16()),
                format!("upstream returned {status}: {detail}"),
            ));
        }
        Ok(resp)
    }
}

fn map_stop_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| match r {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    })
}

fn map_response(model_alias: &str, value: Value) -> ChatResponse {
    let text = value["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let input_tokens = value["usage"]["input_tokens"].as_i64().unwrap_or(0);
    let output_tokens = value["usage"]["output_tokens"].as_i64().unwrap_or(0);
    ChatResponse {
        id: value["id"].as_str().unwrap_or("msg").to_string(),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: model_alias.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: json!(text),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            },
            finish_reason: map_stop_reason(value["stop_reason"].as_str()),
            extra: Map::new(),
        }],
        usage: Usage {
            prompt_tokens: input_tokens,
            completion_tokens: output_tokens,
            total_tokens: input_tokens + output_tokens,
        },
        extra: Map::new(),
    }
}

#[async_trait]
impl Chat for AnthropicBackend {
    async fn chat(&self, model: &str, req: &ChatRequest) -> ProviderResult<ChatResponse> {
        let body = self.upstream_body(model, req, false);
        let resp = self.post_messages(&body).await?;
        let value = resp
            .json::<Value>()
            .await
            .map_err(|err| ProviderError::new(None, format!("invalid upstream response: {err}")))?;
        Ok(map_response(model, value))
    }
}

#[async_trait]
impl ChatStream for AnthropicBackend {
    async fn stream(&self, model: &str, req: &ChatRequest) -> ProviderResult<ChunkStream> {
        let body = self.upstream_body(model, req, true);
        let resp = self.post_messages(&body).await?;
        let model = model.to_string();

        let (tx, rx) = mpsc::channel::<ProviderResult<ChatChunk>>(16);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            let mut id = String::from("msg");
            let mut input_tokens = 0i64;
            let mut output_tokens = 0i64;
            let mut stop_reason: Option<String> = None;
            let created = Utc::now().timestamp();

            let chunk = |id: &str, delta: ChunkDelta, finish: Option<String>, usage: Option<Usage>| ChatChunk {
                id: id.to_string(),
                object: "chat.completion.chunk".to_string(),
                created,
                model: model.clone(),
                choices: vec![ChunkChoice { index: 0, delta, finish_reason: finish }],
                usage,
                extra: Map::new(),
            };

            'outer: while let Some(next) = bytes.next().await {
                let piece = match next {
                    Ok(piece) => piece,
                    Err(err) => {
                        let _ = tx
                            .send(Err(ProviderError::new(None, format!("stream read failed: {err}"))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&piece));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let Ok(event) = serde_json::from_str::<Value>(data.trim()) else {
                        continue;
                    };
                    match event["type"].as_str() {
                        Some("message_start") => {
                            if let Some(msg_id) = event["message"]["id"].as_str() {
                                id = msg_id.to_string();
                            }
                            input_tokens = event["message"]["usage"]["input_tokens"]
                                .as_i64()
                                .unwrap_or(0);
                            let first = chunk(
                                &id,
                                ChunkDelta {
                                    role: Some("assistant".to_string()),
                                    content: None,
                                    extra: Map::new(),
                                },
                                None,
                                None,
                            );
                            if tx.send(Ok(first)).await.is_err() {
                                break 'outer;
                            }
                        }
                        Some("content_block_delta") => {
                            if let Some(text) = event["delta"]["text"].as_str() {
                                let delta = chunk(
                                    &id,
                                    ChunkDelta {
                                        role: None,
                                        content: Some(text.to_string()),
                                        extra: Map::new(),
                                    },
                                    None,
                                    None,
                                );
                                if tx.send(Ok(delta)).await.is_err() {
                                    debug!("Stream consumer went away, cancelling upstream");
                                    break 'outer;
                                }
                            }
                        }
                        Some("message_delta") => {
                            if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                                stop_reason = Some(reason.to_string());
                            }
                            output_tokens = event["usage"]["output_tokens"]
                                .as_i64()
                                .unwrap_or(output_tokens);
                        }
                        Some("message_stop") => {
                            let last = chunk(
                                &id,
                                ChunkDelta::default(),
                                map_stop_reason(stop_reason.as_deref()).or(Some("stop".to_string())),
                                Some(Usage {
                                    prompt_tokens: input_tokens,
                                    completion_tokens: output_tokens,
                                    total_tokens: input_tokens + output_tokens,
                                }),
                            );
                            let _ = tx.send(Ok(last)).await;
                            break 'outer;
                        }
                        _ => {}
                    }
                }
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl HealthCheck for AnthropicBackend {
    async fn health(&self) -> ProviderResult<()> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
