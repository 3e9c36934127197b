use crate::wire::{
    ChatChunk, ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, ImageRequest,
    ImageResponse,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicBackend;
pub use openai::OpenAiBackend;

/// Upstream failure. The executor treats it as opaque apart from the status
/// used for wire mapping.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    /// Recognizable marker for capabilities a backend does not implement.
    pub fn unsupported(operation: &str) -> Self {
        Self { status: Some(400), message: format!("operation_unsupported: {operation}") }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

pub type ChunkStream = BoxStream<'static, ProviderResult<ChatChunk>>;

#[async_trait]
pub trait Chat: Send + Sync {
    async fn chat(&self, model: &str, req: &ChatRequest) -> ProviderResult<ChatResponse>;
}

#[async_trait]
pub trait ChatStream: Send + Sync {
    /// Lazy finite chunk sequence; dropping the stream cancels the upstream
    /// request.
    async fn stream(&self, model: &str, req: &ChatRequest) -> ProviderResult<ChunkStream>;
}

#[async_trait]
pub trait Embed: Send + Sync {
    async fn embed(&self, model: &str, req: &EmbeddingsRequest) -> ProviderResult<EmbeddingsResponse>;
}

#[async_trait]
pub trait Image: Send + Sync {
    async fn generate(&self, model: &str, req: &ImageRequest) -> ProviderResult<ImageResponse>;

    async fn edit(&self, _model: &str, _req: &ImageRequest) -> ProviderResult<ImageResponse> {
        Err(ProviderError::unsupported("image edit"))
    }

    async fn variation(&self, _model: &str, _req: &ImageRequest) -> ProviderResult<ImageResponse> {
        Err(ProviderError::unsupported("image variation"))
    }
}

#[async_trait]
pub trait AudioTranscribe: Send + Sync {
    async fn transcribe(
        &self,
        model: &str,
        filename: &str,
        content: bytes::Bytes,
    ) -> ProviderResult<serde_json::Value>;
}

#[async_trait]
pub trait AudioSpeech: Send + Sync {
    async fn speech(&self, model: &str, req: &serde_json::Value) -> ProviderResult<bytes::Bytes>;
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health(&self) -> ProviderResult<()>;
}

/// Capability pointers carried by a route. A backend implements whatever
/// subset its upstream supports.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub chat: Option<Arc<dyn Chat>>,
    pub chat_stream: Option<Arc<dyn ChatStream>>,
    pub embed: Option<Arc<dyn Embed>>,
    pub image: Option<Arc<dyn Image>>,
    pub audio_transcribe: Option<Arc<dyn AudioTranscribe>>,
    pub audio_speech: Option<Arc<dyn AudioSpeech>>,
    pub health: Option<Arc<dyn HealthCheck>>,
}

/// Source of capability pointers for a provider name. The production
/// implementation is `ProviderRegistry`; tests swap in scripted backends.
pub trait CapabilitySource: Send + Sync {
    fn capabilities(&self, provider: &str) -> Option<Capabilities>;
}

/// Configured backends, one client per upstream account. Routes borrow
/// capability pointers from here when the catalog is (re)built.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    pub openai: Option<Arc<OpenAiBackend>>,
    pub anthropic: Option<Arc<AnthropicBackend>>,
}

impl CapabilitySource for ProviderRegistry {
    fn capabilities(&self, provider: &str) -> Option<Capabilities> {
        match provider {
            "openai" | "azure" | "openai_compatible" => self.openai.as_ref().map(|backend| Capabilities {
                chat: Some(backend.clone()),
                chat_stream: Some(backend.clone()),
                embed: Some(backend.clone()),
                image: Some(backend.clone()),
                audio_transcribe: Some(backend.clone()),
                audio_speech: Some(backend.clone()),
                health: Some(backend.clone()),
            }),
            "anthropic" => self.anthropic.as_ref().map(|backend| Capabilities {
                chat: Some(backend.clone()),
                chat_stream: Some(backend.clone()),
                embed: None,
                image: None,
                audio_transcribe: None,
                audio_speech: None,
                health: Some(backend.clone()),
            }),
            _ => None,
        }
    }
}
