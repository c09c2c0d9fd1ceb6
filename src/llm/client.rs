//! `LanguageModel` seam and its real, `async-openai`-backed implementation.
//! A trait rather than a single concrete client, so the
//! Planner/Observer/Resolver/Formatter can all share it and tests can swap
//! in a deterministic stub instead of hitting a real endpoint.

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

/// A chunked completion in progress: each item is one incremental piece of
/// text as the model generates it, or an error if the transport broke
/// mid-stream.
pub type ChunkStream = BoxStream<'static, anyhow::Result<String>>;

/// Request/response and streaming chat completion over an optional system
/// prompt plus a single user message. Every caller in this crate only needs
/// single-turn completions, never multi-turn history, so the trait stays
/// minimal.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, system: Option<&str>, user: &str) -> anyhow::Result<String>;

    /// Stream a completion as the model produces it. The default
    /// implementation — used by transports with no real streaming support —
    /// just yields the whole completion as a single chunk.
    async fn stream(&self, system: Option<&str>, user: &str) -> anyhow::Result<ChunkStream> {
        let text = self.complete(system, user).await?;
        Ok(stream::iter(vec![Ok(text)]).boxed())
    }
}

/// Talks to any OpenAI-compatible chat completions endpoint (llama.cpp,
/// Ollama's `/v1` shim, OpenAI itself).
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiClient {
    pub fn new(endpoint: &str, model: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_base(endpoint).with_api_key("not-needed");
        Self {
            client: Client::with_config(config),
            model: model.into(),
        }
    }

    pub fn with_api_key(endpoint: &str, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_base(endpoint).with_api_key(api_key);
        Self {
            client: Client::with_config(config),
            model: model.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, system: Option<&str>, user: &str) -> anyhow::Result<String> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();
        if let Some(system) = system {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default().content(system).build()?,
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default().content(user).build()?,
        ));

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()?;

        let response = self.client.chat().create(request).await?;

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }

    async fn stream(&self, system: Option<&str>, user: &str) -> anyhow::Result<ChunkStream> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::new();
        if let Some(system) = system {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default().content(system).build()?,
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default().content(user).build()?,
        ));

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()?;

        let raw_stream = self.client.chat().create_stream(request).await?;
        let chunks = raw_stream.map(|item| {
            let response = item?;
            Ok(response
                .choices
                .first()
                .and_then(|c| c.delta.content.clone())
                .unwrap_or_default())
        });
        Ok(chunks.boxed())
    }
}

/// Deterministic [`LanguageModel`] stub for unit and integration tests —
/// always compiled (not gated on `cfg(test)`) so `tests/` binaries can use
/// it too.
pub mod stub {
    use super::*;
    use std::sync::Mutex;

    /// Deterministic stub: returns queued responses in order, or a fixed
    /// fallback once the queue is drained. Records every prompt it saw so
    /// tests can assert on what was asked.
    pub struct StubLanguageModel {
        responses: Mutex<Vec<String>>,
        fallback: String,
        pub seen: Mutex<Vec<String>>,
    }

    impl StubLanguageModel {
        pub fn new(responses: Vec<String>) -> Self {
            Self {
                responses: Mutex::new(responses),
                fallback: String::new(),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn with_fallback(fallback: impl Into<String>) -> Self {
            Self {
                responses: Mutex::new(Vec::new()),
                fallback: fallback.into(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for StubLanguageModel {
        async fn complete(&self, _system: Option<&str>, user: &str) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push(user.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(self.fallback.clone())
            } else {
                Ok(responses.remove(0))
            }
        }

        /// Splits the queued response into word-chunks instead of returning
        /// it whole, so tests exercise multi-chunk accumulation the same way
        /// a real streaming transport would, without needing a live endpoint.
        async fn stream(&self, system: Option<&str>, user: &str) -> anyhow::Result<ChunkStream> {
            let text = self.complete(system, user).await?;
            let chunks: Vec<anyhow::Result<String>> = text
                .split_inclusive(' ')
                .map(|word| Ok(word.to_string()))
                .collect();
            let chunks = if chunks.is_empty() { vec![Ok(String::new())] } else { chunks };
            Ok(stream::iter(chunks).boxed())
        }
    }
}
