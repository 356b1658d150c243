//! Provider abstraction over streaming chat APIs.
//!
//! Each vendor dialect gets its own adapter; callers see one [`ChatProvider`]
//! trait and one [`Chunk`] stream regardless of which wire protocol produced
//! it.

pub mod anthropic;
mod chunk;
mod error;
mod http;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::session::Message;

pub use anthropic::AnthropicProvider;
pub use chunk::{Chunk, FinishReason, ToolCallAccumulator, ToolCallBuilder};
pub use error::{ProviderError, format_api_error};
pub use http::{AuthConfig, DEFAULT_TIMEOUT, HttpClient, SseEvent, SseParser};
pub use openai::OpenAiProvider;

/// Default completion cap when the caller does not set one.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Wire dialect of a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

/// Everything needed to construct a provider adapter.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    pub api_key: String,
    /// Endpoint override, mainly for tests.
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        kind: ProviderKind,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            model: model.into(),
            api_key: api_key.into(),
            base_url: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// A tool the model may call, in provider-neutral form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the call arguments.
    pub parameters: Value,
}

/// Per-request knobs.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Overrides the adapter's configured model when set.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub tools: Vec<ToolDefinition>,
    /// Prepended ahead of any persisted system messages.
    pub system_prompt: Option<String>,
    /// Deadline covering connect through the last stream byte.
    pub timeout: Option<Duration>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            tools: Vec::new(),
            system_prompt: None,
            timeout: None,
        }
    }
}

/// A streaming chat backend.
///
/// `chat` converts the transcript to the vendor's wire shape, issues one
/// streaming request, and forwards normalized [`Chunk`]s over `tx`. Exactly
/// one terminal chunk is sent per call: `Finish` on success, `Error` on
/// failure (paired with the returned error).
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn id(&self) -> &'static str;

    fn supports_vision(&self) -> bool;

    fn supports_tool_use(&self) -> bool;

    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        tx: mpsc::Sender<Chunk>,
    ) -> Result<(), ProviderError>;
}

/// Build the adapter for `config.kind`.
pub fn create_provider(config: &ProviderConfig) -> Result<Box<dyn ChatProvider>, ProviderError> {
    match config.kind {
        ProviderKind::OpenAi => Ok(Box::new(OpenAiProvider::new(config)?)),
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(config)?)),
    }
}

/// Forward a chunk, treating a dropped receiver as cancellation.
pub(crate) async fn send_chunk(
    tx: &mpsc::Sender<Chunk>,
    chunk: Chunk,
) -> Result<(), ProviderError> {
    tx.send(chunk).await.map_err(|_| ProviderError::Cancelled)
}
