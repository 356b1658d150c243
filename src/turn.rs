//! Turn orchestration: append the user input, stream the model response,
//! execute requested tools, and repeat until the model stops calling tools.
//!
//! Every round commits its messages before the next model request, so the
//! context selector always reads a fully reconciled log. An assistant
//! message carrying tool calls is never left unanswered; even a cancelled
//! or failed execution appends an error-flagged result for each call.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provider::{ChatOptions, ChatProvider, Chunk, FinishReason, ProviderError};
use crate::session::{
    ContentPart, Message, MessageContent, MessageInput, SessionStore, SessionStoreError, ToolCall,
};

/// Messages sent to the model per request when the caller does not say
/// otherwise.
pub const DEFAULT_CONTEXT_MESSAGES: usize = 50;
const DEFAULT_MAX_ROUNDS: usize = 25;
const IMAGE_PLACEHOLDER: &str = "[image omitted: model does not support vision]";

/// Boxed error a tool host may return from [`ToolExecutor::execute`].
pub type ToolError = Box<dyn std::error::Error + Send + Sync>;

/// External tool host: name plus JSON arguments in, result out.
///
/// A returned `Err` does not abort the turn; it becomes an error-flagged
/// tool result the model sees on the next round.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: Value) -> Result<ToolOutput, ToolError>;
}

/// Result of one tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: MessageContent,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<MessageContent>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: MessageContent::Text(message.into()),
            is_error: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Store(#[from] SessionStoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("turn cancelled")]
    Cancelled,

    #[error("round limit reached after {0} model requests")]
    RoundLimit(usize),
}

#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub chat: ChatOptions,
    /// Context window budget, in messages.
    pub context_messages: usize,
    /// Model requests allowed per [`TurnRunner::run`] call.
    pub max_rounds: usize,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            chat: ChatOptions::default(),
            context_messages: DEFAULT_CONTEXT_MESSAGES,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

pub struct TurnRunner {
    store: Arc<SessionStore>,
    provider: Arc<dyn ChatProvider>,
    executor: Arc<dyn ToolExecutor>,
    options: TurnOptions,
}

struct RoundOutcome {
    text: String,
    calls: Vec<ToolCall>,
    finish: FinishReason,
}

impl TurnRunner {
    pub fn new(
        store: Arc<SessionStore>,
        provider: Arc<dyn ChatProvider>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            store,
            provider,
            executor,
            options: TurnOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: TurnOptions) -> Self {
        self.options = options;
        self
    }

    /// Run one full turn against `session_id`, creating the session if
    /// needed. Chunks are mirrored to `tx` as they arrive. Returns the
    /// final assistant message.
    pub async fn run(
        &self,
        session_id: &str,
        user_content: impl Into<MessageContent>,
        tx: mpsc::Sender<Chunk>,
        cancel: CancellationToken,
    ) -> Result<Message, TurnError> {
        self.store.get_or_create(session_id).await;
        self.store
            .append(session_id, MessageInput::user(user_content.into()))
            .await?;

        for round in 0..self.options.max_rounds {
            let outcome = self.stream_round(session_id, &tx, &cancel).await?;

            let assistant = self
                .store
                .append(
                    session_id,
                    MessageInput::assistant(outcome.text.clone())
                        .with_tool_calls(outcome.calls.clone()),
                )
                .await?;

            if outcome.calls.is_empty() {
                return Ok(assistant);
            }
            debug!(
                round,
                calls = outcome.calls.len(),
                finish = %outcome.finish,
                "executing tool round"
            );
            self.run_tools(session_id, &outcome.calls, &cancel).await?;
        }
        Err(TurnError::RoundLimit(self.options.max_rounds))
    }

    /// One model request: read context, stream, fold chunks. Nothing is
    /// committed here, so cancellation mid-stream discards the round.
    async fn stream_round(
        &self,
        session_id: &str,
        tx: &mpsc::Sender<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<RoundOutcome, TurnError> {
        if cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }

        let context = self
            .store
            .read_context(session_id, self.options.context_messages, None)
            .await?;
        let context = if self.provider.supports_vision() {
            context
        } else {
            strip_images(context)
        };

        let mut options = self.options.chat.clone();
        if !self.provider.supports_tool_use() {
            options.tools.clear();
        }

        let (chunk_tx, mut chunk_rx) = mpsc::channel(64);
        let provider = self.provider.clone();
        let handle =
            tokio::spawn(async move { provider.chat(&context, &options, chunk_tx).await });

        let mut outcome = RoundOutcome {
            text: String::new(),
            calls: Vec::new(),
            finish: FinishReason::EndTurn,
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    handle.abort();
                    return Err(TurnError::Cancelled);
                }
                chunk = chunk_rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    match &chunk {
                        Chunk::Content { text, .. } => outcome.text = text.clone(),
                        Chunk::ToolUse(call) => outcome.calls.push(call.clone()),
                        Chunk::Finish(reason) => outcome.finish = *reason,
                        Chunk::Error(message) => {
                            debug!(error = %message, "provider reported stream error");
                        }
                    }
                    let _ = tx.send(chunk).await;
                }
            }
        }

        match handle.await {
            Ok(Ok(())) => Ok(outcome),
            Ok(Err(e)) => Err(TurnError::Provider(e)),
            Err(join_err) => Err(TurnError::Provider(ProviderError::Stream(format!(
                "provider task failed: {join_err}"
            )))),
        }
    }

    /// Execute calls in order, appending one result message per call.
    /// Cancellation still answers every remaining call with an error
    /// result, keeping the log valid for the next request.
    async fn run_tools(
        &self,
        session_id: &str,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Result<(), TurnError> {
        let mut cancelled = false;
        for call in calls {
            let output = if cancelled || cancel.is_cancelled() {
                cancelled = true;
                ToolOutput::error("cancelled")
            } else {
                tokio::select! {
                    () = cancel.cancelled() => {
                        cancelled = true;
                        ToolOutput::error("cancelled")
                    }
                    result = self.executor.execute(&call.name, call.arguments_value()) => {
                        match result {
                            Ok(output) => output,
                            Err(e) => {
                                warn!(tool = %call.name, error = %e, "tool execution failed");
                                ToolOutput::error(e.to_string())
                            }
                        }
                    }
                }
            };

            let mut input = MessageInput::tool(call.id.clone(), output.content);
            if output.is_error {
                input = input.with_metadata(serde_json::json!({"is_error": true}));
            }
            self.store.append(session_id, input).await?;
        }
        if cancelled {
            Err(TurnError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Replace image parts with a placeholder for non-vision models. The log
/// keeps the originals; only the outgoing request is altered.
fn strip_images(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .map(|mut msg| {
            if !msg.content.has_images() {
                return msg;
            }
            if let MessageContent::Parts(parts) = &msg.content {
                let parts = parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Image { .. } => ContentPart::Text {
                            text: IMAGE_PLACEHOLDER.to_string(),
                        },
                        other => other.clone(),
                    })
                    .collect();
                msg.content = MessageContent::Parts(parts);
            }
            msg
        })
        .collect()
}
