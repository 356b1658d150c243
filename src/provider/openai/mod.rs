//! Adapter for the chat-completions dialect (delta-based function calling).
//!
//! Tool calls stream as indexed fragments inside `delta.tool_calls`; they are
//! buffered per index and emitted once a `finish_reason` closes the turn.

mod request;
mod stream;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::provider::chunk::{Chunk, FinishReason, ToolCallAccumulator};
use crate::provider::error::{ProviderError, format_api_error};
use crate::provider::http::{AuthConfig, DEFAULT_TIMEOUT, HttpClient, SseParser};
use crate::provider::{ChatOptions, ChatProvider, ProviderConfig, send_chunk};
use crate::session::{ContentPart, Message, MessageContent, Role};

use request::{
    AssistantToolCall, ChatCompletionRequest, ChatContent, ChatContentPart, ChatMessage,
    FunctionPayload, FunctionSpec, ImageUrl, ToolSpec,
};
use stream::ChatCompletionChunk;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    http: HttpClient,
    model: String,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey { vendor: "openai" });
        }
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let http = HttpClient::new(base_url, AuthConfig::Bearer(config.api_key.clone()))?;
        Ok(Self {
            http,
            model: config.model.clone(),
        })
    }

    fn build_request(&self, messages: &[Message], options: &ChatOptions) -> ChatCompletionRequest {
        let mut wire = Vec::with_capacity(messages.len() + 1);

        if let Some(prompt) = &options.system_prompt {
            wire.push(ChatMessage {
                role: "system",
                content: ChatContent::Text(prompt.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for msg in messages {
            match msg.role {
                Role::System => wire.push(ChatMessage {
                    role: "system",
                    content: ChatContent::Text(msg.text()),
                    tool_calls: None,
                    tool_call_id: None,
                }),
                Role::User => wire.push(ChatMessage {
                    role: "user",
                    content: convert_content(&msg.content),
                    tool_calls: None,
                    tool_call_id: None,
                }),
                Role::Assistant => {
                    let tool_calls = if msg.tool_calls.is_empty() {
                        None
                    } else {
                        Some(
                            msg.tool_calls
                                .iter()
                                .map(|call| AssistantToolCall {
                                    id: call.id.clone(),
                                    kind: "function",
                                    function: FunctionPayload {
                                        name: call.name.clone(),
                                        arguments: call.arguments.clone(),
                                    },
                                })
                                .collect(),
                        )
                    };
                    wire.push(ChatMessage {
                        role: "assistant",
                        content: ChatContent::Text(msg.text()),
                        tool_calls,
                        tool_call_id: None,
                    });
                }
                Role::Tool => {
                    // the store refuses id-less tool messages, so this only
                    // fires on logs written by older code
                    let tool_call_id = msg.tool_call_id.clone().unwrap_or_else(|| {
                        let id = format!("call_{}", Uuid::new_v4());
                        warn!(placeholder = %id, "tool message lacks tool_call_id");
                        id
                    });
                    // this dialect has no error flag on results
                    let content = if msg.is_error_result() {
                        format!("[ERROR] {}", msg.text())
                    } else {
                        msg.text()
                    };
                    wire.push(ChatMessage {
                        role: "tool",
                        content: ChatContent::Text(content),
                        tool_calls: None,
                        tool_call_id: Some(tool_call_id),
                    });
                    // the tool role cannot carry images; forward them as a
                    // follow-up user turn instead of dropping them
                    if msg.content.has_images() {
                        wire.push(ChatMessage {
                            role: "user",
                            content: image_parts(&msg.content),
                            tool_calls: None,
                            tool_call_id: None,
                        });
                    }
                }
            }
        }

        let tools = if options.tools.is_empty() {
            None
        } else {
            Some(
                options
                    .tools
                    .iter()
                    .map(|tool| ToolSpec {
                        kind: "function",
                        function: FunctionSpec {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };

        ChatCompletionRequest {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.model.clone()),
            messages: wire,
            max_tokens: options.max_tokens,
            stream: true,
            tools,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn id(&self) -> &'static str {
        "openai"
    }

    fn supports_vision(&self) -> bool {
        !self.model.starts_with("gpt-3.5")
    }

    fn supports_tool_use(&self) -> bool {
        true
    }

    async fn chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        tx: mpsc::Sender<Chunk>,
    ) -> Result<(), ProviderError> {
        let body = self.build_request(messages, options);
        debug!(
            model = %body.model,
            messages = body.messages.len(),
            tools = body.tools.as_ref().map_or(0, Vec::len),
            "chat-completions stream request"
        );

        let stream = match self
            .http
            .post_stream("/chat/completions", &body, options.timeout)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.send(Chunk::Error(describe(&e))).await;
                return Err(e);
            }
        };
        futures::pin_mut!(stream);

        let mut parser = SseParser::new();
        let mut calls = ToolCallAccumulator::new();
        let mut text = String::new();
        let mut finished = false;

        'read: while let Some(piece) = stream.next().await {
            let bytes = match piece {
                Ok(bytes) => bytes,
                Err(e) => {
                    let err = if e.is_timeout() {
                        ProviderError::TimedOut(options.timeout.unwrap_or(DEFAULT_TIMEOUT))
                    } else {
                        ProviderError::Stream(e.to_string())
                    };
                    let _ = tx.send(Chunk::Error(err.to_string())).await;
                    return Err(err);
                }
            };

            for frame in parser.feed(&String::from_utf8_lossy(&bytes)) {
                if frame.data.is_empty() {
                    continue;
                }
                if frame.data == "[DONE]" {
                    break 'read;
                }

                let chunk: ChatCompletionChunk = match serde_json::from_str(&frame.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, data = %frame.data, "skipping undecodable stream frame");
                        continue;
                    }
                };

                // mid-stream failures arrive as a bare error object, which
                // still decodes as a chunk with no choices
                if chunk.choices.is_empty() {
                    if let Some(msg) = api_error_in_frame(&frame.data) {
                        send_chunk(&tx, Chunk::Error(msg.clone())).await?;
                        return Err(ProviderError::Api(msg));
                    }
                    continue;
                }

                for choice in chunk.choices {
                    if let Some(delta) = choice.delta.content
                        && !delta.is_empty()
                    {
                        text.push_str(&delta);
                        send_chunk(
                            &tx,
                            Chunk::Content {
                                delta,
                                text: text.clone(),
                            },
                        )
                        .await?;
                    }

                    if let Some(fragments) = choice.delta.tool_calls {
                        for fragment in fragments {
                            let builder = calls.entry(fragment.index);
                            if let Some(id) = fragment.id {
                                builder.id = Some(id);
                            }
                            if let Some(function) = fragment.function {
                                if let Some(name) = function.name {
                                    builder.name = Some(name);
                                }
                                if let Some(arguments) = function.arguments {
                                    builder.push_arguments(&arguments);
                                }
                            }
                        }
                    }

                    if let Some(reason) = choice.finish_reason {
                        for call in calls.drain() {
                            debug!(id = %call.id, name = %call.name, "tool call complete");
                            send_chunk(&tx, Chunk::ToolUse(call)).await?;
                        }
                        send_chunk(&tx, Chunk::Finish(FinishReason::from_openai(Some(&reason))))
                            .await?;
                        finished = true;
                    }
                }
            }
        }

        // servers that never send a finish frame: close out what we have
        if !finished {
            let leftovers = calls.drain();
            let reason = if leftovers.is_empty() {
                FinishReason::EndTurn
            } else {
                FinishReason::ToolUse
            };
            for call in leftovers {
                send_chunk(&tx, Chunk::ToolUse(call)).await?;
            }
            send_chunk(&tx, Chunk::Finish(reason)).await?;
        }
        Ok(())
    }
}

fn convert_content(content: &MessageContent) -> ChatContent {
    match content {
        MessageContent::Text(text) => ChatContent::Text(text.clone()),
        MessageContent::Parts(parts) => {
            if !content.has_images()
                && let [ContentPart::Text { text }] = parts.as_slice()
            {
                return ChatContent::Text(text.clone());
            }
            ChatContent::Parts(
                parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => ChatContentPart::Text { text: text.clone() },
                        ContentPart::Image { media_type, data } => ChatContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: format!("data:{media_type};base64,{data}"),
                            },
                        },
                    })
                    .collect(),
            )
        }
    }
}

/// Just the image parts of a body, as data-URL content parts.
fn image_parts(content: &MessageContent) -> ChatContent {
    let MessageContent::Parts(parts) = content else {
        return ChatContent::Parts(Vec::new());
    };
    ChatContent::Parts(
        parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Image { media_type, data } => Some(ChatContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{media_type};base64,{data}"),
                    },
                }),
                ContentPart::Text { .. } => None,
            })
            .collect(),
    )
}

fn describe(error: &ProviderError) -> String {
    match error {
        ProviderError::Api(body) => format_api_error(body),
        other => other.to_string(),
    }
}

fn api_error_in_frame(data: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(String::from)
}
