//! Adapter for the messages dialect (content-block event protocol).
//!
//! Tool-call input arrives as `input_json_delta` fragments between
//! `content_block_start` and `content_block_stop`; the call is emitted when
//! its block closes.

mod request;
mod stream;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::provider::chunk::{Chunk, FinishReason, ToolCallAccumulator, ToolCallBuilder};
use crate::provider::error::{ProviderError, format_api_error};
use crate::provider::http::{AuthConfig, DEFAULT_TIMEOUT, HttpClient, SseParser};
use crate::provider::{ChatOptions, ChatProvider, ProviderConfig, send_chunk};
use crate::session::{ContentPart, Message, MessageContent, Role};

use request::{ContentBlock, ImageSource, MessageParam, MessagesRequest, ResultContent, ToolParam};
use stream::{BlockDelta, BlockStart, StreamEvent};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    http: HttpClient,
    model: String,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey { vendor: "anthropic" });
        }
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let http = HttpClient::new(
            base_url,
            AuthConfig::ApiKey {
                header: "x-api-key",
                key: config.api_key.clone(),
            },
        )?
        .with_header(
            reqwest::header::HeaderName::from_static("anthropic-version"),
            reqwest::header::HeaderValue::from_static(API_VERSION),
        );
        Ok(Self {
            http,
            model: config.model.clone(),
        })
    }

    fn build_request(&self, messages: &[Message], options: &ChatOptions) -> MessagesRequest {
        let mut system_parts = Vec::new();
        if let Some(prompt) = &options.system_prompt {
            system_parts.push(prompt.clone());
        }

        let mut wire: Vec<MessageParam> = Vec::with_capacity(messages.len());
        for msg in messages {
            match msg.role {
                // system text rides the dedicated request field
                Role::System => {
                    let text = msg.text();
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                Role::User => {
                    let content = convert_user_content(&msg.content);
                    if !content.is_empty() {
                        wire.push(MessageParam {
                            role: "user",
                            content,
                        });
                    }
                }
                Role::Assistant => {
                    let mut content = Vec::new();
                    let text = msg.text();
                    if !text.is_empty() {
                        content.push(ContentBlock::Text { text });
                    }
                    for call in &msg.tool_calls {
                        content.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.arguments_value(),
                        });
                    }
                    if !content.is_empty() {
                        wire.push(MessageParam {
                            role: "assistant",
                            content,
                        });
                    }
                }
                Role::Tool => {
                    let tool_use_id = msg.tool_call_id.clone().unwrap_or_else(|| {
                        let id = format!("toolu_{}", Uuid::new_v4());
                        warn!(placeholder = %id, "tool message lacks tool_call_id");
                        id
                    });
                    wire.push(MessageParam {
                        role: "user",
                        content: vec![ContentBlock::ToolResult {
                            tool_use_id,
                            content: convert_result_content(&msg.content),
                            is_error: msg.is_error_result(),
                        }],
                    });
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
                    .map(|tool| ToolParam {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        input_schema: tool.parameters.clone(),
                    })
                    .collect(),
            )
        };

        MessagesRequest {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.model.clone()),
            max_tokens: options.max_tokens,
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n\n"))
            },
            messages: wire,
            tools,
            stream: true,
        }
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn id(&self) -> &'static str {
        "anthropic"
    }

    fn supports_vision(&self) -> bool {
        true
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
            "messages stream request"
        );

        let stream = match self.http.post_stream("/messages", &body, options.timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                let msg = match &e {
                    ProviderError::Api(body) => format_api_error(body),
                    other => other.to_string(),
                };
                let _ = tx.send(Chunk::Error(msg)).await;
                return Err(e);
            }
        };
        futures::pin_mut!(stream);

        let mut parser = SseParser::new();
        let mut calls = ToolCallAccumulator::new();
        let mut text = String::new();
        let mut pending_finish = None;
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
                let event: StreamEvent = match serde_json::from_str(&frame.data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, data = %frame.data, "skipping undecodable stream event");
                        continue;
                    }
                };

                match event {
                    StreamEvent::MessageStart {} | StreamEvent::Ping {} => {}
                    StreamEvent::ContentBlockStart {
                        index,
                        content_block,
                    } => {
                        if let BlockStart::ToolUse { id, name } = content_block {
                            calls.insert(index, ToolCallBuilder::new(Some(id), Some(name)));
                        }
                    }
                    StreamEvent::ContentBlockDelta { index, delta } => match delta {
                        BlockDelta::TextDelta { text: delta } => {
                            if !delta.is_empty() {
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
                        }
                        BlockDelta::InputJsonDelta { partial_json } => {
                            calls.entry(index).push_arguments(&partial_json);
                        }
                    },
                    StreamEvent::ContentBlockStop { index } => {
                        if let Some(builder) = calls.remove(index)
                            && let Some(call) = builder.finish()
                        {
                            debug!(id = %call.id, name = %call.name, "tool call complete");
                            send_chunk(&tx, Chunk::ToolUse(call)).await?;
                        }
                    }
                    StreamEvent::MessageDelta { delta } => {
                        if let Some(reason) = delta.stop_reason {
                            pending_finish = Some(FinishReason::from_anthropic(&reason));
                        }
                    }
                    StreamEvent::MessageStop {} => {
                        send_chunk(
                            &tx,
                            Chunk::Finish(pending_finish.unwrap_or(FinishReason::EndTurn)),
                        )
                        .await?;
                        finished = true;
                        break 'read;
                    }
                    StreamEvent::Error { error } => {
                        let msg = format!("{}: {}", error.kind, error.message);
                        send_chunk(&tx, Chunk::Error(msg.clone())).await?;
                        return Err(ProviderError::Api(msg));
                    }
                }
            }
        }

        // stream ended without message_stop: close out what we have
        if !finished {
            let leftovers = calls.drain();
            let reason = pending_finish.unwrap_or(if leftovers.is_empty() {
                FinishReason::EndTurn
            } else {
                FinishReason::ToolUse
            });
            for call in leftovers {
                send_chunk(&tx, Chunk::ToolUse(call)).await?;
            }
            send_chunk(&tx, Chunk::Finish(reason)).await?;
        }
        Ok(())
    }
}

fn convert_user_content(content: &MessageContent) -> Vec<ContentBlock> {
    match content {
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![ContentBlock::Text { text: text.clone() }]
            }
        }
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => ContentBlock::Text { text: text.clone() },
                ContentPart::Image { media_type, data } => ContentBlock::Image {
                    source: ImageSource::base64(media_type.clone(), data.clone()),
                },
            })
            .collect(),
    }
}

fn convert_result_content(content: &MessageContent) -> Vec<ResultContent> {
    match content {
        MessageContent::Text(text) => vec![ResultContent::Text { text: text.clone() }],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => ResultContent::Text { text: text.clone() },
                ContentPart::Image { media_type, data } => ResultContent::Image {
                    source: ImageSource::base64(media_type.clone(), data.clone()),
                },
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderKind, ToolDefinition};
    use crate::session::ToolCall;
    use chrono::Utc;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(&ProviderConfig {
            kind: ProviderKind::Anthropic,
            model: "claude-sonnet-4-20250514".to_string(),
            api_key: "test-key".to_string(),
            base_url: None,
        })
        .unwrap()
    }

    fn message(role: Role, content: MessageContent) -> Message {
        Message {
            id: "m1".to_string(),
            role,
            content,
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            metadata: None,
        }
    }

    #[test]
    fn system_messages_fold_into_system_field() {
        let messages = vec![
            message(Role::System, "You are helpful".into()),
            message(Role::User, "Hi".into()),
        ];
        let options = ChatOptions {
            system_prompt: Some("Be terse".to_string()),
            ..ChatOptions::default()
        };
        let body = provider().build_request(&messages, &options);
        assert_eq!(body.system.as_deref(), Some("Be terse\n\nYou are helpful"));
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.messages[0].role, "user");
    }

    #[test]
    fn assistant_calls_become_tool_use_blocks() {
        let mut assistant = message(Role::Assistant, "Let me check".into());
        assistant.tool_calls = vec![ToolCall::new("toolu_1", "bash", r#"{"command":"ls"}"#)];
        let body = provider().build_request(&[assistant], &ChatOptions::default());
        let json = serde_json::to_value(&body.messages[0]).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "tool_use");
        assert_eq!(json["content"][1]["input"]["command"], "ls");
    }

    #[test]
    fn malformed_call_arguments_degrade_to_empty_input() {
        let mut assistant = message(Role::Assistant, "".into());
        assistant.tool_calls = vec![ToolCall::new("toolu_1", "bash", "{\"cmd\": tru")];
        let body = provider().build_request(&[assistant], &ChatOptions::default());
        let json = serde_json::to_value(&body.messages[0]).unwrap();
        assert_eq!(json["content"][0]["input"], serde_json::json!({}));
    }

    #[test]
    fn tool_message_becomes_user_tool_result() {
        let mut tool = message(Role::Tool, "file1.txt".into());
        tool.tool_call_id = Some("toolu_1".to_string());
        let body = provider().build_request(&[tool], &ChatOptions::default());
        let json = serde_json::to_value(&body.messages[0]).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "tool_result");
        assert_eq!(json["content"][0]["tool_use_id"], "toolu_1");
        assert!(json["content"][0].get("is_error").is_none());
    }

    #[test]
    fn failed_tool_message_sets_error_flag() {
        let mut tool = message(Role::Tool, "command not found".into());
        tool.tool_call_id = Some("toolu_1".to_string());
        tool.metadata = Some(serde_json::json!({"is_error": true}));
        let body = provider().build_request(&[tool], &ChatOptions::default());
        let json = serde_json::to_value(&body.messages[0]).unwrap();
        assert_eq!(json["content"][0]["is_error"], true);
    }

    #[test]
    fn multimodal_tool_result_inlines_image() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "screenshot taken".to_string(),
            },
            ContentPart::Image {
                media_type: "image/png".to_string(),
                data: "aGk=".to_string(),
            },
        ]);
        let mut tool = message(Role::Tool, content);
        tool.tool_call_id = Some("toolu_1".to_string());
        let body = provider().build_request(&[tool], &ChatOptions::default());
        let json = serde_json::to_value(&body.messages[0]).unwrap();
        assert_eq!(json["content"][0]["content"][1]["type"], "image");
        assert_eq!(
            json["content"][0]["content"][1]["source"]["media_type"],
            "image/png"
        );
    }

    #[test]
    fn empty_assistant_message_skipped() {
        let messages = vec![
            message(Role::User, "Hi".into()),
            message(Role::Assistant, "".into()),
        ];
        let body = provider().build_request(&messages, &ChatOptions::default());
        assert_eq!(body.messages.len(), 1);
    }

    #[test]
    fn tools_use_input_schema() {
        let options = ChatOptions {
            tools: vec![ToolDefinition {
                name: "read_file".to_string(),
                description: "Read a file".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }],
            ..ChatOptions::default()
        };
        let messages = vec![message(Role::User, "go".into())];
        let body = provider().build_request(&messages, &options);
        let json = serde_json::to_value(body.tools.unwrap()).unwrap();
        assert_eq!(json[0]["input_schema"]["type"], "object");
    }

    #[test]
    fn user_images_become_base64_sources() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "what is this".to_string(),
            },
            ContentPart::Image {
                media_type: "image/jpeg".to_string(),
                data: "abc".to_string(),
            },
        ]);
        let messages = vec![message(Role::User, content)];
        let body = provider().build_request(&messages, &ChatOptions::default());
        let json = serde_json::to_value(&body.messages[0]).unwrap();
        assert_eq!(json["content"][1]["source"]["type"], "base64");
    }
}
