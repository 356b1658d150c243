//! Chat-completions wire request types.

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
}

/// One wire message. Tool results ride the dedicated `tool` role, correlated
/// to the issuing call by `tool_call_id`.
#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: ChatContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<AssistantToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct AssistantToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: FunctionPayload,
}

#[derive(Debug, Serialize)]
pub struct FunctionPayload {
    pub name: String,
    /// JSON-encoded argument object, passed through verbatim.
    pub arguments: String,
}

#[derive(Debug, Serialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: FunctionSpec,
}

#[derive(Debug, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_request_shape() {
        let request = ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage {
                role: "user",
                content: ChatContent::Text("Hello".to_string()),
                tool_calls: None,
                tool_call_id: None,
            }],
            max_tokens: 1024,
            stream: true,
            tools: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["max_tokens"], 1024);
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["content"], "Hello");
        assert!(json.get("tools").is_none());
        assert!(json["messages"][0].get("tool_calls").is_none());
    }

    #[test]
    fn tool_result_message_shape() {
        let message = ChatMessage {
            role: "tool",
            content: ChatContent::Text("file1.txt".to_string()),
            tool_calls: None,
            tool_call_id: Some("call_123".to_string()),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_123");
    }

    #[test]
    fn assistant_tool_call_shape() {
        let message = ChatMessage {
            role: "assistant",
            content: ChatContent::Text(String::new()),
            tool_calls: Some(vec![AssistantToolCall {
                id: "call_123".to_string(),
                kind: "function",
                function: FunctionPayload {
                    name: "read_file".to_string(),
                    arguments: r#"{"path":"/etc/hosts"}"#.to_string(),
                },
            }]),
            tool_call_id: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "read_file");
        assert_eq!(
            json["tool_calls"][0]["function"]["arguments"],
            r#"{"path":"/etc/hosts"}"#
        );
    }

    #[test]
    fn image_part_uses_data_url() {
        let content = ChatContent::Parts(vec![
            ChatContentPart::Text {
                text: "What is this?".to_string(),
            },
            ChatContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,abc123".to_string(),
                },
            },
        ]);
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json[1]["type"], "image_url");
        assert_eq!(json[1]["image_url"]["url"], "data:image/png;base64,abc123");
    }
}
