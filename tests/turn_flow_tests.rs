use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use parley::provider::{
    ChatOptions, ChatProvider, Chunk, ProviderConfig, ProviderKind, ToolDefinition,
    create_provider,
};
use parley::session::{Role, SessionStore};
use parley::turn::{ToolError, ToolExecutor, ToolOutput, TurnOptions, TurnRunner};

fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

struct Lookup;

#[async_trait]
impl ToolExecutor for Lookup {
    async fn execute(&self, name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        if name != "lookup" {
            return Err(format!("unknown tool: {name}").into());
        }
        let q = arguments["q"].as_str().unwrap_or_default();
        Ok(ToolOutput::text(format!("result for {q}")))
    }
}

fn sse(frames: &[&str]) -> String {
    let mut body = String::new();
    for frame in frames {
        body.push_str("data: ");
        body.push_str(frame);
        body.push_str("\n\n");
    }
    body
}

fn sse_response(frames: &[&str]) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(sse(frames), "text/event-stream")
}

fn lookup_tool() -> ToolDefinition {
    ToolDefinition {
        name: "lookup".to_string(),
        description: "Look something up".to_string(),
        parameters: json!({
            "type": "object",
            "properties": { "q": { "type": "string" } },
            "required": ["q"]
        }),
    }
}

#[tokio::test]
async fn tool_round_trip_over_the_wire() {
    init_tracing();
    let server = MockServer::start().await;

    // round one: the model asks for a tool
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"lookup","arguments":"{\"q\":\"rust\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    // round two: the request must carry the correlated tool result
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("\"role\":\"tool\""))
        .and(body_string_contains("\"tool_call_id\":\"call_1\""))
        .and(body_string_contains("result for rust"))
        .respond_with(sse_response(&[
            r#"{"choices":[{"delta":{"content":"The answer is 42."}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).await.unwrap());
    let provider: Arc<dyn ChatProvider> = Arc::from(
        create_provider(
            &ProviderConfig::new(ProviderKind::OpenAi, "gpt-4o", "test-key")
                .with_base_url(server.uri()),
        )
        .unwrap(),
    );
    let options = TurnOptions {
        chat: ChatOptions {
            tools: vec![lookup_tool()],
            ..Default::default()
        },
        ..Default::default()
    };
    let runner = TurnRunner::new(store.clone(), provider, Arc::new(Lookup)).with_options(options);

    let (tx, mut rx) = mpsc::channel(64);
    let reply = runner
        .run("s1", "look up rust", tx, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.text(), "The answer is 42.");

    // the log holds the full round trip in order
    let session = store.get("s1").await.unwrap();
    let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(session.messages[1].tool_calls.len(), 1);
    assert_eq!(session.messages[1].tool_calls[0].name, "lookup");
    assert_eq!(session.messages[2].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(session.messages[2].text(), "result for rust");
    assert_eq!(session.title, "look up rust");

    // both rounds were mirrored to the caller
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    let tool_uses = chunks.iter().filter(|c| matches!(c, Chunk::ToolUse(_))).count();
    let finishes = chunks.iter().filter(|c| matches!(c, Chunk::Finish(_))).count();
    assert_eq!(tool_uses, 1);
    assert_eq!(finishes, 2);

    // and the whole thing survived to disk
    let raw = std::fs::read_to_string(dir.path().join("s1.json")).unwrap();
    assert!(raw.contains("toolCalls"));
    assert!(raw.contains("look up rust"));
}

#[tokio::test]
async fn plain_turn_with_the_other_dialect() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            concat!(
                "event: message_start\n",
                r#"data: {"type":"message_start","message":{}}"#,
                "\n\n",
                "event: content_block_start\n",
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
                "\n\n",
                "event: content_block_delta\n",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello there."}}"#,
                "\n\n",
                "event: content_block_stop\n",
                r#"data: {"type":"content_block_stop","index":0}"#,
                "\n\n",
                "event: message_delta\n",
                r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"}}"#,
                "\n\n",
                "event: message_stop\n",
                r#"data: {"type":"message_stop"}"#,
                "\n\n",
            ),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).await.unwrap());
    let provider: Arc<dyn ChatProvider> = Arc::from(
        create_provider(
            &ProviderConfig::new(ProviderKind::Anthropic, "claude-sonnet-4-20250514", "test-key")
                .with_base_url(server.uri()),
        )
        .unwrap(),
    );
    let runner = TurnRunner::new(store.clone(), provider, Arc::new(Lookup));

    let (tx, mut rx) = mpsc::channel(64);
    let reply = runner
        .run("s2", "hi", tx, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reply.text(), "Hello there.");
    let session = store.get("s2").await.unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[1].text(), "Hello there.");

    let mut saw_content = false;
    while let Some(chunk) = rx.recv().await {
        if let Chunk::Content { text, .. } = chunk {
            saw_content = true;
            assert_eq!(text, "Hello there.");
        }
    }
    assert!(saw_content);
}
