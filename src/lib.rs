#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod error;
pub mod provider;
pub mod session;
pub mod turn;

pub use error::{Error, Result};
pub use provider::{
    ChatOptions, ChatProvider, Chunk, FinishReason, ProviderConfig, ProviderError, ProviderKind,
    ToolDefinition, create_provider,
};
pub use session::{
    ContentPart, Message, MessageContent, MessageInput, Role, Session, SessionStore,
    SessionStoreError, SessionSummary, ToolCall, select_context,
};
pub use turn::{ToolError, ToolExecutor, ToolOutput, TurnError, TurnOptions, TurnRunner};
