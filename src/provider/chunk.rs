//! Provider-agnostic streaming chunk model.
//!
//! Both vendor adapters decode their wire frames into [`Chunk`]s. Tool calls
//! arrive fragmented; [`ToolCallAccumulator`] buffers fragments per wire
//! index until the vendor signals the call is complete.

use std::collections::BTreeMap;

use tracing::warn;
use uuid::Uuid;

use crate::session::ToolCall;

/// One normalized unit of streamed model output.
///
/// Scoped to a single provider call; folded into messages afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Incremental text: the new fragment plus the turn's cumulative text.
    Content { delta: String, text: String },
    /// A fully reassembled tool call.
    ToolUse(ToolCall),
    /// Terminal: the vendor finished the turn.
    Finish(FinishReason),
    /// Terminal: transport or API failure.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    ToolUse,
}

impl FinishReason {
    /// Map a chat-completions `finish_reason`. Unknown values fold to
    /// `EndTurn`.
    pub fn from_openai(reason: Option<&str>) -> Self {
        match reason {
            Some("length") => Self::MaxTokens,
            Some("tool_calls") => Self::ToolUse,
            _ => Self::EndTurn,
        }
    }

    /// Map a messages-API `stop_reason`. Unknown values fold to `EndTurn`.
    pub fn from_anthropic(reason: &str) -> Self {
        match reason {
            "max_tokens" => Self::MaxTokens,
            "tool_use" => Self::ToolUse,
            _ => Self::EndTurn,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::MaxTokens => "max_tokens",
            Self::ToolUse => "tool_use",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scratch state for one tool call while its fragments stream in.
#[derive(Debug, Default)]
pub struct ToolCallBuilder {
    pub id: Option<String>,
    pub name: Option<String>,
    argument_parts: Vec<String>,
}

impl ToolCallBuilder {
    pub fn new(id: Option<String>, name: Option<String>) -> Self {
        Self {
            id,
            name,
            argument_parts: Vec::new(),
        }
    }

    pub fn push_arguments(&mut self, fragment: &str) {
        if !fragment.is_empty() {
            self.argument_parts.push(fragment.to_string());
        }
    }

    /// Finalize into a [`ToolCall`], or `None` when no name ever arrived.
    ///
    /// Arguments are kept byte-exact when the concatenation parses as JSON;
    /// otherwise they degrade to `{}`. A missing id gets a synthesized
    /// placeholder so the turn survives a misbehaving vendor.
    pub fn finish(self) -> Option<ToolCall> {
        let Some(name) = self.name else {
            warn!("discarding tool call fragments with no function name");
            return None;
        };
        let id = self.id.unwrap_or_else(|| {
            let id = format!("call_{}", Uuid::new_v4());
            warn!(tool = %name, placeholder = %id, "tool call arrived without an id");
            id
        });
        let raw = self.argument_parts.concat();
        let arguments = if raw.trim().is_empty() {
            "{}".to_string()
        } else if serde_json::from_str::<serde_json::Value>(&raw).is_ok() {
            raw
        } else {
            warn!(tool = %name, "tool call arguments are not valid JSON, using empty object");
            "{}".to_string()
        };
        Some(ToolCall { id, name, arguments })
    }
}

/// Per-index scratch buffers for in-flight tool calls.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    builders: BTreeMap<usize, ToolCallBuilder>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: usize, builder: ToolCallBuilder) {
        self.builders.insert(index, builder);
    }

    pub fn entry(&mut self, index: usize) -> &mut ToolCallBuilder {
        self.builders.entry(index).or_default()
    }

    /// Close out one index (block-stop style vendors).
    pub fn remove(&mut self, index: usize) -> Option<ToolCallBuilder> {
        self.builders.remove(&index)
    }

    /// Close out everything in index order (finish-reason style vendors).
    pub fn drain(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.builders)
            .into_values()
            .filter_map(ToolCallBuilder::finish)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}
