//! Provider-agnostic conversation types.
//!
//! A conversation is an ordered list of [`ChatMessage`] turns. Role labels
//! coming from outside (persisted sessions, other providers) are normalized
//! once, in [`Role::from_label`], before they become turns.

use serde::{Deserialize, Serialize};

use super::tool::{ToolCall, ToolDefinition};
use crate::storage::StoredTurn;

/// Role of a chat message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Planning engine response.
    Assistant,
    /// Tool result.
    Tool,
}

impl Role {
    /// Normalizes an external role label. `assistant` and `model` are the
    /// same role; labels that cannot appear in replayed history return
    /// `None`.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Some(Self::User),
            "assistant" | "model" | "ai" => Some(Self::Assistant),
            _ => None,
        }
    }

    /// Stored label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    /// System instructions.
    System {
        /// Instruction text.
        content: String,
    },
    /// User input.
    User {
        /// Message text.
        content: String,
    },
    /// Planning engine turn: text, tool requests, or both.
    Assistant {
        /// Generated text (may be empty when tools are requested).
        content: String,
        /// Requested tool invocations.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    /// Result of one tool invocation.
    Tool {
        /// Id of the call this answers.
        tool_call_id: String,
        /// Serialized result payload.
        content: String,
    },
}

impl ChatMessage {
    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    /// Creates a plain-text assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// Creates an assistant message carrying tool requests.
    #[must_use]
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls,
        }
    }

    /// Creates a tool result message.
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
        }
    }

    /// Builds a replayed history turn from an external role label, or `None`
    /// when the label is not a user or assistant role.
    #[must_use]
    pub fn from_history(label: &str, content: &str) -> Option<Self> {
        match Role::from_label(label)? {
            Role::User => Some(Self::user(content)),
            Role::Assistant => Some(Self::assistant(content)),
            Role::System | Role::Tool => None,
        }
    }

    /// Role of this turn.
    #[must_use]
    pub const fn role(&self) -> Role {
        match self {
            Self::System { .. } => Role::System,
            Self::User { .. } => Role::User,
            Self::Assistant { .. } => Role::Assistant,
            Self::Tool { .. } => Role::Tool,
        }
    }

    /// Text content of this turn.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::System { content }
            | Self::User { content }
            | Self::Assistant { content, .. }
            | Self::Tool { content, .. } => content,
        }
    }
}

/// A prior conversation turn as handed in by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    /// Role label as the caller knows it.
    pub role: String,
    /// Turn text.
    pub content: String,
}

impl HistoryTurn {
    /// Creates a history turn.
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Converts to a conversation turn, dropping unknown roles.
    #[must_use]
    pub fn to_message(&self) -> Option<ChatMessage> {
        ChatMessage::from_history(&self.role, &self.content)
    }
}

impl From<&StoredTurn> for HistoryTurn {
    fn from(turn: &StoredTurn) -> Self {
        Self::new(turn.role.clone(), turn.content.clone())
    }
}

/// A chat completion request (provider-agnostic).
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,
    /// Ordered conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature (0.0-2.0).
    pub temperature: Option<f32>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Tool definitions available to the model.
    pub tools: Vec<ToolDefinition>,
}

/// Token usage statistics from one or more completions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens generated in the completion.
    pub completion_tokens: u32,
    /// Total tokens used.
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Accumulates another completion's usage.
    pub const fn add(&mut self, other: &Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// A chat completion response (provider-agnostic).
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Generated text content.
    pub content: String,
    /// Token usage statistics.
    pub usage: TokenUsage,
    /// Tool calls requested by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Finish reason from the model (e.g., `"stop"`, `"tool_calls"`).
    pub finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_labels_normalized() {
        assert_eq!(Role::from_label("assistant"), Some(Role::Assistant));
        assert_eq!(Role::from_label("Model"), Some(Role::Assistant));
        assert_eq!(Role::from_label(" user "), Some(Role::User));
        assert_eq!(Role::from_label("system"), None);
        assert_eq!(Role::from_label("function"), None);
    }

    #[test]
    fn test_history_turns() {
        let turn = HistoryTurn::new("model", "Earlier answer");
        assert_eq!(turn.to_message(), Some(ChatMessage::assistant("Earlier answer")));
        assert_eq!(HistoryTurn::new("tool", "{}").to_message(), None);

        let stored = StoredTurn::now("user", "question");
        assert_eq!(HistoryTurn::from(&stored).to_message(), Some(ChatMessage::user("question")));
    }

    #[test]
    fn test_role_and_content() {
        let msg = ChatMessage::tool("call_123", "result data");
        assert_eq!(msg.role(), Role::Tool);
        assert_eq!(msg.content(), "result data");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }

    #[test]
    fn test_assistant_tool_calls_message() {
        let calls = vec![ToolCall {
            id: "call_1".to_string(),
            name: "execute_query".to_string(),
            arguments: r#"{"collection":"trades"}"#.to_string(),
        }];
        let msg = ChatMessage::assistant_tool_calls("", calls);
        let ChatMessage::Assistant { content, tool_calls } = &msg else {
            unreachable!("constructor builds an assistant turn");
        };
        assert!(content.is_empty());
        assert_eq!(tool_calls[0].name, "execute_query");
    }

    #[test]
    fn test_serialization_is_tagged_by_role() {
        let json = serde_json::to_value(ChatMessage::user("test")).unwrap_or_default();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "test"}));

        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap_or_default();
        assert!(!json.contains("tool_calls"));
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = TokenUsage::default();
        let one = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        total.add(&one);
        total.add(&one);
        assert_eq!(total.total_tokens, 30);
        assert_eq!(total.prompt_tokens, 20);
    }
}
