//! Internal chat-message model
//!
//! Both client dialects (OpenAI and Anthropic) are mapped into this model
//! before the builder sees them. [`TurnPlan::from_messages`] splits a dialog
//! into the current turn, the history to fold, and the pending tool results
//! — the three inputs the request builder consumes.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation recorded on an assistant message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, verbatim from the client
    pub arguments: String,
}

/// One message of the client dialog, dialect-neutral.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    /// Set on `Role::Tool` messages
    pub tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// A client-declared tool definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments
    pub input_schema: serde_json::Value,
}

/// The outcome of one tool invocation, returned by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
}

/// A dialog split into the builder's three inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnPlan {
    /// The current turn; empty when the turn consists of tool results only.
    pub user_message: String,
    pub history: Vec<ChatMessage>,
    /// Tool results newer than the last user message.
    pub tool_results: Vec<ToolResult>,
}

impl TurnPlan {
    /// Whether this is the very first exchange (template-based request).
    pub fn is_new_conversation(&self) -> bool {
        self.history.is_empty() && self.tool_results.is_empty()
    }

    /// Split a dialog. System messages are dropped (the upstream has no
    /// system slot; callers that need system text fold it into history
    /// before this point). Errors when the dialog carries neither a user
    /// turn nor tool results.
    pub fn from_messages(messages: &[ChatMessage]) -> Result<TurnPlan> {
        let last_user_idx = messages.iter().rposition(|m| m.role == Role::User);
        let ends_with_tool = messages.last().map(|m| m.role) == Some(Role::Tool);

        let mut user_message = String::new();
        let mut history = Vec::new();
        let mut tool_results = Vec::new();

        for (i, msg) in messages.iter().enumerate() {
            match msg.role {
                Role::System => continue,
                Role::Tool => {
                    let content = msg.content.clone().unwrap_or_default();
                    let id = msg.tool_call_id.clone().unwrap_or_default();
                    // Tool results after the last user message are the pending
                    // turn; earlier ones are plain history.
                    if last_user_idx.is_some_and(|u| i > u) || last_user_idx.is_none() {
                        tool_results.push(ToolResult {
                            tool_call_id: id,
                            content,
                        });
                    } else {
                        history.push(msg.clone());
                    }
                }
                Role::User => {
                    if Some(i) == last_user_idx && !ends_with_tool {
                        user_message = msg.content.clone().unwrap_or_default();
                    } else if msg.content.is_some() {
                        history.push(msg.clone());
                    }
                }
                Role::Assistant => {
                    if msg.content.is_some() || !msg.tool_calls.is_empty() {
                        history.push(msg.clone());
                    }
                }
            }
        }

        if user_message.is_empty() && tool_results.is_empty() {
            return Err(Error::EmptyTurn);
        }

        Ok(TurnPlan {
            user_message,
            history,
            tool_results,
        })
    }
}
