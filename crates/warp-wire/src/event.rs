//! Normalized stream events
//!
//! The decoder yields raw [`ResponseEvent`]s; the normalizer flattens them
//! into the small event vocabulary the format adapters consume. Tool-call
//! indices are assigned in order of first appearance of each upstream
//! `tool_call_id`; id and name travel only on the first delta for an index,
//! arguments may arrive across several.

use crate::proto::{ResponseEvent, TaskMessage};
use crate::tools::struct_to_json;

/// Terminal reason of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    EndTurn,
    MaxTokens,
    Quota,
}

/// One normalized event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// First event of a stream; carries the upstream session handle.
    Init { conversation_id: String },
    Text { delta: String },
    ToolCallDelta {
        index: usize,
        /// Set on the first delta for this index
        id: Option<String>,
        /// Set on the first delta for this index
        name: Option<String>,
        /// JSON fragment of the arguments
        arguments: Option<String>,
    },
    Finished {
        reason: FinishKind,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
}

/// Flattens decoded response events, tracking tool-call indices across the
/// stream.
#[derive(Default)]
pub struct EventNormalizer {
    tool_ids: Vec<String>,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(&mut self, event: &ResponseEvent) -> Vec<StreamEvent> {
        let mut out = Vec::new();

        if let Some(init) = &event.init {
            let id = if init.conversation_id.is_empty() {
                init.task_id.clone()
            } else {
                init.conversation_id.clone()
            };
            if !id.is_empty() {
                out.push(StreamEvent::Init {
                    conversation_id: id,
                });
            }
        }

        if let Some(actions) = &event.client_actions {
            for action in &actions.actions {
                if let Some(create) = &action.create_task
                    && let Some(task) = &create.task
                    && !task.id.is_empty()
                {
                    out.push(StreamEvent::Init {
                        conversation_id: task.id.clone(),
                    });
                }
                if let Some(add) = &action.add_messages_to_task {
                    for message in &add.messages {
                        self.message_events(message, &mut out);
                    }
                }
                if let Some(append) = &action.append_to_message_content
                    && let Some(message) = &append.message
                {
                    self.message_events(message, &mut out);
                }
            }
        }

        if let Some(finished) = &event.finished {
            let reason = match &finished.reason {
                Some(r) if r.max_token_limit.is_some() => FinishKind::MaxTokens,
                Some(r) if r.quota_limit.is_some() => FinishKind::Quota,
                _ => FinishKind::EndTurn,
            };
            let mut prompt_tokens = 0u64;
            let mut completion_tokens = 0u64;
            for usage in &finished.token_usage {
                prompt_tokens += usage.total_input.max(0) as u64;
                completion_tokens += usage.output.max(0) as u64;
            }
            out.push(StreamEvent::Finished {
                reason,
                prompt_tokens,
                completion_tokens,
            });
        }

        out
    }

    fn message_events(&mut self, message: &TaskMessage, out: &mut Vec<StreamEvent>) {
        if let Some(output) = &message.agent_output
            && !output.text.is_empty()
        {
            out.push(StreamEvent::Text {
                delta: output.text.clone(),
            });
        }

        if let Some(call) = &message.tool_call {
            let arguments = call
                .args
                .as_ref()
                .map(|s| struct_to_json(s).to_string())
                .unwrap_or_else(|| "{}".to_string());
            match self.tool_ids.iter().position(|id| *id == call.tool_call_id) {
                Some(index) => out.push(StreamEvent::ToolCallDelta {
                    index,
                    id: None,
                    name: None,
                    arguments: Some(arguments),
                }),
                None => {
                    let index = self.tool_ids.len();
                    self.tool_ids.push(call.tool_call_id.clone());
                    out.push(StreamEvent::ToolCallDelta {
                        index,
                        id: Some(call.tool_call_id.clone()),
                        name: Some(call.name.clone()),
                        arguments: Some(arguments),
                    });
                }
            }
        }
    }
}
