//! System prompt and message preparation for the LLM agent.

use agent_relay_core::run::{ContextItem, Message, Role};
use tracing::warn;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Use the available tools when they help answer the user.";

/// Build the system prompt, appending any run context.
pub fn build_system_prompt(custom: Option<&str>, context: &[ContextItem]) -> String {
    let mut parts = vec![custom.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string()];

    if !context.is_empty() {
        let lines: Vec<String> = context
            .iter()
            .map(|item| match &item.value {
                serde_json::Value::String(s) => format!("- {}: {s}", item.key),
                other => format!("- {}: {other}", item.key),
            })
            .collect();
        parts.push(format!("Context:\n{}", lines.join("\n")));
    }

    parts.join("\n\n")
}

/// System prompt first, then the run's messages.
///
/// A tool message without `toolCallId` adopts the last tool call id of the
/// nearest preceding assistant message that opened tool calls. Tool messages
/// with nothing to attach to are dropped.
pub fn prepare_messages(system_prompt: &str, messages: &[Message]) -> Vec<Message> {
    let mut prepared = Vec::with_capacity(messages.len() + 1);
    prepared.push(Message::new(Role::System, system_prompt));

    let mut last_call_id: Option<String> = None;
    for message in messages {
        if message.opens_tool_call() {
            last_call_id = message
                .tool_calls
                .as_ref()
                .and_then(|calls| calls.last())
                .map(|call| call.id.clone());
        }

        if message.role == Role::Tool && message.tool_call_id.is_none() {
            let Some(id) = last_call_id.clone() else {
                warn!(message_id = ?message.id, "Dropping tool message with no tool call to attach to");
                continue;
            };
            let mut repaired = message.clone();
            repaired.tool_call_id = Some(id);
            prepared.push(repaired);
            continue;
        }

        prepared.push(message.clone());
    }
    prepared
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_relay_core::run::{FunctionCall, ToolCall};
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: "weather".into(),
                arguments: "{}".into(),
            },
        }
    }

    fn tool_message(id: Option<&str>) -> Message {
        Message {
            tool_call_id: id.map(String::from),
            ..Message::new(Role::Tool, "sunny")
        }
    }

    #[test]
    fn test_system_prompt_includes_context() {
        let prompt = build_system_prompt(
            None,
            &[ContextItem {
                key: "city".into(),
                value: json!("Paris"),
            }],
        );
        assert!(prompt.starts_with(DEFAULT_SYSTEM_PROMPT));
        assert!(prompt.contains("- city: Paris"));
    }

    #[test]
    fn test_custom_prompt_replaces_default() {
        assert_eq!(build_system_prompt(Some("Be brief."), &[]), "Be brief.");
    }

    #[test]
    fn test_system_message_first() {
        let prepared = prepare_messages("sys", &[Message::user("hi")]);
        assert_eq!(prepared[0].role, Role::System);
        assert_eq!(prepared[0].text(), "sys");
        assert_eq!(prepared[1].text(), "hi");
    }

    #[test]
    fn test_tool_message_adopts_last_call_id() {
        let assistant = Message {
            tool_calls: Some(vec![call("c1"), call("c2")]),
            content: None,
            ..Message::assistant("")
        };
        let prepared = prepare_messages(
            "sys",
            &[Message::user("hi"), assistant, tool_message(None)],
        );
        assert_eq!(prepared.len(), 4);
        assert_eq!(prepared[3].tool_call_id.as_deref(), Some("c2"));
    }

    #[test]
    fn test_orphan_tool_message_dropped() {
        let prepared = prepare_messages("sys", &[Message::user("hi"), tool_message(None)]);
        assert_eq!(prepared.len(), 2);
    }

    #[test]
    fn test_explicit_tool_call_id_kept() {
        let prepared = prepare_messages("sys", &[tool_message(Some("own"))]);
        assert_eq!(prepared[1].tool_call_id.as_deref(), Some("own"));
    }
}
