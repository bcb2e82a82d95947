//! Folding stream events into a thread's message list.
//!
//! These are pure functions over `Vec<Message>`; the engine runs them inside
//! a Thread Cache transaction so a failure leaves the cache untouched.

use super::schema::{AiToolChunk, Chunk, ToolResult};
use crate::error::StoreError;
use crate::types::{AiMessage, Message, ToolCall, ToolMessage};

/// Merge a run's `initialMessages` into what the cache already holds.
///
/// Cached messages keep their order; an initial message is appended unless
/// the cache already has one with the same type and content.
pub fn merge_initial_messages(cached: &[Message], initial: &[Message]) -> Vec<Message> {
    let mut merged = cached.to_vec();
    for message in initial {
        if !cached.iter().any(|existing| existing.same_type_and_content(message)) {
            merged.push(message.clone());
        }
    }
    merged
}

/// Append streamed text to the current AI message for `chunk.node`.
pub fn apply_chunk(messages: &mut Vec<Message>, chunk: &Chunk) {
    with_current_ai(messages, &chunk.node, |ai| ai.content.push_str(&chunk.content));
}

/// Open a tool call or extend the last one's `args`.
pub fn apply_tool_chunk(messages: &mut Vec<Message>, chunk: &AiToolChunk) -> Result<(), StoreError> {
    match chunk.id.as_deref() {
        Some(id) => {
            with_current_ai(messages, &chunk.node, |ai| {
                ai.tool_calls.push(ToolCall {
                    id: id.to_string(),
                    name: chunk.name.clone().unwrap_or_default(),
                    args: chunk.args.clone().unwrap_or_default(),
                })
            });
            Ok(())
        }
        None => {
            let call = last_tool_call(messages, &chunk.node).ok_or_else(|| {
                StoreError::Protocol(format!(
                    "tool call arguments from node `{}` with no open tool call",
                    chunk.node
                ))
            })?;
            if let Some(args) = &chunk.args {
                call.args.push_str(args);
            }
            if call.name.is_empty() {
                if let Some(name) = &chunk.name {
                    call.name = name.clone();
                }
            }
            Ok(())
        }
    }
}

/// Append a tool result as its own message.
pub fn apply_tool_result(messages: &mut Vec<Message>, result: &ToolResult) {
    messages.push(Message::Tool(ToolMessage {
        content: result.content.clone(),
        node_id: Some(result.node.clone()),
        tool_call_id: result.tool_call_id.clone(),
        name: result.tool_name.clone(),
        is_error: result.is_error,
    }));
}

/// Run `f` on the last message if it is an AI message from `node`;
/// otherwise on a fresh AI message appended for that node.
fn with_current_ai<R>(messages: &mut Vec<Message>, node: &str, f: impl FnOnce(&mut AiMessage) -> R) -> R {
    if let Some(Message::Ai(ai)) = messages.last_mut() {
        if ai.node_id.as_deref() == Some(node) {
            return f(ai);
        }
    }
    let mut ai = AiMessage {
        node_id: Some(node.to_string()),
        ..AiMessage::default()
    };
    let out = f(&mut ai);
    messages.push(Message::Ai(ai));
    out
}

fn last_tool_call<'a>(messages: &'a mut [Message], node: &str) -> Option<&'a mut ToolCall> {
    match messages.last_mut() {
        Some(Message::Ai(ai)) if ai.node_id.as_deref() == Some(node) => ai.tool_calls.last_mut(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageKind;

    fn chunk(node: &str, content: &str) -> Chunk {
        Chunk {
            node: node.into(),
            content: content.into(),
        }
    }

    fn tool_chunk(node: &str, id: Option<&str>, name: Option<&str>, args: &str) -> AiToolChunk {
        AiToolChunk {
            node: node.into(),
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            args: Some(args.to_string()),
        }
    }

    #[test]
    fn chunks_from_one_node_build_one_message() {
        let mut messages = vec![Message::human("hi")];
        for part in ["Hel", "lo", "!"] {
            apply_chunk(&mut messages, &chunk("agent", part));
        }
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].kind(), MessageKind::Ai);
        assert_eq!(messages[1].content(), "Hello!");
        assert_eq!(messages[1].node_id(), Some("agent"));
    }

    #[test]
    fn node_change_starts_new_message() {
        let mut messages = Vec::new();
        apply_chunk(&mut messages, &chunk("a", "one"));
        apply_chunk(&mut messages, &chunk("b", "two"));
        apply_chunk(&mut messages, &chunk("a", "three"));
        let contents: Vec<&str> = messages.iter().map(Message::content).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn same_node_after_tool_result_starts_new_ai_message() {
        let mut messages = Vec::new();
        apply_chunk(&mut messages, &chunk("agent", "before"));
        apply_tool_result(
            &mut messages,
            &ToolResult {
                node: "agent".into(),
                tool_name: "search".into(),
                content: "found".into(),
                ..ToolResult::default()
            },
        );
        apply_chunk(&mut messages, &chunk("agent", "after"));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].kind(), MessageKind::Ai);
        assert_eq!(messages[2].content(), "after");
    }

    #[test]
    fn tool_args_concatenate_across_continuations() {
        let mut messages = Vec::new();
        apply_tool_chunk(&mut messages, &tool_chunk("agent", Some("call-1"), Some("calc"), "{\"a\":"))
            .expect("open");
        apply_tool_chunk(&mut messages, &tool_chunk("agent", None, None, "1,"))
            .expect("continue");
        apply_tool_chunk(&mut messages, &tool_chunk("agent", None, None, "\"b\":2}"))
            .expect("continue");
        let Message::Ai(ai) = &messages[0] else {
            panic!("expected ai message");
        };
        assert_eq!(ai.tool_calls.len(), 1);
        assert_eq!(ai.tool_calls[0].name, "calc");
        assert_eq!(ai.tool_calls[0].args, "{\"a\":1,\"b\":2}");
    }

    #[test]
    fn tool_call_joins_streamed_text_from_same_node() {
        let mut messages = Vec::new();
        apply_chunk(&mut messages, &chunk("agent", "Let me check."));
        apply_tool_chunk(&mut messages, &tool_chunk("agent", Some("c1"), Some("lookup"), ""))
            .expect("open");
        assert_eq!(messages.len(), 1);
        let Message::Ai(ai) = &messages[0] else {
            panic!("expected ai message");
        };
        assert_eq!(ai.content, "Let me check.");
        assert_eq!(ai.tool_calls[0].id, "c1");
    }

    #[test]
    fn orphan_args_are_a_protocol_error() {
        let mut messages = vec![Message::human("hi")];
        let err = apply_tool_chunk(&mut messages, &tool_chunk("agent", None, None, "x"))
            .expect_err("orphan");
        assert!(matches!(err, StoreError::Protocol(_)));
        assert_eq!(messages, vec![Message::human("hi")]);
    }

    #[test]
    fn merge_skips_messages_already_cached() {
        let cached = vec![Message::human("a"), Message::human("hello")];
        let initial = vec![Message::human("hello"), Message::system("rules")];
        let merged = merge_initial_messages(&cached, &initial);
        assert_eq!(
            merged,
            vec![Message::human("a"), Message::human("hello"), Message::system("rules")]
        );
    }

    #[cfg(feature = "fuzz-tests")]
    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn chunk_contents_concatenate_in_order(
                parts in proptest::collection::vec("[ -~]{0,12}", 1..20)
            ) {
                let mut messages = vec![Message::human("q")];
                for part in &parts {
                    apply_chunk(&mut messages, &chunk("n", part));
                }
                prop_assert_eq!(messages.len(), 2);
                prop_assert_eq!(messages[1].content(), parts.concat());
            }

            #[test]
            fn tool_args_concatenate_in_order(
                first in "[ -~]{0,12}",
                rest in proptest::collection::vec("[ -~]{0,12}", 0..20)
            ) {
                let mut messages = Vec::new();
                apply_tool_chunk(&mut messages, &tool_chunk("n", Some("id"), Some("t"), &first))
                    .expect("open");
                for part in &rest {
                    apply_tool_chunk(&mut messages, &tool_chunk("n", None, None, part))
                        .expect("continue");
                }
                let Message::Ai(ai) = &messages[0] else {
                    panic!("expected ai message");
                };
                prop_assert_eq!(&ai.tool_calls[0].args, &format!("{first}{}", rest.concat()));
            }
        }
    }
}
