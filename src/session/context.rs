//! Context-window selection over a session's message log.
//!
//! Picks a contiguous suffix of at most `max_messages` entries, then walks
//! the cut point backward so the slice never opens in the middle of an
//! assistant/tool exchange. Correctness wins over the requested size: the
//! returned slice may be longer than `max_messages`.

use super::message::{Message, Role};

/// Extra backward steps allowed past `max_messages` before the walk gives up.
const WALK_SLACK: usize = 8;

/// Select the slice of `messages` to send as model context.
///
/// The cut point starts at `len - max_messages` and moves backward while the
/// opening message would orphan a tool exchange:
/// - a `tool` message needs the assistant that issued the call;
/// - an assistant message carrying tool calls needs the turn that led to it.
///
/// The walk is bounded; if no safe boundary is found within the bound, the
/// whole log is returned rather than an unpaired slice. A log whose first
/// message is a `tool` message is returned as-is since no valid predecessor
/// exists.
pub fn select_context(messages: &[Message], max_messages: usize) -> &[Message] {
    let len = messages.len();
    let mut cut = len.saturating_sub(max_messages);
    let limit = max_messages + WALK_SLACK;
    let mut walked = 0;

    while cut > 0 && cut < len {
        if walked >= limit {
            cut = 0;
            break;
        }
        let opens_unpaired = match messages[cut].role {
            Role::Tool => true,
            Role::Assistant => messages[cut].has_tool_calls(),
            Role::User | Role::System => false,
        };
        if !opens_unpaired {
            break;
        }
        cut -= 1;
        walked += 1;
    }

    &messages[cut..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::message::{MessageContent, ToolCall};
    use chrono::Utc;

    fn text_message(role: Role, text: &str) -> Message {
        Message {
            id: format!("m-{text}"),
            role,
            content: MessageContent::Text(text.to_string()),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            metadata: None,
        }
    }

    fn assistant_with_call(call_id: &str) -> Message {
        let mut msg = text_message(Role::Assistant, "");
        msg.tool_calls = vec![ToolCall::new(call_id, "search", "{}")];
        msg
    }

    fn tool_result(call_id: &str) -> Message {
        let mut msg = text_message(Role::Tool, "result");
        msg.tool_call_id = Some(call_id.to_string());
        msg
    }

    /// Every tool message must have a preceding assistant (with only tool
    /// messages in between) whose calls include its id.
    fn pairing_holds(slice: &[Message]) -> bool {
        for (i, msg) in slice.iter().enumerate() {
            if msg.role != Role::Tool {
                continue;
            }
            let Some(call_id) = msg.tool_call_id.as_deref() else {
                return false;
            };
            let issuer = slice[..i]
                .iter()
                .rev()
                .find(|m| m.role != Role::Tool);
            match issuer {
                Some(m)
                    if m.role == Role::Assistant
                        && m.tool_calls.iter().any(|c| c.id == call_id) => {}
                _ => return false,
            }
        }
        true
    }

    #[test]
    fn short_log_returned_whole() {
        let log = vec![
            text_message(Role::User, "hi"),
            text_message(Role::Assistant, "hello"),
        ];
        let slice = select_context(&log, 10);
        assert_eq!(slice.len(), 2);
    }

    #[test]
    fn cuts_at_plain_boundary() {
        let log = vec![
            text_message(Role::User, "one"),
            text_message(Role::Assistant, "two"),
            text_message(Role::User, "three"),
            text_message(Role::Assistant, "four"),
        ];
        let slice = select_context(&log, 2);
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].text(), "three");
    }

    #[test]
    fn never_splits_tool_from_issuer() {
        let log = vec![
            text_message(Role::User, "hi"),
            assistant_with_call("c1"),
            tool_result("c1"),
            text_message(Role::User, "thanks"),
        ];
        let slice = select_context(&log, 2);
        assert!(slice.len() >= 3, "slice too short: {}", slice.len());
        assert_ne!(slice[0].role, Role::Tool);
        assert!(pairing_holds(slice));
    }

    #[test]
    fn walks_past_assistant_opening_with_calls() {
        let log = vec![
            text_message(Role::User, "look this up"),
            assistant_with_call("c1"),
            tool_result("c1"),
            text_message(Role::Assistant, "found it"),
            text_message(Role::User, "more"),
        ];
        // cut would land on the assistant that issued c1
        let slice = select_context(&log, 4);
        assert_eq!(slice.len(), 5);
        assert_eq!(slice[0].role, Role::User);
    }

    #[test]
    fn parallel_tool_results_stay_paired() {
        let mut issuer = text_message(Role::Assistant, "");
        issuer.tool_calls = vec![
            ToolCall::new("c1", "search", "{}"),
            ToolCall::new("c2", "fetch", "{}"),
        ];
        let log = vec![
            text_message(Role::User, "go"),
            issuer,
            tool_result("c1"),
            tool_result("c2"),
            text_message(Role::User, "next"),
        ];
        for n in 1..=log.len() + 2 {
            let slice = select_context(&log, n);
            assert!(pairing_holds(slice), "pairing broken at n={n}");
        }
    }

    #[test]
    fn tool_first_log_accepted_as_is() {
        let log = vec![tool_result("c0"), text_message(Role::User, "hi")];
        let slice = select_context(&log, 5);
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].role, Role::Tool);
    }

    #[test]
    fn deep_tool_chain_falls_back_to_full_log() {
        let mut log = vec![text_message(Role::User, "start")];
        for i in 0..40 {
            let id = format!("c{i}");
            log.push(assistant_with_call(&id));
            log.push(tool_result(&id));
        }
        let slice = select_context(&log, 2);
        assert!(pairing_holds(slice));
        assert_eq!(slice.len(), log.len());
    }

    #[test]
    fn idempotent_for_fixed_inputs() {
        let log = vec![
            text_message(Role::User, "a"),
            assistant_with_call("c1"),
            tool_result("c1"),
            text_message(Role::User, "b"),
            text_message(Role::Assistant, "c"),
        ];
        for n in 0..=log.len() + 1 {
            let first: Vec<String> =
                select_context(&log, n).iter().map(|m| m.id.clone()).collect();
            let second: Vec<String> =
                select_context(&log, n).iter().map(|m| m.id.clone()).collect();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn zero_budget_yields_empty_slice() {
        let log = vec![text_message(Role::User, "hi")];
        // degenerate budget; empty slice trivially satisfies pairing
        assert!(select_context(&log, 0).is_empty());
    }

    #[test]
    fn pairing_invariant_across_all_budgets() {
        let log = vec![
            text_message(Role::User, "a"),
            assistant_with_call("c1"),
            tool_result("c1"),
            text_message(Role::Assistant, "done"),
            text_message(Role::User, "b"),
            assistant_with_call("c2"),
            tool_result("c2"),
            text_message(Role::User, "c"),
        ];
        for n in 0..=log.len() + 3 {
            let slice = select_context(&log, n);
            assert!(pairing_holds(slice), "pairing broken at n={n}");
        }
    }
}
