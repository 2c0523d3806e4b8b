//! Property tests over generated server event sequences
//!
//! Replaying the same frames must always produce the same turns, and no
//! tool call may resolve without having been started.

use std::collections::HashSet;

use chat_stream::config::DisplaySettings;
use chat_stream::model::{Conversation, ConversationId, ToolCallStatus, Turn};
use chat_stream::protocol::EventDecoder;
use chat_stream::session::ConversationContext;
use proptest::prelude::*;

use super::common::frames;

#[derive(Debug, Clone)]
enum Step {
    Start(u8),
    Delta(u8),
    End(u8),
    ToolStart(u8),
    ToolResult(u8),
    Interrupt,
    Error,
    Done,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0u8..4).prop_map(Step::Start),
        4 => (0u8..4).prop_map(Step::Delta),
        2 => (0u8..4).prop_map(Step::End),
        3 => (0u8..5).prop_map(Step::ToolStart),
        3 => (0u8..5).prop_map(Step::ToolResult),
        1 => Just(Step::Interrupt),
        1 => Just(Step::Error),
        1 => Just(Step::Done),
    ]
}

fn to_frame(step: &Step) -> String {
    match step {
        Step::Start(m) => frames::message_start(&format!("m{m}"), "ai"),
        Step::Delta(m) => frames::message_delta(&format!("m{m}"), "x"),
        Step::End(m) => frames::message_end(&format!("m{m}")),
        Step::ToolStart(t) => frames::tool_call_start(&format!("t{t}"), "search"),
        Step::ToolResult(t) => frames::tool_call_result(&format!("t{t}"), "ok"),
        Step::Interrupt => frames::interrupt("i1", &["search"]),
        Step::Error => frames::error("boom", None),
        Step::Done => frames::done(),
    }
}

fn replay(steps: &[Step]) -> Vec<Turn> {
    let conversation = Conversation::new(ConversationId::from("c1"), "props");
    let mut context = ConversationContext::new(conversation, vec!["task".to_string()]);
    let mut decoder = EventDecoder::new();
    for step in steps {
        if let Some(envelope) = decoder.decode_lossy(&to_frame(step)) {
            context.apply(&envelope.event);
        }
    }
    context.turns(&DisplaySettings::default())
}

proptest! {
    #[test]
    fn replay_is_deterministic(steps in prop::collection::vec(step(), 0..60)) {
        prop_assert_eq!(replay(&steps), replay(&steps));
    }

    #[test]
    fn no_tool_call_resolves_without_start(steps in prop::collection::vec(step(), 0..60)) {
        let started: HashSet<String> = steps
            .iter()
            .filter_map(|s| match s {
                Step::ToolStart(t) => Some(format!("t{t}")),
                _ => None,
            })
            .collect();

        let turns = replay(&steps);
        let calls: Vec<_> = turns.iter().flat_map(|t| t.tool_calls.iter()).collect();
        for call in &calls {
            prop_assert!(started.contains(&call.id), "unstarted call {}", call.id);
        }

        let resolved = calls
            .iter()
            .filter(|c| c.status == ToolCallStatus::Completed)
            .count();
        prop_assert!(resolved <= started.len());

        let ids: HashSet<&str> = calls.iter().map(|c| c.id.as_str()).collect();
        prop_assert_eq!(ids.len(), calls.len(), "tool call duplicated across turns");
    }

    #[test]
    fn message_ids_stay_unique(steps in prop::collection::vec(step(), 0..60)) {
        let turns = replay(&steps);
        let ids: HashSet<&str> = turns.iter().map(|t| t.message.id.as_str()).collect();
        prop_assert_eq!(ids.len(), turns.len());
    }
}
