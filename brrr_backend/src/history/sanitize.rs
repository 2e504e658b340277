//! Filters raw history down to conversational turns worth grounding on.
//!
//! All denylist matching is case-insensitive: entries are stored lowercase and
//! compared against the lowercased turn.

use super::{ConversationTurn, Role};

/// Two exchanges: user, assistant, user, assistant.
pub const MAX_CONTEXT_TURNS: usize = 4;

pub const COMMAND_PREFIX: char = '/';

/// Markers of the bot's own fallback and error replies.
pub const FALLBACK_MARKERS: &[&str] = &[
    "didn't quite get that",
    "my brain went blank",
    "something went wrong",
    "required too many steps",
];

/// Command names and help-seeking phrases, plus fragments of the bot's own
/// command listings.
pub const COMMAND_INDICATORS: &[&str] = &[
    "describe the projects",
    "/help",
    "/project",
    "/idea",
    "/week",
    "/memory",
    "/persona",
    "/history",
    "what commands",
    "list commands",
    "show commands",
    "what can you do",
    "how do you help",
    "quick things i can do",
    "start/manage projects:",
    "useful commands",
    "quick commands to get started",
    "/ping (latency)",
    "/brrr (bot status)",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn is_noise(turn: &ConversationTurn) -> bool {
    let content = turn.content.trim();
    if content.is_empty() || content.starts_with(COMMAND_PREFIX) {
        return true;
    }
    let lowered = content.to_lowercase();
    if turn.role == Role::Assistant && contains_any(&lowered, FALLBACK_MARKERS) {
        return true;
    }
    contains_any(&lowered, COMMAND_INDICATORS)
}

/// Sanitize chronological turns. Pure; the result holds at most
/// [`MAX_CONTEXT_TURNS`] turns with alternating roles.
pub fn sanitize_history(raw: &[ConversationTurn]) -> Vec<ConversationTurn> {
    let mut kept: Vec<ConversationTurn> = Vec::with_capacity(raw.len());
    for turn in raw.iter().filter(|turn| !is_noise(turn)) {
        match kept.last_mut() {
            Some(last) if last.role == turn.role => *last = turn.clone(),
            _ => kept.push(turn.clone()),
        }
    }

    if kept.len() > MAX_CONTEXT_TURNS {
        kept.drain(..kept.len() - MAX_CONTEXT_TURNS);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ConversationScope;
    use chrono::Utc;

    fn turn(id: i64, role: Role, content: &str) -> ConversationTurn {
        ConversationTurn {
            id,
            scope: ConversationScope {
                user_id: 1,
                community_id: 2,
                channel_id: 3,
            },
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    fn contents(turns: &[ConversationTurn]) -> Vec<&str> {
        turns.iter().map(|t| t.content.as_str()).collect()
    }

    fn assert_alternating(turns: &[ConversationTurn]) {
        for pair in turns.windows(2) {
            assert_ne!(pair[0].role, pair[1].role, "consecutive roles in {:?}", turns);
        }
    }

    #[test]
    fn drops_empty_fallback_and_command_turns() {
        let raw = vec![
            turn(1, Role::User, "   "),
            turn(2, Role::User, "/memory show"),
            turn(3, Role::Assistant, "brrr... I didn't quite get that. Try asking in another way?"),
            turn(4, Role::User, "What Can You Do?"),
            turn(5, Role::User, "I'm building a chess engine"),
            turn(6, Role::Assistant, "Nice, what language?"),
        ];
        let clean = sanitize_history(&raw);
        assert_eq!(
            contents(&clean),
            vec!["I'm building a chess engine", "Nice, what language?"]
        );
    }

    #[test]
    fn fallback_marker_only_filters_assistant_turns() {
        let raw = vec![turn(1, Role::User, "you said something went wrong earlier")];
        assert_eq!(sanitize_history(&raw).len(), 1);
    }

    #[test]
    fn same_role_runs_keep_the_latest() {
        let raw = vec![
            turn(1, Role::User, "first"),
            turn(2, Role::User, "second"),
            turn(3, Role::Assistant, "reply"),
            turn(4, Role::Assistant, "reply again"),
        ];
        let clean = sanitize_history(&raw);
        assert_eq!(contents(&clean), vec!["second", "reply again"]);
    }

    #[test]
    fn keeps_only_the_last_two_exchanges() {
        let raw: Vec<_> = (0..10)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                turn(i, role, &format!("message {}", i))
            })
            .collect();
        let clean = sanitize_history(&raw);
        assert_eq!(
            contents(&clean),
            vec!["message 6", "message 7", "message 8", "message 9"]
        );
    }

    #[test]
    fn output_is_bounded_and_alternating_for_mixed_inputs() {
        let roles = [Role::User, Role::Assistant];
        let texts = [
            "hello",
            "",
            "/help",
            "sure thing",
            "brrr... something went wrong! Try again?",
            "LIST COMMANDS please",
            "working on a parser",
        ];
        for seed in 0..64usize {
            let raw: Vec<_> = (0..12)
                .map(|i| {
                    let role = roles[(seed >> (i % 6)) & 1];
                    let text = texts[(seed + i * 3) % texts.len()];
                    turn(i as i64, role, text)
                })
                .collect();
            let clean = sanitize_history(&raw);
            assert!(clean.len() <= MAX_CONTEXT_TURNS);
            assert_alternating(&clean);
            assert!(clean.iter().all(|t| !t.content.starts_with(COMMAND_PREFIX)));
        }
    }

    #[test]
    fn empty_input_gives_empty_output() {
        assert!(sanitize_history(&[]).is_empty());
    }
}
