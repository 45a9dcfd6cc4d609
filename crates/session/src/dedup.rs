use crate::message::{Message, MessageContent, Role};

/// Drops user messages whose content repeats an earlier user message.
///
/// The first occurrence wins and keeps its position. Non-user messages are never
/// dropped, even when their content repeats.
pub fn dedupe_user_turns(mut messages: Vec<Message>) -> Vec<Message> {
    let mut seen: Vec<MessageContent> = Vec::new();
    messages.retain(|message| {
        if message.role != Role::User {
            return true;
        }
        if seen.contains(&message.content) {
            return false;
        }
        seen.push(message.content.clone());
        true
    });
    messages
}
