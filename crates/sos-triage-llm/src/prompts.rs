//! Prompts for the triage assistant.

use crate::completion::ChatMessage;

/// Model requested when the host does not pick one.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// System prompt prepended to every triage conversation.
pub const SYSTEM_PROMPT: &str = r#"You are a helpful health assistant supporting patients in an emergency-triage app. For every health-related query, before giving a final assessment, always ask a clarifying question with exactly four multiple-choice options. Return the clarification in JSON format with keys "question" and "options". For example: { "question": "What best describes your symptom?", "options": ["Mild", "Moderate", "Severe", "Other"] }. Once enough is known, give concise first-aid guidance and say clearly when the patient should request a professional. If the query is not health-related, answer normally."#;

/// Prepend the triage system prompt to a conversation history.
pub fn with_system_prompt(history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::system(SYSTEM_PROMPT));
    messages.extend_from_slice(history);
    messages
}
