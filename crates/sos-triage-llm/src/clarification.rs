//! Clarifying-question replies.
//!
//! The triage prompt asks the assistant to answer health queries with a JSON
//! object `{"question": ..., "options": [..4 items..]}` before it commits to
//! an assessment. Replies that are not in that shape are ordinary text.

use serde::{Deserialize, Serialize};

/// Number of options a clarifying question must offer.
pub const CLARIFICATION_OPTION_COUNT: usize = 4;

/// A multiple-choice clarifying question from the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Clarification {
    pub question: String,
    pub options: Vec<String>,
}

impl Clarification {
    /// Compose the patient's reply for the selected options.
    ///
    /// Options not offered by the question are ignored. Returns `None` when
    /// nothing valid was selected.
    pub fn answer(&self, selected: &[String]) -> Option<String> {
        let picked: Vec<&str> = self
            .options
            .iter()
            .filter(|option| selected.contains(option))
            .map(String::as_str)
            .collect();

        if picked.is_empty() {
            return None;
        }
        Some(format!("{} {}", self.question, picked.join(", ")))
    }
}

/// Parse an assistant reply as a clarifying question.
///
/// The JSON object may be surrounded by prose. Returns `None` for plain-text
/// replies and for objects without exactly four non-empty options.
pub fn parse_clarification(reply: &str) -> Option<Clarification> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }

    let clarification: Clarification = serde_json::from_str(&reply[start..=end]).ok()?;
    if clarification.question.trim().is_empty()
        || clarification.options.len() != CLARIFICATION_OPTION_COUNT
        || clarification.options.iter().any(|o| o.trim().is_empty())
    {
        tracing::debug!(
            options = clarification.options.len(),
            "ignoring malformed clarification"
        );
        return None;
    }
    Some(clarification)
}
