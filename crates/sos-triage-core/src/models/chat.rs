//! Chat log lines.

use serde::{Deserialize, Serialize};
use sos_triage_llm::ChatMessage;

/// Prefix older clients put in front of patient lines.
pub const LEGACY_USER_PREFIX: &str = "User:";
/// Prefix older clients put in front of assistant lines.
pub const LEGACY_ASSISTANT_PREFIX: &str = "GPT:";

/// Who wrote a chat line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Patient input (typed, transcribed, or derived from an image)
    User,
    /// Completion-service output
    Assistant,
}

/// One entry in a case's chat log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatLine {
    pub role: ChatRole,
    pub text: String,
}

impl ChatLine {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            text: text.into(),
        }
    }

    /// Parse a prefixed string line. Lines without a known prefix are
    /// attributed to the patient.
    pub fn from_legacy(line: &str) -> Self {
        if let Some(rest) = line.strip_prefix(LEGACY_ASSISTANT_PREFIX) {
            Self::assistant(rest.trim_start())
        } else if let Some(rest) = line.strip_prefix(LEGACY_USER_PREFIX) {
            Self::user(rest.trim_start())
        } else {
            Self::user(line)
        }
    }

    /// Render as a prefixed display string (`"User: ..."` / `"GPT: ..."`).
    pub fn to_legacy(&self) -> String {
        let prefix = match self.role {
            ChatRole::User => LEGACY_USER_PREFIX,
            ChatRole::Assistant => LEGACY_ASSISTANT_PREFIX,
        };
        format!("{} {}", prefix, self.text)
    }

    /// Neutral completion-request message for this line.
    pub fn to_message(&self) -> ChatMessage {
        match self.role {
            ChatRole::User => ChatMessage::user(self.text.clone()),
            ChatRole::Assistant => ChatMessage::assistant(self.text.clone()),
        }
    }
}

/// Array element as found in storage: structured, or a legacy prefixed string.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredChatLine {
    Structured(ChatLine),
    Legacy(String),
}

impl From<StoredChatLine> for ChatLine {
    fn from(stored: StoredChatLine) -> Self {
        match stored {
            StoredChatLine::Structured(line) => line,
            StoredChatLine::Legacy(text) => ChatLine::from_legacy(&text),
        }
    }
}

/// Decode a stored chat-history JSON array.
pub fn decode_chat_history(json: &str) -> serde_json::Result<Vec<ChatLine>> {
    let stored: Vec<StoredChatLine> = serde_json::from_str(json)?;
    Ok(stored.into_iter().map(ChatLine::from).collect())
}
