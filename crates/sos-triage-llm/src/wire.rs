//! Chat-completions wire format.
//!
//! Hosts own the HTTP transport; this module builds request bodies and
//! decodes response bodies so every platform parses replies the same way.

use serde::{Deserialize, Serialize};

use crate::completion::{ChatMessage, CompletionError, CompletionResult};
use crate::prompts::with_system_prompt;

/// Request body for a chat-completions call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ChatCompletionRequest {
    pub fn to_json(&self) -> CompletionResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Build a request for `history`, with the triage system prompt prepended.
pub fn build_chat_request(history: &[ChatMessage], model: &str) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.to_string(),
        messages: with_system_prompt(history),
        temperature: None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResponseBody {
    Completion { choices: Vec<Choice> },
    Failure { error: ApiErrorBody },
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Extract the assistant text from a chat-completions response body.
///
/// The first choice's content is returned trimmed. An `error` object becomes
/// `CompletionError::Api`; anything else is `InvalidFormat`.
pub fn parse_chat_response(body: &str) -> CompletionResult<String> {
    let parsed: ResponseBody = serde_json::from_str(body)?;
    match parsed {
        ResponseBody::Completion { choices } => choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| CompletionError::InvalidFormat("response has no message content".into())),
        ResponseBody::Failure { error } => {
            tracing::warn!(message = %error.message, "completion API returned an error");
            Err(CompletionError::Api(error.message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let request = build_chat_request(&[ChatMessage::user("I feel dizzy")], "gpt-4o-mini");
        let json: serde_json::Value = serde_json::from_str(&request.to_json().unwrap()).unwrap();

        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "I feel dizzy");
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_parse_success_trims() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"  Try resting \n"}}]}"#;
        assert_eq!(parse_chat_response(body).unwrap(), "Try resting");
    }

    #[test]
    fn test_parse_api_error() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        assert_eq!(
            parse_chat_response(body),
            Err(CompletionError::Api("Incorrect API key provided".into()))
        );
    }

    #[test]
    fn test_parse_empty_choices() {
        let body = r#"{"choices":[]}"#;
        assert!(matches!(
            parse_chat_response(body),
            Err(CompletionError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_chat_response("<html>bad gateway</html>"),
            Err(CompletionError::InvalidFormat(_))
        ));
    }
}
