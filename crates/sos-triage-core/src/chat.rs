//! Chat append protocol.
//!
//! A turn is: append the user's line, re-read the whole log, ask the
//! completion service, append its reply. A failed completion drops the
//! assistant turn without retry.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sos_triage_llm::{complete_with_timeout, ChatMessage, CompletionService};
use thiserror::Error;

use crate::models::ChatLine;
use crate::store::{CaseStore, StoreError};

/// Chat errors.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Case not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Failed to start reply worker: {0}")]
    Worker(String),
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ChatError::NotFound(id),
            other => ChatError::Store(other),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

/// What happened to the assistant half of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Reply appended to the log
    Replied,
    /// Completion failed; no assistant line was written
    ReplyDropped,
}

pub struct ChatProtocol {
    store: Arc<CaseStore>,
    completion: Arc<dyn CompletionService>,
    timeout: Option<Duration>,
}

impl ChatProtocol {
    pub fn new(
        store: Arc<CaseStore>,
        completion: Arc<dyn CompletionService>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            completion,
            timeout,
        }
    }

    /// Full turn: post the user's line, then generate and append the reply.
    pub fn send_message(&self, case_id: &str, text: &str) -> ChatResult<SendOutcome> {
        self.post_user_message(case_id, text)?;
        self.generate_reply(case_id)
    }

    /// Post the user's line now and generate the reply on a worker thread.
    ///
    /// Validation and the user append are reported synchronously; the reply
    /// half is fire-and-forget and its outcome is only visible through the
    /// returned handle and the case's subscribers.
    pub fn send_message_detached(
        self: &Arc<Self>,
        case_id: &str,
        text: &str,
    ) -> ChatResult<JoinHandle<SendOutcome>> {
        self.post_user_message(case_id, text)?;

        let chat = Arc::clone(self);
        let case_id = case_id.to_string();
        thread::Builder::new()
            .name("chat-reply".into())
            .spawn(move || match chat.generate_reply(&case_id) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(case_id = %case_id, error = %e, "reply generation failed");
                    SendOutcome::ReplyDropped
                }
            })
            .map_err(|e| ChatError::Worker(e.to_string()))
    }

    /// Append the user's line. Blank text is rejected before touching the store.
    pub fn post_user_message(&self, case_id: &str, text: &str) -> ChatResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        self.store.append_chat_line(case_id, &ChatLine::user(text))?;
        Ok(())
    }

    /// Ask the completion service about the case's current log and append its
    /// answer.
    pub fn generate_reply(&self, case_id: &str) -> ChatResult<SendOutcome> {
        let history = self.history(case_id)?;

        match complete_with_timeout(self.completion.clone(), history, self.timeout) {
            Ok(reply) => {
                self.store
                    .append_chat_line(case_id, &ChatLine::assistant(reply))?;
                Ok(SendOutcome::Replied)
            }
            Err(e) => {
                tracing::warn!(case_id, error = %e, "completion failed; dropping assistant turn");
                Ok(SendOutcome::ReplyDropped)
            }
        }
    }

    /// The durable chat log as completion messages.
    fn history(&self, case_id: &str) -> ChatResult<Vec<ChatMessage>> {
        let case = self.store.require_case(case_id)?;
        Ok(case.chat_history.iter().map(ChatLine::to_message).collect())
    }
}
