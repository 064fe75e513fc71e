//! Completion-service contract.

use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Completion errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompletionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Invalid response format: {0}")]
    InvalidFormat(String),

    #[error("Completion timed out after {0:?}")]
    Timeout(Duration),
}

impl From<serde_json::Error> for CompletionError {
    fn from(e: serde_json::Error) -> Self {
        CompletionError::InvalidFormat(e.to_string())
    }
}

pub type CompletionResult<T> = Result<T, CompletionError>;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A single role-tagged message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Opaque request/response text completion over a conversation history.
///
/// Implementations are expected to fail with a `CompletionError` on network,
/// auth or format problems. Callers do not retry.
pub trait CompletionService: Send + Sync {
    fn complete(&self, history: &[ChatMessage]) -> CompletionResult<String>;
}

/// Run a completion with an optional upper bound on how long the caller waits.
///
/// With a timeout the call runs on a helper thread; if it does not answer in
/// time the caller gets `CompletionError::Timeout` and the late answer is
/// discarded.
///
/// The helper thread is not cancelled on timeout: it stays blocked until the
/// service returns. A transport that can hang must enforce its own deadline,
/// or timed-out calls accumulate one parked thread each.
pub fn complete_with_timeout(
    service: Arc<dyn CompletionService>,
    history: Vec<ChatMessage>,
    timeout: Option<Duration>,
) -> CompletionResult<String> {
    let Some(timeout) = timeout else {
        return service.complete(&history);
    };

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("completion".into())
        .spawn(move || {
            // Receiver may be gone after a timeout.
            let _ = tx.send(service.complete(&history));
        })
        .map_err(|e| CompletionError::Transport(format!("failed to spawn worker: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(CompletionError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(CompletionError::Transport(
            "completion worker exited without a result".into(),
        )),
    }
}

/// Scripted completion service for tests and previews.
///
/// Replies are served in order; once the script is exhausted every call fails.
/// Each call's history is recorded so callers can assert on the request context.
#[derive(Default)]
pub struct MockCompletion {
    script: Mutex<VecDeque<CompletionResult<String>>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    delay: Option<Duration>,
}

impl MockCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply.
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()))
    }

    /// Queue a failure.
    pub fn fail(self, error: CompletionError) -> Self {
        self.push(Err(error))
    }

    /// Sleep before answering every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(self, item: CompletionResult<String>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
        self
    }

    /// Histories received so far, oldest call first.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl CompletionService for MockCompletion {
    fn complete(&self, history: &[ChatMessage]) -> CompletionResult<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(history.to_vec());
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.script
            .lock()
            .map_err(|e| CompletionError::Transport(format!("Lock poisoned: {}", e)))?
            .pop_front()
            .unwrap_or_else(|| Err(CompletionError::Transport("no scripted reply".into())))
    }
}
