//! Completion-service layer for the triage chat assistant.
//!
//! This crate defines the contract the core uses to obtain assistant replies
//! (`CompletionService`), the OpenAI-style chat-completions wire codec a host
//! transport can use, and the triage prompt with its clarification format.

pub mod clarification;
pub mod completion;
pub mod prompts;
pub mod wire;

pub use clarification::*;
pub use completion::*;
pub use prompts::*;
pub use wire::*;
