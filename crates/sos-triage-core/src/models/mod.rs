//! Domain models for the triage system.

mod case;
mod chat;
mod intake;

pub use case::*;
pub use chat::*;
pub use intake::*;
