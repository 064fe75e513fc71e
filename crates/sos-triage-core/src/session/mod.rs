//! Session controllers for the two actors.
//!
//! Each controller owns its live subscription and derives everything it
//! exposes from the last pushed snapshot.

mod patient;
mod professional;

pub use patient::*;
pub use professional::*;

use thiserror::Error;

use crate::chat::ChatError;
use crate::lifecycle::LifecycleError;
use crate::store::StoreError;

/// Session errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No active case")]
    NoActiveCase,

    #[error("{action:?} is not offered for case {case_id}")]
    ActionNotOffered {
        case_id: String,
        action: ProfessionalAction,
    },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SessionResult<T> = Result<T, SessionError>;
