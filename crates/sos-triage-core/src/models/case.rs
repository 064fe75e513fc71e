//! Case record and its status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::chat::ChatLine;
use super::intake::PatientProfile;

/// Lifecycle status of a case.
///
/// `Resolved` is only ever read, never written: some older documents carry it
/// and it is treated exactly like `Closed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CaseStatus {
    /// Patient is chatting with the assistant
    InProgress,
    /// Patient asked for a professional; waiting in the queue
    Pending,
    /// A professional holds the case
    Accepted,
    /// Finished; kept as history
    Closed,
    /// Legacy synonym of `Closed`
    Resolved,
}

impl CaseStatus {
    /// Statuses that count as an open case.
    pub const OPEN: [CaseStatus; 3] = [
        CaseStatus::InProgress,
        CaseStatus::Pending,
        CaseStatus::Accepted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::InProgress => "InProgress",
            CaseStatus::Pending => "Pending",
            CaseStatus::Accepted => "Accepted",
            CaseStatus::Closed => "Closed",
            CaseStatus::Resolved => "Resolved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseStatus::Closed | CaseStatus::Resolved)
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// Status reached by applying `event`, or `None` if the transition table
    /// has no row for it.
    pub fn apply(&self, event: &CaseEvent) -> Option<CaseStatus> {
        use CaseStatus::*;
        match (self, event) {
            (InProgress | Pending, CaseEvent::RequestHelp) => Some(Pending),
            (Pending, CaseEvent::Accept { .. }) => Some(Accepted),
            (Pending, CaseEvent::Reject { .. }) => Some(Pending),
            (Accepted, CaseEvent::Release { .. }) => Some(Pending),
            (InProgress | Pending | Accepted, CaseEvent::Close) => Some(Closed),
            _ => None,
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised status string.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Unknown case status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for CaseStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InProgress" => Ok(CaseStatus::InProgress),
            "Pending" => Ok(CaseStatus::Pending),
            "Accepted" => Ok(CaseStatus::Accepted),
            "Closed" => Ok(CaseStatus::Closed),
            "Resolved" => Ok(CaseStatus::Resolved),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// An actor-driven event on a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseEvent {
    /// Patient asks for a professional
    RequestHelp,
    /// Professional takes the case
    Accept { professional_id: String },
    /// Professional declines the case
    Reject { professional_id: String },
    /// Professional hands the case back to the queue
    Release { professional_id: String },
    /// Patient closes the case
    Close,
}

impl CaseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CaseEvent::RequestHelp => "request-help",
            CaseEvent::Accept { .. } => "accept",
            CaseEvent::Reject { .. } => "reject",
            CaseEvent::Release { .. } => "release",
            CaseEvent::Close => "close",
        }
    }
}

/// Whether a committed status change `prev -> next` is allowed by the
/// transition table. Unchanged status is always allowed.
pub fn is_legal_transition(prev: CaseStatus, next: CaseStatus) -> bool {
    if prev == next {
        return true;
    }
    let anyone = String::new();
    [
        CaseEvent::RequestHelp,
        CaseEvent::Accept { professional_id: anyone.clone() },
        CaseEvent::Reject { professional_id: anyone.clone() },
        CaseEvent::Release { professional_id: anyone },
        CaseEvent::Close,
    ]
    .iter()
    .any(|event| prev.apply(event) == Some(next))
}

/// A triage case record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Case {
    /// Store-assigned ID
    pub case_id: String,
    /// Owning patient's user ID
    pub patient_uid: String,
    /// Patient display name
    pub patient_name: String,
    /// Patient age in years
    pub age: u32,
    /// Free-text medical history
    pub medical_history: String,
    /// Current ailment reported in the intake questionnaire
    pub ailment: String,
    /// Append-only chat log, oldest first
    pub chat_history: Vec<ChatLine>,
    /// Lifecycle status
    pub status: CaseStatus,
    /// Assigned professional; present only while `Accepted`
    pub professional_id: Option<String>,
    /// Professionals who declined the case
    pub rejected_by: Vec<String>,
    /// Creation timestamp (store-assigned)
    pub created_at: String,
    /// Last update timestamp
    pub updated_at: String,
}

impl Case {
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn is_assigned_to(&self, professional_id: &str) -> bool {
        self.professional_id.as_deref() == Some(professional_id)
    }

    pub fn was_rejected_by(&self, professional_id: &str) -> bool {
        self.rejected_by.iter().any(|p| p == professional_id)
    }
}

/// Fields supplied when inserting a case. Identity, status and timestamps are
/// assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCase {
    pub patient_uid: String,
    pub profile: PatientProfile,
}

impl NewCase {
    pub fn new(patient_uid: impl Into<String>, profile: PatientProfile) -> Self {
        Self {
            patient_uid: patient_uid.into(),
            profile,
        }
    }
}
