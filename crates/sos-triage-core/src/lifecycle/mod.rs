//! Case record manager: lookup/creation and the status state machine.
//!
//! Guards are evaluated against a fresh read of the case and the change is
//! then issued as a separate field update. The store itself does not enforce
//! the transition table.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use thiserror::Error;

use crate::config::{AcceptPolicy, ReleasePolicy, TriageConfig};
use crate::db::{CaseQuery, CaseUpdate, FieldUpdate};
use crate::models::{Case, CaseEvent, CaseStatus, NewCase, PatientProfile};
use crate::store::{CaseStore, IntakeSource, StoreError};

/// Lifecycle errors.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Cannot {event} case {case_id} while {from}")]
    InvalidTransition {
        case_id: String,
        from: CaseStatus,
        event: &'static str,
    },

    #[error("Case not found: {0}")]
    NotFound(String),

    #[error("Case {case_id} is not assigned to {professional_id}")]
    NotAssignee {
        case_id: String,
        professional_id: String,
    },

    #[error("Case {0} was changed by another writer")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => LifecycleError::NotFound(id),
            StoreError::PreconditionFailed { case_id, .. } => LifecycleError::Conflict(case_id),
            other => LifecycleError::Store(other),
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Issues lifecycle transitions against the case store.
pub struct CaseManager {
    store: Arc<CaseStore>,
    intake: Arc<dyn IntakeSource>,
    config: TriageConfig,
}

impl CaseManager {
    /// Manager reading intake answers from the store itself.
    pub fn new(store: Arc<CaseStore>, config: TriageConfig) -> Self {
        let intake: Arc<dyn IntakeSource> = store.clone();
        Self::with_intake_source(store, intake, config)
    }

    pub fn with_intake_source(
        store: Arc<CaseStore>,
        intake: Arc<dyn IntakeSource>,
        config: TriageConfig,
    ) -> Self {
        Self {
            store,
            intake,
            config,
        }
    }

    pub fn store(&self) -> &Arc<CaseStore> {
        &self.store
    }

    /// The patient's case in a non-terminal status, if any.
    pub fn find_open_case(&self, patient_uid: &str) -> LifecycleResult<Option<Case>> {
        Ok(self.store.find_open_case(patient_uid)?)
    }

    /// Return the patient's open case, creating one from their intake answers
    /// if there is none. Creation may block for the intake retry delays.
    pub fn open_or_create(&self, patient_uid: &str) -> LifecycleResult<Case> {
        if let Some(case) = self.find_open_case(patient_uid)? {
            tracing::debug!(case_id = %case.case_id, patient_uid, "attached to open case");
            return Ok(case);
        }

        let profile = self.fetch_profile(patient_uid);
        match self.store.insert_case(&NewCase::new(patient_uid, profile)) {
            Ok(case) => {
                tracing::info!(case_id = %case.case_id, patient_uid, "case created");
                Ok(case)
            }
            Err(StoreError::OpenCaseExists(_)) => {
                // Lost a creation race; the winner's case is the open one
                tracing::debug!(patient_uid, "open case created concurrently");
                self.find_open_case(patient_uid)?
                    .ok_or_else(|| LifecycleError::NotFound(patient_uid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Harvest the patient's profile, retrying while the answers are not yet
    /// written. Falls back to a blank profile after the last attempt.
    ///
    /// Sleeps on the calling thread between attempts.
    pub fn fetch_profile(&self, patient_uid: &str) -> PatientProfile {
        let attempts = self.config.intake_max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.intake.answers(patient_uid) {
                Ok(Some(answers)) => return answers.harvest(Utc::now().date_naive()),
                Ok(None) => tracing::debug!(patient_uid, attempt, "intake answers not yet available"),
                Err(e) => tracing::warn!(patient_uid, attempt, error = %e, "intake fetch failed"),
            }
            if attempt < attempts {
                thread::sleep(self.config.intake_delay_after(attempt));
            }
        }

        tracing::warn!(patient_uid, attempts, "no intake answers; using blank profile");
        PatientProfile::default()
    }

    /// `InProgress | Pending -> Pending`, refreshing the patient fields from
    /// the latest intake answers in the same write.
    pub fn request_help(&self, case_id: &str) -> LifecycleResult<()> {
        let event = CaseEvent::RequestHelp;
        let case = self.guard(case_id, &event)?;

        let mut update = CaseUpdate::new().status(CaseStatus::Pending);
        match self.intake.answers(&case.patient_uid) {
            Ok(Some(answers)) => {
                update = update.profile(&answers.harvest(Utc::now().date_naive()));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(case_id, error = %e, "keeping stored profile; intake read failed")
            }
        }

        self.store.update_case(case_id, &update)?;
        log_transition(&case, &event, CaseStatus::Pending);
        Ok(())
    }

    /// `Pending -> Accepted` with the professional assigned.
    pub fn accept(&self, case_id: &str, professional_id: &str) -> LifecycleResult<()> {
        let event = CaseEvent::Accept {
            professional_id: professional_id.to_string(),
        };
        let case = self.guard(case_id, &event)?;

        let update = CaseUpdate::new()
            .status(CaseStatus::Accepted)
            .professional_id(FieldUpdate::Set(professional_id.to_string()));
        match self.config.accept_policy {
            AcceptPolicy::LastWriteWins => self.store.update_case(case_id, &update)?,
            AcceptPolicy::RequirePending => {
                self.store
                    .update_case_if_status(case_id, CaseStatus::Pending, &update)?
            }
        }

        log_transition(&case, &event, CaseStatus::Accepted);
        Ok(())
    }

    /// `Pending -> Pending`, recording the professional's rejection.
    pub fn reject(&self, case_id: &str, professional_id: &str) -> LifecycleResult<()> {
        let event = CaseEvent::Reject {
            professional_id: professional_id.to_string(),
        };
        let case = self.guard(case_id, &event)?;

        self.store.append_rejected_by(case_id, professional_id)?;
        log_transition(&case, &event, CaseStatus::Pending);
        Ok(())
    }

    /// `Accepted -> Pending`, removing the assignment.
    pub fn release(&self, case_id: &str, professional_id: &str) -> LifecycleResult<()> {
        let event = CaseEvent::Release {
            professional_id: professional_id.to_string(),
        };
        let case = self.guard(case_id, &event)?;

        if self.config.release_policy == ReleasePolicy::AssigneeOnly
            && !case.is_assigned_to(professional_id)
        {
            return Err(LifecycleError::NotAssignee {
                case_id: case_id.to_string(),
                professional_id: professional_id.to_string(),
            });
        }

        let update = CaseUpdate::new()
            .status(CaseStatus::Pending)
            .professional_id(FieldUpdate::Delete);
        self.store.update_case(case_id, &update)?;
        log_transition(&case, &event, CaseStatus::Pending);
        Ok(())
    }

    /// Any open status `-> Closed`.
    pub fn close(&self, case_id: &str) -> LifecycleResult<()> {
        let event = CaseEvent::Close;
        let case = self.guard(case_id, &event)?;

        self.store
            .update_case(case_id, &CaseUpdate::new().status(CaseStatus::Closed))?;
        log_transition(&case, &event, CaseStatus::Closed);
        Ok(())
    }

    /// Every case the patient has owned, newest first.
    pub fn recent_cases(&self, patient_uid: &str) -> LifecycleResult<Vec<Case>> {
        Ok(self.store.query(&CaseQuery::for_patient(patient_uid))?)
    }

    /// Read the case and check `event` is allowed from its current status.
    fn guard(&self, case_id: &str, event: &CaseEvent) -> LifecycleResult<Case> {
        let case = self.store.require_case(case_id)?;
        if case.status.apply(event).is_none() {
            return Err(LifecycleError::InvalidTransition {
                case_id: case_id.to_string(),
                from: case.status,
                event: event.name(),
            });
        }
        Ok(case)
    }
}

fn log_transition(case: &Case, event: &CaseEvent, to: CaseStatus) {
    tracing::info!(
        case_id = %case.case_id,
        event = event.name(),
        from = %case.status,
        to = %to,
        "case transition"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IntakeAnswers, AILMENT_PROMPT, NAME_PROMPT};
    use crate::store::StoreResult;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Intake source that only has answers from the `ready_on`-th read on.
    struct DelayedIntake {
        reads: AtomicU32,
        ready_on: u32,
    }

    impl IntakeSource for DelayedIntake {
        fn answers(&self, _user_id: &str) -> StoreResult<Option<IntakeAnswers>> {
            let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if read >= self.ready_on {
                Ok(Some([(NAME_PROMPT, "Late Writer")].into_iter().collect()))
            } else {
                Ok(None)
            }
        }
    }

    fn quick_config() -> TriageConfig {
        TriageConfig {
            intake_retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn manager() -> CaseManager {
        let store = Arc::new(CaseStore::open_in_memory().unwrap());
        CaseManager::new(store, quick_config())
    }

    #[test]
    fn test_open_or_create_is_idempotent() {
        let manager = manager();
        let first = manager.open_or_create("patient-1").unwrap();
        let second = manager.open_or_create("patient-1").unwrap();
        assert_eq!(first.case_id, second.case_id);
        assert_eq!(first.status, CaseStatus::InProgress);
    }

    #[test]
    fn test_intake_retry_picks_up_late_answers() {
        let store = Arc::new(CaseStore::open_in_memory().unwrap());
        let intake = Arc::new(DelayedIntake {
            reads: AtomicU32::new(0),
            ready_on: 3,
        });
        let manager = CaseManager::with_intake_source(store, intake.clone(), quick_config());

        let case = manager.open_or_create("patient-1").unwrap();
        assert_eq!(case.patient_name, "Late Writer");
        assert_eq!(intake.reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_intake_retry_blocks_caller() {
        let store = Arc::new(CaseStore::open_in_memory().unwrap());
        let intake = Arc::new(DelayedIntake {
            reads: AtomicU32::new(0),
            ready_on: 10,
        });
        let config = TriageConfig {
            intake_max_attempts: 3,
            intake_retry_delay: Duration::from_millis(25),
            ..Default::default()
        };
        let manager = CaseManager::with_intake_source(store, intake.clone(), config);

        // Two waits between three attempts
        let started = std::time::Instant::now();
        manager.open_or_create("patient-1").unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));

        // Attaching to the existing case does not read intake at all
        manager.open_or_create("patient-1").unwrap();
        assert_eq!(intake.reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_intake_gives_up_with_blank_profile() {
        let store = Arc::new(CaseStore::open_in_memory().unwrap());
        let intake = Arc::new(DelayedIntake {
            reads: AtomicU32::new(0),
            ready_on: 10,
        });
        let manager = CaseManager::with_intake_source(store, intake.clone(), quick_config());

        let case = manager.open_or_create("patient-1").unwrap();
        assert_eq!(case.patient_name, "");
        assert_eq!(case.age, 0);
        assert_eq!(intake.reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_request_help_refreshes_profile() {
        let manager = manager();
        let case = manager.open_or_create("patient-1").unwrap();

        let answers: IntakeAnswers = [(NAME_PROMPT, "Jane Doe"), (AILMENT_PROMPT, "Chest pain")]
            .into_iter()
            .collect();
        manager.store().save_intake_answers("patient-1", &answers).unwrap();
        manager.request_help(&case.case_id).unwrap();

        let stored = manager.store().require_case(&case.case_id).unwrap();
        assert_eq!(stored.status, CaseStatus::Pending);
        assert_eq!(stored.patient_name, "Jane Doe");
        assert_eq!(stored.ailment, "Chest pain");

        // Asking again while already pending is allowed
        manager.request_help(&case.case_id).unwrap();
    }

    #[test]
    fn test_accept_requires_pending() {
        let manager = manager();
        let case = manager.open_or_create("patient-1").unwrap();
        let err = manager.accept(&case.case_id, "doc-a").unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition { from: CaseStatus::InProgress, event: "accept", .. }
        ));
    }

    #[test]
    fn test_require_pending_policy() {
        let store = Arc::new(CaseStore::open_in_memory().unwrap());
        let config = TriageConfig {
            accept_policy: AcceptPolicy::RequirePending,
            ..quick_config()
        };
        let manager = CaseManager::new(store, config);
        let case = manager.open_or_create("patient-1").unwrap();
        manager.request_help(&case.case_id).unwrap();

        manager.accept(&case.case_id, "doc-a").unwrap();
        let stored = manager.store().require_case(&case.case_id).unwrap();
        assert_eq!(stored.professional_id.as_deref(), Some("doc-a"));
    }

    #[test]
    fn test_release_assignee_only() {
        let store = Arc::new(CaseStore::open_in_memory().unwrap());
        let config = TriageConfig {
            release_policy: ReleasePolicy::AssigneeOnly,
            ..quick_config()
        };
        let manager = CaseManager::new(store, config);
        let case = manager.open_or_create("patient-1").unwrap();
        manager.request_help(&case.case_id).unwrap();
        manager.accept(&case.case_id, "doc-a").unwrap();

        assert!(matches!(
            manager.release(&case.case_id, "doc-b"),
            Err(LifecycleError::NotAssignee { .. })
        ));
        manager.release(&case.case_id, "doc-a").unwrap();
    }

    #[test]
    fn test_closed_case_rejects_everything() {
        let manager = manager();
        let case = manager.open_or_create("patient-1").unwrap();
        manager.close(&case.case_id).unwrap();

        assert!(manager.close(&case.case_id).is_err());
        assert!(manager.request_help(&case.case_id).is_err());
        assert!(manager.reject(&case.case_id, "doc-a").is_err());
    }

    #[test]
    fn test_missing_case() {
        let manager = manager();
        assert!(matches!(
            manager.close("nope"),
            Err(LifecycleError::NotFound(id)) if id == "nope"
        ));
    }

    #[test]
    fn test_recent_cases_newest_first() {
        let manager = manager();
        let first = manager.open_or_create("patient-1").unwrap();
        manager.close(&first.case_id).unwrap();
        let second = manager.open_or_create("patient-1").unwrap();

        let recent = manager.recent_cases("patient-1").unwrap();
        let ids: Vec<_> = recent.iter().map(|c| c.case_id.as_str()).collect();
        assert_eq!(ids, vec![second.case_id.as_str(), first.case_id.as_str()]);
    }
}
