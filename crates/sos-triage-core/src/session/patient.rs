//! Patient session controller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use super::{SessionError, SessionResult};
use crate::chat::{ChatProtocol, SendOutcome};
use crate::lifecycle::CaseManager;
use crate::models::{Case, CaseEvent, CaseStatus};
use crate::store::{Listener, Subscription};

/// What the patient screen shows, derived from the last case snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientView {
    pub case: Option<Case>,
    /// Waiting in the professional queue
    pub requesting_help: bool,
    /// Case is in a non-terminal status
    pub has_active_case: bool,
    /// A professional holds the case
    pub professional_assigned: bool,
    pub can_request_help: bool,
    pub can_close: bool,
}

impl PatientView {
    pub fn from_case(case: Option<&Case>) -> Self {
        let Some(case) = case else {
            return Self::default();
        };
        Self {
            case: Some(case.clone()),
            requesting_help: case.status == CaseStatus::Pending,
            has_active_case: case.status.is_open(),
            professional_assigned: case.status == CaseStatus::Accepted,
            can_request_help: case.status.apply(&CaseEvent::RequestHelp).is_some(),
            can_close: case.status.is_open(),
        }
    }
}

#[derive(Default)]
struct PatientState {
    case_id: Option<String>,
    view: PatientView,
    subscription: Option<Subscription>,
}

/// Controller for one signed-in patient.
pub struct PatientSession {
    patient_uid: String,
    manager: Arc<CaseManager>,
    chat: Arc<ChatProtocol>,
    listener: Listener<PatientView>,
    state: Arc<Mutex<PatientState>>,
}

impl PatientSession {
    /// Create a session; nothing is read until [`start`](Self::start).
    pub fn new(
        patient_uid: impl Into<String>,
        manager: Arc<CaseManager>,
        chat: Arc<ChatProtocol>,
        listener: Listener<PatientView>,
    ) -> Self {
        Self {
            patient_uid: patient_uid.into(),
            manager,
            chat,
            listener,
            state: Arc::new(Mutex::new(PatientState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, PatientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach to the patient's open case, creating one if needed, and
    /// subscribe to it.
    pub fn start(&self) -> SessionResult<Case> {
        let case = self.manager.open_or_create(&self.patient_uid)?;
        let case_id = case.case_id.clone();

        let previous = {
            let mut state = self.state();
            state.case_id = Some(case_id.clone());
            state.subscription.take()
        };
        drop(previous);

        let subscription = self
            .manager
            .store()
            .subscribe(&case_id, self.snapshot_listener(case_id.clone()))?;

        let mut state = self.state();
        if state.case_id.as_deref() == Some(case_id.as_str()) {
            state.subscription = Some(subscription);
        }
        tracing::debug!(patient_uid = %self.patient_uid, case_id = %case_id, "patient session attached");
        Ok(case)
    }

    fn snapshot_listener(&self, case_id: String) -> Listener<Case> {
        let state = Arc::downgrade(&self.state);
        let listener = self.listener.clone();
        Arc::new(move |case: &Case| {
            let Some(state) = state.upgrade() else {
                return;
            };
            let view = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.case_id.as_deref() != Some(case_id.as_str()) {
                    return;
                }
                state.view = PatientView::from_case(Some(case));
                state.view.clone()
            };
            listener(&view);
        })
    }

    /// Last derived view.
    pub fn view(&self) -> PatientView {
        self.state().view.clone()
    }

    pub fn case_id(&self) -> Option<String> {
        self.state().case_id.clone()
    }

    fn require_case_id(&self) -> SessionResult<String> {
        self.case_id().ok_or(SessionError::NoActiveCase)
    }

    /// Put the case in the professional queue.
    pub fn request_help(&self) -> SessionResult<()> {
        let case_id = self.require_case_id()?;
        self.manager.request_help(&case_id)?;
        Ok(())
    }

    /// Close the current case and attach to a fresh one.
    pub fn close_case(&self) -> SessionResult<Case> {
        let case_id = self.require_case_id()?;
        self.manager.close(&case_id)?;

        let previous = {
            let mut state = self.state();
            state.case_id = None;
            state.subscription.take()
        };
        drop(previous);

        self.start()
    }

    /// Send a chat message on the current case and wait for the reply.
    pub fn send_message(&self, text: &str) -> SessionResult<SendOutcome> {
        let case_id = self.require_case_id()?;
        Ok(self.chat.send_message(&case_id, text)?)
    }

    /// Send a chat message; the reply is generated on a worker thread.
    pub fn send_message_detached(&self, text: &str) -> SessionResult<JoinHandle<SendOutcome>> {
        let case_id = self.require_case_id()?;
        Ok(self.chat.send_message_detached(&case_id, text)?)
    }

    /// Stop receiving snapshots.
    pub fn stop(&self) {
        let previous = self.state().subscription.take();
        drop(previous);
    }
}
