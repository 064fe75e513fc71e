//! Professional session controller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{SessionError, SessionResult};
use crate::db::CaseQuery;
use crate::lifecycle::CaseManager;
use crate::models::{Case, CaseStatus};
use crate::store::{Listener, Subscription};

/// Action a professional can take on a case in their view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfessionalAction {
    Accept,
    Reject,
    Release,
}

/// Whether `case` belongs in the queue shown to `professional_id`.
///
/// Cases the professional rejected are hidden; otherwise pending cases and
/// cases assigned to them are shown.
pub fn is_visible_to(case: &Case, professional_id: &str) -> bool {
    if case.was_rejected_by(professional_id) {
        return false;
    }
    case.status == CaseStatus::Pending || case.is_assigned_to(professional_id)
}

/// Filter a full collection snapshot down to one professional's view.
pub fn visible_cases(cases: &[Case], professional_id: &str) -> Vec<Case> {
    cases
        .iter()
        .filter(|case| is_visible_to(case, professional_id))
        .cloned()
        .collect()
}

/// Actions offered to `professional_id` for `case`.
pub fn actions_for(case: &Case, professional_id: &str) -> Vec<ProfessionalAction> {
    if !is_visible_to(case, professional_id) {
        return Vec::new();
    }
    match case.status {
        CaseStatus::Pending => vec![ProfessionalAction::Accept, ProfessionalAction::Reject],
        CaseStatus::Accepted if case.is_assigned_to(professional_id) => {
            vec![ProfessionalAction::Release]
        }
        _ => Vec::new(),
    }
}

/// Controller for one signed-in professional.
pub struct ProfessionalSession {
    professional_id: String,
    manager: Arc<CaseManager>,
    cases: Arc<Mutex<Vec<Case>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl ProfessionalSession {
    /// Subscribe to the case collection; `listener` gets the filtered view
    /// after every snapshot, starting with the current one.
    pub fn start(
        professional_id: impl Into<String>,
        manager: Arc<CaseManager>,
        listener: Listener<Vec<Case>>,
    ) -> SessionResult<Self> {
        let professional_id = professional_id.into();
        let cases = Arc::new(Mutex::new(Vec::new()));

        let viewer = professional_id.clone();
        let view = Arc::downgrade(&cases);
        let on_snapshot: Listener<Vec<Case>> = Arc::new(move |snapshot: &Vec<Case>| {
            let Some(view) = view.upgrade() else {
                return;
            };
            let visible = visible_cases(snapshot, &viewer);
            *view.lock().unwrap_or_else(PoisonError::into_inner) = visible.clone();
            listener(&visible);
        });

        let subscription = manager
            .store()
            .subscribe_query(CaseQuery::all(), on_snapshot)?;
        tracing::debug!(professional_id = %professional_id, "professional session started");

        Ok(Self {
            professional_id,
            manager,
            cases,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    fn cases_guard(&self) -> MutexGuard<'_, Vec<Case>> {
        self.cases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current filtered view, newest first.
    pub fn cases(&self) -> Vec<Case> {
        self.cases_guard().clone()
    }

    /// Actions offered for a case in the current view.
    pub fn actions(&self, case_id: &str) -> Vec<ProfessionalAction> {
        self.cases_guard()
            .iter()
            .find(|case| case.case_id == case_id)
            .map(|case| actions_for(case, &self.professional_id))
            .unwrap_or_default()
    }

    fn require_action(&self, case_id: &str, action: ProfessionalAction) -> SessionResult<()> {
        if self.actions(case_id).contains(&action) {
            Ok(())
        } else {
            Err(SessionError::ActionNotOffered {
                case_id: case_id.to_string(),
                action,
            })
        }
    }

    pub fn accept(&self, case_id: &str) -> SessionResult<()> {
        self.require_action(case_id, ProfessionalAction::Accept)?;
        self.manager.accept(case_id, &self.professional_id)?;
        Ok(())
    }

    pub fn reject(&self, case_id: &str) -> SessionResult<()> {
        self.require_action(case_id, ProfessionalAction::Reject)?;
        self.manager.reject(case_id, &self.professional_id)?;
        Ok(())
    }

    pub fn release(&self, case_id: &str) -> SessionResult<()> {
        self.require_action(case_id, ProfessionalAction::Release)?;
        self.manager.release(case_id, &self.professional_id)?;
        Ok(())
    }

    /// Stop receiving snapshots.
    pub fn stop(&self) {
        let previous = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(previous);
    }
}
