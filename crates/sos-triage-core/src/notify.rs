//! Pending-case alerts for professionals.
//!
//! Watches the whole collection and raises an alert whenever a case enters
//! `Pending` from some other status. Delivering the alert is up to the sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::db::CaseQuery;
use crate::models::{Case, CaseStatus};
use crate::store::{CaseStore, Listener, StoreResult, Subscription};

/// Topic professionals' devices subscribe to.
pub const PROFESSIONALS_TOPIC: &str = "professionals";

const ALERT_TITLE: &str = "New Case Pending";
const ALERT_BODY: &str = "A patient is requesting professional help.";

/// A case just entered the professional queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAlert {
    pub case_id: String,
    pub topic: String,
    pub title: String,
    pub body: String,
}

impl PendingAlert {
    pub fn for_case(case_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            topic: PROFESSIONALS_TOPIC.to_string(),
            title: ALERT_TITLE.to_string(),
            body: ALERT_BODY.to_string(),
        }
    }
}

/// Receiver of pending alerts.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, alert: PendingAlert);
}

#[derive(Default)]
struct Tracker {
    primed: bool,
    statuses: HashMap<String, CaseStatus>,
}

impl Tracker {
    /// Record a snapshot and return the cases that just became pending.
    fn observe(&mut self, cases: &[Case]) -> Vec<String> {
        let mut entered = Vec::new();
        for case in cases {
            let previous = self.statuses.insert(case.case_id.clone(), case.status);
            if !self.primed || case.status != CaseStatus::Pending {
                continue;
            }
            // A case first seen already pending went InProgress -> Pending
            // between two snapshots.
            if previous != Some(CaseStatus::Pending) {
                entered.push(case.case_id.clone());
            }
        }
        self.primed = true;
        entered
    }
}

/// Live watcher; alerts stop when dropped.
pub struct PendingNotifier {
    _subscription: Subscription,
}

impl PendingNotifier {
    pub fn start(store: &CaseStore, sink: Arc<dyn NotificationSink>) -> StoreResult<Self> {
        let tracker = Mutex::new(Tracker::default());
        let on_snapshot: Listener<Vec<Case>> = Arc::new(move |cases: &Vec<Case>| {
            let entered = tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .observe(cases);
            for case_id in entered {
                tracing::info!(case_id = %case_id, topic = PROFESSIONALS_TOPIC, "case pending; alerting");
                sink.notify(PendingAlert::for_case(case_id));
            }
        });

        let subscription = store.subscribe_query(CaseQuery::all(), on_snapshot)?;
        Ok(Self {
            _subscription: subscription,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CaseUpdate, FieldUpdate};
    use crate::models::{NewCase, PatientProfile};

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<PendingAlert>>);

    impl NotificationSink for RecordingSink {
        fn notify(&self, alert: PendingAlert) {
            self.0.lock().unwrap().push(alert);
        }
    }

    fn set_status(store: &CaseStore, case_id: &str, status: CaseStatus) {
        store
            .update_case(case_id, &CaseUpdate::new().status(status))
            .unwrap();
    }

    #[test]
    fn test_existing_pending_cases_do_not_alert() {
        let store = CaseStore::open_in_memory().unwrap();
        let case = store
            .insert_case(&NewCase::new("patient-1", PatientProfile::default()))
            .unwrap();
        set_status(&store, &case.case_id, CaseStatus::Pending);

        let sink = Arc::new(RecordingSink::default());
        let _notifier = PendingNotifier::start(&store, sink.clone()).unwrap();
        store.append_rejected_by(&case.case_id, "doc-a").unwrap();

        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_alert_on_entering_pending() {
        let store = CaseStore::open_in_memory().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let _notifier = PendingNotifier::start(&store, sink.clone()).unwrap();

        let case = store
            .insert_case(&NewCase::new("patient-1", PatientProfile::default()))
            .unwrap();
        set_status(&store, &case.case_id, CaseStatus::Pending);
        set_status(&store, &case.case_id, CaseStatus::Pending);

        // Release puts it back in the queue
        let accept = CaseUpdate::new()
            .status(CaseStatus::Accepted)
            .professional_id(FieldUpdate::Set("doc-a".into()));
        store.update_case(&case.case_id, &accept).unwrap();
        let release = CaseUpdate::new()
            .status(CaseStatus::Pending)
            .professional_id(FieldUpdate::Delete);
        store.update_case(&case.case_id, &release).unwrap();

        let alerts = sink.0.lock().unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0], PendingAlert::for_case(case.case_id.clone()));
        assert_eq!(alerts[0].topic, "professionals");
    }
}
