//! Case lifecycle integration tests: patient and professional sessions
//! sharing one store.

use std::sync::{Arc, Mutex};
use std::thread;

use sos_triage_core::chat::ChatProtocol;
use sos_triage_core::config::{AcceptPolicy, TriageConfig};
use sos_triage_core::lifecycle::{CaseManager, LifecycleError};
use sos_triage_core::models::{
    Case, CaseStatus, IntakeAnswers, AILMENT_PROMPT, ALLERGIES_PROMPT, BIRTH_DATE_PROMPT,
    BLOOD_TYPE_PROMPT, NAME_PROMPT,
};
use sos_triage_core::session::{
    PatientSession, PatientView, ProfessionalAction, ProfessionalSession, SessionError,
};
use sos_triage_core::store::{CaseStore, Listener};
use sos_triage_llm::MockCompletion;

struct Fixture {
    store: Arc<CaseStore>,
    manager: Arc<CaseManager>,
    chat: Arc<ChatProtocol>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(TriageConfig {
            intake_max_attempts: 1,
            ..Default::default()
        })
    }

    fn with_config(config: TriageConfig) -> Self {
        let store = Arc::new(CaseStore::open_in_memory().unwrap());
        let manager = Arc::new(CaseManager::new(store.clone(), config));
        let chat = Arc::new(ChatProtocol::new(
            store.clone(),
            Arc::new(MockCompletion::new()),
            None,
        ));
        Self {
            store,
            manager,
            chat,
        }
    }

    fn patient(&self, uid: &str) -> PatientSession {
        let listener: Listener<PatientView> = Arc::new(|_: &PatientView| {});
        let session = PatientSession::new(uid, self.manager.clone(), self.chat.clone(), listener);
        session.start().unwrap();
        session
    }

    /// Professional session plus every filtered view it was pushed.
    fn professional(&self, id: &str) -> (ProfessionalSession, Arc<Mutex<Vec<Vec<Case>>>>) {
        let views = Arc::new(Mutex::new(Vec::new()));
        let sink = views.clone();
        let listener: Listener<Vec<Case>> =
            Arc::new(move |cases: &Vec<Case>| sink.lock().unwrap().push(cases.clone()));
        let session = ProfessionalSession::start(id, self.manager.clone(), listener).unwrap();
        (session, views)
    }

    fn case(&self, case_id: &str) -> Case {
        self.store.require_case(case_id).unwrap()
    }
}

fn ids(cases: &[Case]) -> Vec<&str> {
    cases.iter().map(|c| c.case_id.as_str()).collect()
}

#[test]
fn test_new_patient_gets_case_from_intake() {
    let fx = Fixture::new();
    let answers: IntakeAnswers = [
        (NAME_PROMPT, "Jane Doe"),
        (BIRTH_DATE_PROMPT, "1990-01-01"),
        (BLOOD_TYPE_PROMPT, "O+"),
        (ALLERGIES_PROMPT, "Penicillin"),
        (AILMENT_PROMPT, "Headache"),
    ]
    .into_iter()
    .collect();
    fx.store.save_intake_answers("patient-1", &answers).unwrap();

    let patient = fx.patient("patient-1");
    let view = patient.view();
    let case = view.case.unwrap();

    assert_eq!(case.status, CaseStatus::InProgress);
    assert_eq!(case.patient_name, "Jane Doe");
    assert!(case.chat_history.is_empty());
    assert!(case.age >= 30);
    assert!(case.medical_history.contains("Blood type: O+"));
    assert!(case.medical_history.contains("Allergies: Penicillin"));
    assert_eq!(case.ailment, "Headache");
    assert!(view.has_active_case);
    assert!(!view.requesting_help);
}

#[test]
fn test_reopening_session_reattaches() {
    let fx = Fixture::new();
    let first = fx.patient("patient-1");
    let second = fx.patient("patient-1");
    assert_eq!(first.case_id(), second.case_id());
    assert_eq!(fx.manager.recent_cases("patient-1").unwrap().len(), 1);
}

#[test]
fn test_request_help_and_accept_hides_case_from_others() {
    let fx = Fixture::new();
    let patient = fx.patient("patient-1");
    let case_id = patient.case_id().unwrap();
    let (doc_a, _) = fx.professional("A");
    let (doc_b, _) = fx.professional("B");

    // Not yet queued
    assert!(doc_a.cases().is_empty());

    patient.request_help().unwrap();
    assert_eq!(fx.case(&case_id).status, CaseStatus::Pending);
    assert!(patient.view().requesting_help);
    assert!(patient.view().can_request_help);
    assert_eq!(ids(&doc_a.cases()), vec![case_id.as_str()]);
    assert_eq!(
        doc_a.actions(&case_id),
        vec![ProfessionalAction::Accept, ProfessionalAction::Reject]
    );

    doc_a.accept(&case_id).unwrap();
    let case = fx.case(&case_id);
    assert_eq!(case.status, CaseStatus::Accepted);
    assert_eq!(case.professional_id.as_deref(), Some("A"));

    assert!(doc_b.cases().is_empty());
    assert_eq!(ids(&doc_a.cases()), vec![case_id.as_str()]);
    assert_eq!(doc_a.actions(&case_id), vec![ProfessionalAction::Release]);
    assert!(patient.view().professional_assigned);
}

#[test]
fn test_release_returns_case_to_queue() {
    let fx = Fixture::new();
    let patient = fx.patient("patient-1");
    let case_id = patient.case_id().unwrap();
    let (doc_a, _) = fx.professional("A");
    let (doc_b, _) = fx.professional("B");

    patient.request_help().unwrap();
    doc_a.accept(&case_id).unwrap();
    assert!(doc_b.cases().is_empty());

    doc_a.release(&case_id).unwrap();

    let case = fx.case(&case_id);
    assert_eq!(case.status, CaseStatus::Pending);
    assert!(case.professional_id.is_none());
    let json = serde_json::to_value(&case).unwrap();
    assert!(json["professional_id"].is_null());

    assert_eq!(ids(&doc_b.cases()), vec![case_id.as_str()]);
    assert!(patient.view().requesting_help);
}

#[test]
fn test_close_while_accepted_starts_fresh_case() {
    let fx = Fixture::new();
    let patient = fx.patient("patient-1");
    let case_id = patient.case_id().unwrap();
    let (doc_a, _) = fx.professional("A");

    patient.request_help().unwrap();
    doc_a.accept(&case_id).unwrap();

    let fresh = patient.close_case().unwrap();
    assert_eq!(fx.case(&case_id).status, CaseStatus::Closed);
    assert_ne!(fresh.case_id, case_id);
    assert_eq!(fresh.status, CaseStatus::InProgress);
    assert!(patient.view().can_request_help);

    let history = fx.manager.recent_cases("patient-1").unwrap();
    assert_eq!(ids(&history), vec![fresh.case_id.as_str(), case_id.as_str()]);

    // Closed case offers nothing to its former assignee
    assert!(doc_a.actions(&case_id).is_empty());
}

#[test]
fn test_rejection_hides_case_for_good() {
    let fx = Fixture::new();
    let patient = fx.patient("patient-1");
    let case_id = patient.case_id().unwrap();
    let (doc_a, _) = fx.professional("A");
    let (doc_b, b_views) = fx.professional("B");

    patient.request_help().unwrap();
    doc_b.reject(&case_id).unwrap();
    let seen_before = b_views.lock().unwrap().len();

    // Churn the case through more status cycles
    doc_a.accept(&case_id).unwrap();
    doc_a.release(&case_id).unwrap();
    patient.request_help().unwrap();
    doc_b.reject(&case_id).unwrap_err();

    let views = b_views.lock().unwrap();
    assert!(views.len() > seen_before);
    for view in &views[seen_before - 1..] {
        assert!(!ids(view).contains(&case_id.as_str()));
    }
    assert_eq!(fx.case(&case_id).rejected_by, vec!["B".to_string()]);
}

#[test]
fn test_actions_not_offered_are_refused() {
    let fx = Fixture::new();
    let patient = fx.patient("patient-1");
    let case_id = patient.case_id().unwrap();
    let (doc_a, _) = fx.professional("A");

    // InProgress cases are not in the queue
    assert!(matches!(
        doc_a.accept(&case_id),
        Err(SessionError::ActionNotOffered { action: ProfessionalAction::Accept, .. })
    ));

    patient.request_help().unwrap();
    assert!(matches!(
        doc_a.release(&case_id),
        Err(SessionError::ActionNotOffered { .. })
    ));
}

#[test]
fn test_any_professional_may_release_through_manager() {
    let fx = Fixture::new();
    let case = fx.manager.open_or_create("patient-1").unwrap();
    fx.manager.request_help(&case.case_id).unwrap();
    fx.manager.accept(&case.case_id, "A").unwrap();

    fx.manager.release(&case.case_id, "B").unwrap();
    assert!(fx.case(&case.case_id).professional_id.is_none());
}

#[test]
fn test_concurrent_accepts_last_write_wins() {
    let fx = Fixture::new();
    let case = fx.manager.open_or_create("patient-1").unwrap();
    fx.manager.request_help(&case.case_id).unwrap();

    let handles: Vec<_> = ["A", "B"]
        .into_iter()
        .map(|pid| {
            let manager = fx.manager.clone();
            let case_id = case.case_id.clone();
            thread::spawn(move || manager.accept(&case_id, pid))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(results.iter().any(|r| r.is_ok()));
    let stored = fx.case(&case.case_id);
    assert_eq!(stored.status, CaseStatus::Accepted);
    assert!(matches!(stored.professional_id.as_deref(), Some("A") | Some("B")));
}

#[test]
fn test_concurrent_accepts_require_pending() {
    let fx = Fixture::with_config(TriageConfig {
        intake_max_attempts: 1,
        accept_policy: AcceptPolicy::RequirePending,
        ..Default::default()
    });
    let case = fx.manager.open_or_create("patient-1").unwrap();
    fx.manager.request_help(&case.case_id).unwrap();

    let handles: Vec<_> = ["A", "B", "C", "D"]
        .into_iter()
        .map(|pid| {
            let manager = fx.manager.clone();
            let case_id = case.case_id.clone();
            thread::spawn(move || (pid, manager.accept(&case_id, pid)))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<&str> = results
        .iter()
        .filter(|(_, r)| r.is_ok())
        .map(|(pid, _)| *pid)
        .collect();
    assert_eq!(winners.len(), 1);
    for (_, result) in &results {
        if let Err(e) = result {
            assert!(matches!(
                e,
                LifecycleError::Conflict(_) | LifecycleError::InvalidTransition { .. }
            ));
        }
    }
    assert_eq!(
        fx.case(&case.case_id).professional_id.as_deref(),
        Some(winners[0])
    );
}

#[test]
fn test_concurrent_creation_yields_one_open_case() {
    let fx = Fixture::new();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = fx.manager.clone();
            thread::spawn(move || manager.open_or_create("patient-1").unwrap().case_id)
        })
        .collect();
    let case_ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(case_ids.iter().all(|id| *id == case_ids[0]));
    assert_eq!(fx.manager.recent_cases("patient-1").unwrap().len(), 1);
}
