//! SOS Triage Core Library
//!
//! Case lifecycle for an emergency-triage service: patients chat with an
//! assistant, ask for help, and on-call professionals pick cases up from a
//! shared queue.
//!
//! # Architecture
//!
//! ```text
//!   Patient session                          Professional session
//!   (one case document)                      (whole collection, filtered)
//!        │  request-help / close                  │  accept / reject / release
//!        │  send message                          │
//!        ▼                                        ▼
//!   ChatProtocol ──► CaseManager ◄────────────────┘
//!        │               │   guard against last snapshot,
//!        │               │   then one field update
//!        ▼               ▼
//!   ┌─────────────────────────────────┐
//!   │            CaseStore            │──► PendingNotifier ──► sink
//!   │  SQLite + revisioned fan-out    │
//!   └───────────────┬─────────────────┘
//!                   │  snapshot pushed to every subscriber
//!                   ▼
//!        sessions refresh from the snapshot, never from write results
//! ```
//!
//! # Modules
//!
//! - [`db`]: SQLite persistence for cases and intake answers
//! - [`store`]: Thread-safe store with document and query subscriptions
//! - [`models`]: Case record, status state machine, chat lines, intake
//! - [`lifecycle`]: Case lookup/creation and status transitions
//! - [`chat`]: Chat append protocol
//! - [`session`]: Patient and professional session controllers
//! - [`notify`]: Pending-case alerts
//! - [`config`]: Runtime configuration

pub mod chat;
pub mod config;
pub mod db;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use chat::{ChatError, ChatProtocol, SendOutcome};
pub use config::{AcceptPolicy, Backoff, ReleasePolicy, TriageConfig};
pub use db::{CaseQuery, CaseUpdate, Database, FieldUpdate};
pub use lifecycle::{CaseManager, LifecycleError};
pub use models::{Case, CaseEvent, CaseStatus, ChatLine, ChatRole, IntakeAnswers, PatientProfile};
pub use notify::{NotificationSink, PendingAlert, PendingNotifier};
pub use session::{
    PatientSession, PatientView, ProfessionalAction, ProfessionalSession, SessionError,
};
pub use store::{CaseStore, IntakeSource, Listener, StoreError, Subscription};

// UniFFI setup - using proc macros
uniffi::setup_scaffolding!();

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sos_triage_llm::{
    build_chat_request, parse_chat_response, parse_clarification, ChatMessage, Clarification,
    CompletionError, CompletionResult, CompletionService, MessageRole, DEFAULT_MODEL,
};

// =========================================================================
// FFI Error Type
// =========================================================================

#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum TriageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Completion error: {0}")]
    CompletionFailed(String),

    #[error("Callback error: {0}")]
    CallbackError(String),
}

impl From<StoreError> for TriageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => TriageError::NotFound(id),
            StoreError::PreconditionFailed { .. } => TriageError::Conflict(e.to_string()),
            other => TriageError::DatabaseError(other.to_string()),
        }
    }
}

impl From<LifecycleError> for TriageError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::NotFound(id) => TriageError::NotFound(id),
            LifecycleError::InvalidTransition { .. } | LifecycleError::NotAssignee { .. } => {
                TriageError::InvalidTransition(e.to_string())
            }
            LifecycleError::Conflict(_) => TriageError::Conflict(e.to_string()),
            LifecycleError::Store(inner) => inner.into(),
        }
    }
}

impl From<ChatError> for TriageError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::EmptyMessage => TriageError::InvalidInput(e.to_string()),
            ChatError::NotFound(id) => TriageError::NotFound(id),
            ChatError::Store(inner) => inner.into(),
            ChatError::Worker(msg) => TriageError::CompletionFailed(msg),
        }
    }
}

impl From<SessionError> for TriageError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NoActiveCase | SessionError::ActionNotOffered { .. } => {
                TriageError::InvalidTransition(e.to_string())
            }
            SessionError::Lifecycle(inner) => inner.into(),
            SessionError::Chat(inner) => inner.into(),
            SessionError::Store(inner) => inner.into(),
        }
    }
}

impl From<config::ConfigError> for TriageError {
    fn from(e: config::ConfigError) -> Self {
        TriageError::InvalidInput(e.to_string())
    }
}

impl From<CompletionError> for TriageError {
    fn from(e: CompletionError) -> Self {
        TriageError::CompletionFailed(e.to_string())
    }
}

impl From<uniffi::UnexpectedUniFFICallbackError> for TriageError {
    fn from(e: uniffi::UnexpectedUniFFICallbackError) -> Self {
        TriageError::CallbackError(e.reason)
    }
}

impl<T> From<std::sync::PoisonError<T>> for TriageError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        TriageError::DatabaseError(format!("Lock poisoned: {}", e))
    }
}

// =========================================================================
// Foreign Callback Interfaces
// =========================================================================

/// Host-provided completion transport.
///
/// Implementations should apply their own request deadline; a call that
/// outlives `completion_timeout` keeps its worker thread until it returns.
#[uniffi::export(with_foreign)]
pub trait FfiCompletionService: Send + Sync {
    fn complete(&self, history: Vec<FfiChatMessage>) -> Result<String, TriageError>;
}

/// Receives the patient screen state after every case snapshot.
#[uniffi::export(with_foreign)]
pub trait FfiPatientListener: Send + Sync {
    fn on_update(&self, state: FfiPatientState);
}

/// Receives a professional's filtered queue after every snapshot.
#[uniffi::export(with_foreign)]
pub trait FfiProfessionalListener: Send + Sync {
    fn on_cases(&self, cases: Vec<FfiCase>);
}

/// Receives pending-case alerts for delivery.
#[uniffi::export(with_foreign)]
pub trait FfiNotificationSink: Send + Sync {
    fn notify(&self, alert: FfiPendingAlert);
}

struct ForeignCompletion(Arc<dyn FfiCompletionService>);

impl CompletionService for ForeignCompletion {
    fn complete(&self, history: &[ChatMessage]) -> CompletionResult<String> {
        let history = history.iter().cloned().map(FfiChatMessage::from).collect();
        self.0
            .complete(history)
            .map_err(|e| CompletionError::Transport(e.to_string()))
    }
}

struct ForeignSink(Arc<dyn FfiNotificationSink>);

impl NotificationSink for ForeignSink {
    fn notify(&self, alert: PendingAlert) {
        self.0.notify(alert.into());
    }
}

// =========================================================================
// Factory Functions (exported to FFI)
// =========================================================================

/// Install a `tracing` subscriber writing to stderr. `filter` uses
/// `EnvFilter` syntax, e.g. `"sos_triage_core=debug"`. Later calls are no-ops.
#[uniffi::export]
pub fn init_logging(filter: String) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Configuration with every default applied.
#[uniffi::export]
pub fn default_config() -> FfiTriageConfig {
    TriageConfig::default().into()
}

/// Open or create a database at the given path.
#[uniffi::export]
pub fn open_database(
    path: String,
    config: FfiTriageConfig,
    completion: Arc<dyn FfiCompletionService>,
) -> Result<Arc<TriageCore>, TriageError> {
    let config = TriageConfig::from(config);
    config.validate()?;
    let store = CaseStore::open(&path, &config)?;
    Ok(TriageCore::assemble(store, config, completion))
}

/// Create an in-memory database (for testing).
#[uniffi::export]
pub fn open_database_in_memory(
    config: FfiTriageConfig,
    completion: Arc<dyn FfiCompletionService>,
) -> Result<Arc<TriageCore>, TriageError> {
    let config = TriageConfig::from(config);
    config.validate()?;
    let store = CaseStore::open_in_memory()?;
    Ok(TriageCore::assemble(store, config, completion))
}

/// Request body for a chat-completions call over `history`, with the triage
/// system prompt prepended.
#[uniffi::export]
pub fn build_completion_request(
    history: Vec<FfiChatMessage>,
    model: Option<String>,
) -> Result<String, TriageError> {
    let history: Vec<ChatMessage> = history.into_iter().map(ChatMessage::from).collect();
    let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
    Ok(build_chat_request(&history, &model).to_json()?)
}

/// Assistant text from a chat-completions response body.
#[uniffi::export]
pub fn parse_completion_response(body: String) -> Result<String, TriageError> {
    Ok(parse_chat_response(&body)?)
}

/// Clarifying question embedded in an assistant reply, if any.
#[uniffi::export]
pub fn parse_clarification_reply(reply: String) -> Option<FfiClarification> {
    parse_clarification(&reply).map(FfiClarification::from)
}

/// Patient's answer to a clarification, ready to send as a chat message.
#[uniffi::export]
pub fn answer_clarification(
    clarification: FfiClarification,
    selected: Vec<String>,
) -> Option<String> {
    Clarification::from(clarification).answer(&selected)
}

// =========================================================================
// Main API Object
// =========================================================================

/// Host-held context shared by every session.
#[derive(uniffi::Object)]
pub struct TriageCore {
    store: Arc<CaseStore>,
    manager: Arc<CaseManager>,
    chat: Arc<ChatProtocol>,
}

impl TriageCore {
    fn assemble(
        store: CaseStore,
        config: TriageConfig,
        completion: Arc<dyn FfiCompletionService>,
    ) -> Arc<Self> {
        let store = Arc::new(store);
        let completion: Arc<dyn CompletionService> = Arc::new(ForeignCompletion(completion));
        let chat = Arc::new(ChatProtocol::new(
            store.clone(),
            completion,
            config.completion_timeout,
        ));
        let manager = Arc::new(CaseManager::new(store.clone(), config));
        Arc::new(Self {
            store,
            manager,
            chat,
        })
    }
}

#[uniffi::export]
impl TriageCore {
    // =========================================================================
    // Intake
    // =========================================================================

    /// Store the user's questionnaire answers (prompt -> answer).
    pub fn submit_intake(
        &self,
        user_id: String,
        answers: HashMap<String, String>,
    ) -> Result<(), TriageError> {
        let answers: IntakeAnswers = answers.into_iter().collect();
        self.store.save_intake_answers(&user_id, &answers)?;
        Ok(())
    }

    // =========================================================================
    // Case Queries
    // =========================================================================

    pub fn get_case(&self, case_id: String) -> Result<Option<FfiCase>, TriageError> {
        Ok(self.store.get_case(&case_id)?.map(FfiCase::from))
    }

    /// The patient's cases, newest first.
    pub fn recent_cases(&self, patient_uid: String) -> Result<Vec<FfiCase>, TriageError> {
        let cases = self.manager.recent_cases(&patient_uid)?;
        Ok(cases.into_iter().map(FfiCase::from).collect())
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Attach the patient to their open case (creating one if needed).
    ///
    /// Creating a case waits for the intake answers with the configured
    /// retry delays, so call this off the main thread.
    pub fn open_patient_session(
        &self,
        patient_uid: String,
        listener: Arc<dyn FfiPatientListener>,
    ) -> Result<Arc<FfiPatientSession>, TriageError> {
        let on_view: Listener<PatientView> =
            Arc::new(move |view: &PatientView| listener.on_update(view.clone().into()));
        let session = PatientSession::new(
            patient_uid,
            self.manager.clone(),
            self.chat.clone(),
            on_view,
        );
        session.start()?;
        Ok(Arc::new(FfiPatientSession { session }))
    }

    /// Subscribe a professional to their filtered case queue.
    pub fn open_professional_session(
        &self,
        professional_id: String,
        listener: Arc<dyn FfiProfessionalListener>,
    ) -> Result<Arc<FfiProfessionalSession>, TriageError> {
        let on_cases: Listener<Vec<Case>> = Arc::new(move |cases: &Vec<Case>| {
            listener.on_cases(cases.iter().cloned().map(FfiCase::from).collect())
        });
        let session = ProfessionalSession::start(professional_id, self.manager.clone(), on_cases)?;
        Ok(Arc::new(FfiProfessionalSession { session }))
    }

    /// Forward pending-case alerts to `sink` until the watch is stopped.
    pub fn watch_pending(
        &self,
        sink: Arc<dyn FfiNotificationSink>,
    ) -> Result<Arc<FfiPendingWatch>, TriageError> {
        let notifier = PendingNotifier::start(&self.store, Arc::new(ForeignSink(sink)))?;
        Ok(Arc::new(FfiPendingWatch {
            notifier: Mutex::new(Some(notifier)),
        }))
    }
}

/// Patient session handle.
#[derive(uniffi::Object)]
pub struct FfiPatientSession {
    session: PatientSession,
}

#[uniffi::export]
impl FfiPatientSession {
    pub fn state(&self) -> FfiPatientState {
        self.session.view().into()
    }

    pub fn request_help(&self) -> Result<(), TriageError> {
        Ok(self.session.request_help()?)
    }

    /// Close the current case; returns the fresh case the session moved to.
    ///
    /// Blocks like [`TriageCore::open_patient_session`] while the fresh case
    /// is created; call this off the main thread.
    pub fn close_case(&self) -> Result<FfiCase, TriageError> {
        Ok(self.session.close_case()?.into())
    }

    /// Post a message. The assistant reply arrives through the listener.
    pub fn send_message(&self, text: String) -> Result<(), TriageError> {
        self.session.send_message_detached(&text)?;
        Ok(())
    }

    pub fn stop(&self) {
        self.session.stop();
    }
}

/// Professional session handle.
#[derive(uniffi::Object)]
pub struct FfiProfessionalSession {
    session: ProfessionalSession,
}

#[uniffi::export]
impl FfiProfessionalSession {
    pub fn cases(&self) -> Vec<FfiCase> {
        self.session.cases().into_iter().map(FfiCase::from).collect()
    }

    pub fn actions(&self, case_id: String) -> Vec<FfiProfessionalAction> {
        self.session
            .actions(&case_id)
            .into_iter()
            .map(FfiProfessionalAction::from)
            .collect()
    }

    pub fn accept(&self, case_id: String) -> Result<(), TriageError> {
        Ok(self.session.accept(&case_id)?)
    }

    pub fn reject(&self, case_id: String) -> Result<(), TriageError> {
        Ok(self.session.reject(&case_id)?)
    }

    pub fn release(&self, case_id: String) -> Result<(), TriageError> {
        Ok(self.session.release(&case_id)?)
    }

    pub fn stop(&self) {
        self.session.stop();
    }
}

/// Pending-alert watch handle.
#[derive(uniffi::Object)]
pub struct FfiPendingWatch {
    notifier: Mutex<Option<PendingNotifier>>,
}

#[uniffi::export]
impl FfiPendingWatch {
    pub fn stop(&self) -> Result<(), TriageError> {
        let notifier = self.notifier.lock()?.take();
        drop(notifier);
        Ok(())
    }
}

// =========================================================================
// FFI-Safe Types
// =========================================================================

/// FFI-safe configuration. Durations are milliseconds.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiTriageConfig {
    pub intake_max_attempts: u32,
    pub intake_retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub completion_timeout_ms: Option<u64>,
    pub require_pending_accept: bool,
    pub assignee_only_release: bool,
    pub busy_timeout_ms: u64,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl From<TriageConfig> for FfiTriageConfig {
    fn from(config: TriageConfig) -> Self {
        Self {
            intake_max_attempts: config.intake_max_attempts,
            intake_retry_delay_ms: millis(config.intake_retry_delay),
            exponential_backoff: config.intake_backoff == Backoff::Exponential,
            completion_timeout_ms: config.completion_timeout.map(millis),
            require_pending_accept: config.accept_policy == AcceptPolicy::RequirePending,
            assignee_only_release: config.release_policy == ReleasePolicy::AssigneeOnly,
            busy_timeout_ms: millis(config.busy_timeout),
        }
    }
}

impl From<FfiTriageConfig> for TriageConfig {
    fn from(config: FfiTriageConfig) -> Self {
        Self {
            intake_max_attempts: config.intake_max_attempts,
            intake_retry_delay: Duration::from_millis(config.intake_retry_delay_ms),
            intake_backoff: if config.exponential_backoff {
                Backoff::Exponential
            } else {
                Backoff::Fixed
            },
            completion_timeout: config.completion_timeout_ms.map(Duration::from_millis),
            accept_policy: if config.require_pending_accept {
                AcceptPolicy::RequirePending
            } else {
                AcceptPolicy::LastWriteWins
            },
            release_policy: if config.assignee_only_release {
                ReleasePolicy::AssigneeOnly
            } else {
                ReleasePolicy::AnyProfessional
            },
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        }
    }
}

/// FFI-safe case.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiCase {
    pub case_id: String,
    pub patient_uid: String,
    pub patient_name: String,
    pub age: u32,
    pub medical_history: String,
    pub ailment: String,
    pub chat_history: Vec<FfiChatLine>,
    pub status: String,
    pub professional_id: Option<String>,
    pub rejected_by: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Case> for FfiCase {
    fn from(case: Case) -> Self {
        Self {
            case_id: case.case_id,
            patient_uid: case.patient_uid,
            patient_name: case.patient_name,
            age: case.age,
            medical_history: case.medical_history,
            ailment: case.ailment,
            chat_history: case.chat_history.into_iter().map(FfiChatLine::from).collect(),
            status: case.status.as_str().to_string(),
            professional_id: case.professional_id,
            rejected_by: case.rejected_by,
            created_at: case.created_at,
            updated_at: case.updated_at,
        }
    }
}

/// FFI-safe chat line. `display` is the prefixed form shown in transcripts.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiChatLine {
    pub from_patient: bool,
    pub text: String,
    pub display: String,
}

impl From<ChatLine> for FfiChatLine {
    fn from(line: ChatLine) -> Self {
        Self {
            from_patient: line.role == ChatRole::User,
            display: line.to_legacy(),
            text: line.text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiMessageRole {
    System,
    User,
    Assistant,
}

/// FFI-safe completion message.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiChatMessage {
    pub role: FfiMessageRole,
    pub content: String,
}

impl From<ChatMessage> for FfiChatMessage {
    fn from(message: ChatMessage) -> Self {
        let role = match message.role {
            MessageRole::System => FfiMessageRole::System,
            MessageRole::User => FfiMessageRole::User,
            MessageRole::Assistant => FfiMessageRole::Assistant,
        };
        Self {
            role,
            content: message.content,
        }
    }
}

impl From<FfiChatMessage> for ChatMessage {
    fn from(message: FfiChatMessage) -> Self {
        match message.role {
            FfiMessageRole::System => ChatMessage::system(message.content),
            FfiMessageRole::User => ChatMessage::user(message.content),
            FfiMessageRole::Assistant => ChatMessage::assistant(message.content),
        }
    }
}

/// FFI-safe patient screen state.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPatientState {
    pub case: Option<FfiCase>,
    pub requesting_help: bool,
    pub has_active_case: bool,
    pub professional_assigned: bool,
    pub can_request_help: bool,
    pub can_close: bool,
}

impl From<PatientView> for FfiPatientState {
    fn from(view: PatientView) -> Self {
        Self {
            case: view.case.map(FfiCase::from),
            requesting_help: view.requesting_help,
            has_active_case: view.has_active_case,
            professional_assigned: view.professional_assigned,
            can_request_help: view.can_request_help,
            can_close: view.can_close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiProfessionalAction {
    Accept,
    Reject,
    Release,
}

impl From<ProfessionalAction> for FfiProfessionalAction {
    fn from(action: ProfessionalAction) -> Self {
        match action {
            ProfessionalAction::Accept => FfiProfessionalAction::Accept,
            ProfessionalAction::Reject => FfiProfessionalAction::Reject,
            ProfessionalAction::Release => FfiProfessionalAction::Release,
        }
    }
}

/// FFI-safe pending alert.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPendingAlert {
    pub case_id: String,
    pub topic: String,
    pub title: String,
    pub body: String,
}

impl From<PendingAlert> for FfiPendingAlert {
    fn from(alert: PendingAlert) -> Self {
        Self {
            case_id: alert.case_id,
            topic: alert.topic,
            title: alert.title,
            body: alert.body,
        }
    }
}

/// FFI-safe clarification question.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiClarification {
    pub question: String,
    pub options: Vec<String>,
}

impl From<Clarification> for FfiClarification {
    fn from(clarification: Clarification) -> Self {
        Self {
            question: clarification.question,
            options: clarification.options,
        }
    }
}

impl From<FfiClarification> for Clarification {
    fn from(clarification: FfiClarification) -> Self {
        Clarification {
            question: clarification.question,
            options: clarification.options,
        }
    }
}
