//! Live case store: persistence plus change fan-out.
//!
//! Wraps [`Database`] behind a mutex and pushes a fresh snapshot to every
//! interested subscription after each committed write.

mod subscription;

pub use subscription::{Listener, Subscription};

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::config::TriageConfig;
use crate::db::{CaseQuery, CaseUpdate, Database, DbError};
use crate::models::{Case, CaseStatus, ChatLine, IntakeAnswers, NewCase};
use subscription::{Delivery, Registry};

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(DbError),

    #[error("Case not found: {0}")]
    NotFound(String),

    #[error("Patient {0} already has an open case")]
    OpenCaseExists(String),

    #[error("Case {case_id} is no longer {expected}")]
    PreconditionFailed {
        case_id: String,
        expected: CaseStatus,
    },

    #[error("Store lock poisoned: {0}")]
    LockPoisoned(String),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(id) => StoreError::NotFound(id),
            DbError::OpenCaseExists(uid) => StoreError::OpenCaseExists(uid),
            other => StoreError::Db(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Source of a patient's intake questionnaire answers.
///
/// `Ok(None)` means the answers have not been written yet.
pub trait IntakeSource: Send + Sync {
    fn answers(&self, user_id: &str) -> StoreResult<Option<IntakeAnswers>>;
}

struct StoreInner {
    db: Database,
    revision: u64,
}

/// Thread-safe case store with document and query subscriptions.
pub struct CaseStore {
    inner: Mutex<StoreInner>,
    registry: Arc<Registry>,
}

impl CaseStore {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Mutex::new(StoreInner { db, revision: 0 }),
            registry: Arc::new(Registry::default()),
        }
    }

    /// Open a file-backed store.
    pub fn open<P: AsRef<Path>>(path: P, config: &TriageConfig) -> StoreResult<Self> {
        let db = Database::open(path)?;
        db.set_busy_timeout(config.busy_timeout)?;
        Ok(Self::new(db))
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    /// Number of committed writes so far.
    pub fn revision(&self) -> StoreResult<u64> {
        Ok(self.lock()?.revision)
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    // ========== Reads ==========

    pub fn get_case(&self, case_id: &str) -> StoreResult<Option<Case>> {
        Ok(self.lock()?.db.get_case(case_id)?)
    }

    /// Like [`get_case`](Self::get_case) but a missing case is an error.
    pub fn require_case(&self, case_id: &str) -> StoreResult<Case> {
        self.get_case(case_id)?
            .ok_or_else(|| StoreError::NotFound(case_id.to_string()))
    }

    pub fn find_open_case(&self, patient_uid: &str) -> StoreResult<Option<Case>> {
        Ok(self.lock()?.db.find_open_case(patient_uid)?)
    }

    pub fn query(&self, query: &CaseQuery) -> StoreResult<Vec<Case>> {
        Ok(self.lock()?.db.query_cases(query)?)
    }

    // ========== Writes ==========

    /// Run `op` as one committed write, then fan the change out.
    fn write<R>(
        &self,
        case_id: &str,
        op: impl FnOnce(&Database) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let result = {
            let mut inner = self.lock()?;
            let result = op(&inner.db)?;
            inner.revision += 1;
            result
        };
        self.publish(case_id);
        Ok(result)
    }

    pub fn insert_case(&self, new_case: &NewCase) -> StoreResult<Case> {
        let case = {
            let mut inner = self.lock()?;
            let case = inner.db.insert_case(new_case)?;
            inner.revision += 1;
            case
        };
        self.publish(&case.case_id);
        Ok(case)
    }

    /// Field-level update. Fails with `NotFound` if the case does not exist.
    pub fn update_case(&self, case_id: &str, update: &CaseUpdate) -> StoreResult<()> {
        self.write(case_id, |db| {
            if db.update_case(case_id, update)? {
                Ok(())
            } else {
                Err(StoreError::NotFound(case_id.to_string()))
            }
        })
    }

    /// Field-level update applied only while the case has status `expected`.
    pub fn update_case_if_status(
        &self,
        case_id: &str,
        expected: CaseStatus,
        update: &CaseUpdate,
    ) -> StoreResult<()> {
        self.write(case_id, |db| {
            if db.update_case_if_status(case_id, expected, update)? {
                Ok(())
            } else {
                Err(StoreError::PreconditionFailed {
                    case_id: case_id.to_string(),
                    expected,
                })
            }
        })
    }

    /// Atomically append one line to the chat log.
    pub fn append_chat_line(&self, case_id: &str, line: &ChatLine) -> StoreResult<()> {
        self.write(case_id, |db| {
            if db.append_chat_line(case_id, line)? {
                Ok(())
            } else {
                Err(StoreError::NotFound(case_id.to_string()))
            }
        })
    }

    /// Atomically add a professional to the rejection list.
    pub fn append_rejected_by(&self, case_id: &str, professional_id: &str) -> StoreResult<()> {
        self.write(case_id, |db| {
            if db.append_rejected_by(case_id, professional_id)? {
                Ok(())
            } else {
                Err(StoreError::NotFound(case_id.to_string()))
            }
        })
    }

    /// Store a user's questionnaire answers. Does not notify case subscribers.
    pub fn save_intake_answers(&self, user_id: &str, answers: &IntakeAnswers) -> StoreResult<()> {
        self.lock()?.db.save_intake_answers(user_id, answers)?;
        Ok(())
    }

    // ========== Subscriptions ==========

    /// Push every committed state of one case to `listener`, starting with
    /// the current one.
    pub fn subscribe(&self, case_id: &str, listener: Listener<Case>) -> StoreResult<Subscription> {
        let delivery = Arc::new(Delivery::new(listener));
        let subscription = self.registry.add_document(case_id, delivery.clone());

        let (revision, current) = {
            let inner = self.lock()?;
            (inner.revision, inner.db.get_case(case_id)?)
        };
        let case = current.ok_or_else(|| StoreError::NotFound(case_id.to_string()))?;

        tracing::debug!(case_id, "document subscription started");
        delivery.offer(revision, case);
        Ok(subscription)
    }

    /// Push the full result of `query` to `listener` after every committed
    /// write, starting with the current result.
    pub fn subscribe_query(
        &self,
        query: CaseQuery,
        listener: Listener<Vec<Case>>,
    ) -> StoreResult<Subscription> {
        let delivery = Arc::new(Delivery::new(listener));
        let subscription = self.registry.add_query(query.clone(), delivery.clone());

        let (revision, cases) = {
            let inner = self.lock()?;
            (inner.revision, inner.db.query_cases(&query)?)
        };

        tracing::debug!(?query, "query subscription started");
        delivery.offer(revision, cases);
        Ok(subscription)
    }

    /// Re-read snapshots for everything watching `case_id` and offer them.
    fn publish(&self, case_id: &str) {
        let documents = self.registry.documents_for(case_id);
        let queries = self.registry.queries();
        if documents.is_empty() && queries.is_empty() {
            return;
        }

        let snapshots = match self.read_snapshots(case_id, !documents.is_empty(), &queries) {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::warn!(case_id, error = %e, "skipping change notification");
                return;
            }
        };
        let (revision, document, results) = snapshots;

        if let Some(case) = document {
            for delivery in &documents {
                delivery.offer(revision, case.clone());
            }
        }
        for ((_, delivery), result) in queries.iter().zip(results) {
            match result {
                Ok(cases) => delivery.offer(revision, cases),
                Err(e) => tracing::warn!(error = %e, "skipping query notification"),
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn read_snapshots(
        &self,
        case_id: &str,
        want_document: bool,
        queries: &[(CaseQuery, Arc<Delivery<Vec<Case>>>)],
    ) -> StoreResult<(u64, Option<Case>, Vec<StoreResult<Vec<Case>>>)> {
        let inner = self.lock()?;
        let document = if want_document {
            inner.db.get_case(case_id)?
        } else {
            None
        };
        let results = queries
            .iter()
            .map(|(query, _)| inner.db.query_cases(query).map_err(StoreError::from))
            .collect();
        Ok((inner.revision, document, results))
    }
}

impl IntakeSource for CaseStore {
    fn answers(&self, user_id: &str) -> StoreResult<Option<IntakeAnswers>> {
        Ok(self.lock()?.db.get_intake_answers(user_id)?)
    }
}
