//! Case database operations.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, ErrorCode, OptionalExtension, Row};

use super::{now_timestamp, Database, DbError, DbResult};
use crate::models::{decode_chat_history, Case, CaseStatus, ChatLine, NewCase, PatientProfile};

const CASE_COLUMNS: &str = "case_id, patient_uid, patient_name, age, medical_history, ailment, \
                            chat_history, status, professional_id, rejected_by, created_at, updated_at";

/// Update for a field that may be removed entirely.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FieldUpdate<T> {
    /// Leave the stored value alone
    #[default]
    Keep,
    /// Overwrite the stored value
    Set(T),
    /// Remove the field (stored as NULL, read back as absent)
    Delete,
}

/// Field-level partial update of a case. Unset fields are left untouched.
///
/// Array fields are absent; they only change through the
/// append primitives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaseUpdate {
    pub patient_name: Option<String>,
    pub age: Option<u32>,
    pub medical_history: Option<String>,
    pub ailment: Option<String>,
    pub status: Option<CaseStatus>,
    pub professional_id: FieldUpdate<String>,
}

impl CaseUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: CaseStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn professional_id(mut self, update: FieldUpdate<String>) -> Self {
        self.professional_id = update;
        self
    }

    /// Overwrite every patient-derived field from `profile`.
    pub fn profile(mut self, profile: &PatientProfile) -> Self {
        self.patient_name = Some(profile.name.clone());
        self.age = Some(profile.age);
        self.medical_history = Some(profile.medical_history.clone());
        self.ailment = Some(profile.ailment.clone());
        self
    }

    fn assignments(&self) -> Vec<(&'static str, Value)> {
        let mut sets = Vec::new();
        if let Some(name) = &self.patient_name {
            sets.push(("patient_name", Value::Text(name.clone())));
        }
        if let Some(age) = self.age {
            sets.push(("age", Value::Integer(i64::from(age))));
        }
        if let Some(history) = &self.medical_history {
            sets.push(("medical_history", Value::Text(history.clone())));
        }
        if let Some(ailment) = &self.ailment {
            sets.push(("ailment", Value::Text(ailment.clone())));
        }
        if let Some(status) = self.status {
            sets.push(("status", Value::Text(status.as_str().to_string())));
        }
        match &self.professional_id {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(id) => sets.push(("professional_id", Value::Text(id.clone()))),
            FieldUpdate::Delete => sets.push(("professional_id", Value::Null)),
        }
        sets
    }
}

/// Filter predicates for a case query. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaseQuery {
    pub patient_uid: Option<String>,
    pub statuses: Option<Vec<CaseStatus>>,
}

impl CaseQuery {
    /// Every case in the collection.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_patient(patient_uid: impl Into<String>) -> Self {
        Self {
            patient_uid: Some(patient_uid.into()),
            statuses: None,
        }
    }

    pub fn with_statuses(mut self, statuses: &[CaseStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }
}

impl Database {
    /// Insert a new case with status `InProgress` and an empty chat log.
    ///
    /// The ID and creation timestamp are assigned here. Fails with
    /// `DbError::OpenCaseExists` if the patient already has an open case.
    pub fn insert_case(&self, new_case: &NewCase) -> DbResult<Case> {
        let case_id = uuid::Uuid::new_v4().to_string();
        let now = now_timestamp();
        let profile = &new_case.profile;

        let result = self.conn.execute(
            r#"
            INSERT INTO cases (
                case_id, patient_uid, patient_name, age, medical_history, ailment,
                chat_history, status, professional_id, rejected_by, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, '[]', ?7, NULL, '[]', ?8, ?8)
            "#,
            params![
                case_id,
                new_case.patient_uid,
                profile.name,
                profile.age,
                profile.medical_history,
                profile.ailment,
                CaseStatus::InProgress.as_str(),
                now,
            ],
        );

        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(DbError::OpenCaseExists(new_case.patient_uid.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        self.get_case(&case_id)?
            .ok_or_else(|| DbError::NotFound(case_id))
    }

    /// Get a case by ID.
    pub fn get_case(&self, case_id: &str) -> DbResult<Option<Case>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM cases WHERE case_id = ?", CASE_COLUMNS),
                [case_id],
                read_case_row,
            )
            .optional()?
            .map(Case::try_from)
            .transpose()
    }

    /// Apply a field-level update. Returns false if the case does not exist.
    pub fn update_case(&self, case_id: &str, update: &CaseUpdate) -> DbResult<bool> {
        self.execute_update(case_id, update, None)
    }

    /// Apply a field-level update only if the case currently has status
    /// `expected`. Check and write happen in one transaction.
    ///
    /// Returns `Ok(false)` when the precondition fails and
    /// `DbError::NotFound` when the case does not exist.
    pub fn update_case_if_status(
        &self,
        case_id: &str,
        expected: CaseStatus,
        update: &CaseUpdate,
    ) -> DbResult<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let applied = self.execute_update(case_id, update, Some(expected))?;
        if !applied {
            let exists: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM cases WHERE case_id = ?)",
                [case_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(DbError::NotFound(case_id.to_string()));
            }
        }
        tx.commit()?;
        Ok(applied)
    }

    fn execute_update(
        &self,
        case_id: &str,
        update: &CaseUpdate,
        expected: Option<CaseStatus>,
    ) -> DbResult<bool> {
        let assignments = update.assignments();
        let mut values: Vec<Value> = vec![Value::Text(case_id.to_string())];
        let mut clauses = Vec::with_capacity(assignments.len() + 1);

        for (column, value) in assignments {
            values.push(value);
            clauses.push(format!("{} = ?{}", column, values.len()));
        }
        values.push(Value::Text(now_timestamp()));
        clauses.push(format!("updated_at = ?{}", values.len()));

        let mut sql = format!("UPDATE cases SET {} WHERE case_id = ?1", clauses.join(", "));
        if let Some(expected) = expected {
            values.push(Value::Text(expected.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }

        let rows_affected = self.conn.execute(&sql, params_from_iter(values))?;
        Ok(rows_affected > 0)
    }

    /// Append one line to a case's chat log in a single statement.
    pub fn append_chat_line(&self, case_id: &str, line: &ChatLine) -> DbResult<bool> {
        let line_json = serde_json::to_string(line)?;
        let rows_affected = self.conn.execute(
            r#"
            UPDATE cases SET
                chat_history = json_insert(chat_history, '$[#]', json(?2)),
                updated_at = ?3
            WHERE case_id = ?1
            "#,
            params![case_id, line_json, now_timestamp()],
        )?;
        Ok(rows_affected > 0)
    }

    /// Add a professional to a case's rejection list if not already present.
    pub fn append_rejected_by(&self, case_id: &str, professional_id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE cases SET
                rejected_by = CASE
                    WHEN EXISTS (SELECT 1 FROM json_each(cases.rejected_by) WHERE value = ?2)
                    THEN rejected_by
                    ELSE json_insert(rejected_by, '$[#]', ?2)
                END,
                updated_at = ?3
            WHERE case_id = ?1
            "#,
            params![case_id, professional_id, now_timestamp()],
        )?;
        Ok(rows_affected > 0)
    }

    /// The patient's open case, if any.
    pub fn find_open_case(&self, patient_uid: &str) -> DbResult<Option<Case>> {
        let query = CaseQuery::for_patient(patient_uid).with_statuses(&CaseStatus::OPEN);
        Ok(self.query_cases(&query)?.into_iter().next())
    }

    /// Run a case query, newest first.
    pub fn query_cases(&self, query: &CaseQuery) -> DbResult<Vec<Case>> {
        let mut values: Vec<Value> = Vec::new();
        let mut predicates: Vec<String> = Vec::new();

        if let Some(uid) = &query.patient_uid {
            values.push(Value::Text(uid.clone()));
            predicates.push(format!("patient_uid = ?{}", values.len()));
        }
        if let Some(statuses) = &query.statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders: Vec<String> = statuses
                .iter()
                .map(|status| {
                    values.push(Value::Text(status.as_str().to_string()));
                    format!("?{}", values.len())
                })
                .collect();
            predicates.push(format!("status IN ({})", placeholders.join(", ")));
        }

        let mut sql = format!("SELECT {} FROM cases", CASE_COLUMNS);
        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), read_case_row)?;

        let mut cases = Vec::new();
        for row in rows {
            let case: Case = row?.try_into()?;
            cases.push(case);
        }
        Ok(cases)
    }
}

/// Intermediate row struct for database mapping.
struct CaseRow {
    case_id: String,
    patient_uid: String,
    patient_name: String,
    age: i64,
    medical_history: String,
    ailment: String,
    chat_history: String,
    status: String,
    professional_id: Option<String>,
    rejected_by: String,
    created_at: String,
    updated_at: String,
}

fn read_case_row(row: &Row<'_>) -> rusqlite::Result<CaseRow> {
    Ok(CaseRow {
        case_id: row.get(0)?,
        patient_uid: row.get(1)?,
        patient_name: row.get(2)?,
        age: row.get(3)?,
        medical_history: row.get(4)?,
        ailment: row.get(5)?,
        chat_history: row.get(6)?,
        status: row.get(7)?,
        professional_id: row.get(8)?,
        rejected_by: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl TryFrom<CaseRow> for Case {
    type Error = DbError;

    fn try_from(row: CaseRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<CaseStatus>()
            .map_err(|e| DbError::Constraint(e.to_string()))?;
        let age = u32::try_from(row.age)
            .map_err(|_| DbError::Constraint(format!("Invalid age: {}", row.age)))?;

        Ok(Case {
            case_id: row.case_id,
            patient_uid: row.patient_uid,
            patient_name: row.patient_name,
            age,
            medical_history: row.medical_history,
            ailment: row.ailment,
            chat_history: decode_chat_history(&row.chat_history)?,
            status,
            professional_id: row.professional_id,
            rejected_by: serde_json::from_str(&row.rejected_by)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatRole;

    fn profile(name: &str) -> PatientProfile {
        PatientProfile {
            name: name.into(),
            age: 30,
            medical_history: "Allergies: none".into(),
            ailment: "Headache".into(),
        }
    }

    fn setup() -> (Database, Case) {
        let db = Database::open_in_memory().unwrap();
        let case = db.insert_case(&NewCase::new("patient-1", profile("Jane Doe"))).unwrap();
        (db, case)
    }

    #[test]
    fn test_insert_assigns_identity_and_defaults() {
        let (_db, case) = setup();
        assert_eq!(case.case_id.len(), 36);
        assert_eq!(case.patient_name, "Jane Doe");
        assert_eq!(case.status, CaseStatus::InProgress);
        assert!(case.chat_history.is_empty());
        assert!(case.rejected_by.is_empty());
        assert!(case.professional_id.is_none());
        assert!(!case.created_at.is_empty());
    }

    #[test]
    fn test_second_open_case_rejected() {
        let (db, _) = setup();
        let result = db.insert_case(&NewCase::new("patient-1", profile("Jane Doe")));
        assert!(matches!(result, Err(DbError::OpenCaseExists(uid)) if uid == "patient-1"));
    }

    #[test]
    fn test_update_sets_and_deletes_professional() {
        let (db, case) = setup();

        let accept = CaseUpdate::new()
            .status(CaseStatus::Accepted)
            .professional_id(FieldUpdate::Set("doc-a".into()));
        assert!(db.update_case(&case.case_id, &accept).unwrap());
        let stored = db.get_case(&case.case_id).unwrap().unwrap();
        assert_eq!(stored.professional_id.as_deref(), Some("doc-a"));

        let release = CaseUpdate::new()
            .status(CaseStatus::Pending)
            .professional_id(FieldUpdate::Delete);
        db.update_case(&case.case_id, &release).unwrap();
        let stored = db.get_case(&case.case_id).unwrap().unwrap();
        assert_eq!(stored.status, CaseStatus::Pending);
        assert!(stored.professional_id.is_none());

        let is_null: bool = db
            .conn()
            .query_row(
                "SELECT professional_id IS NULL FROM cases WHERE case_id = ?",
                [&case.case_id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(is_null);
    }

    #[test]
    fn test_update_missing_case() {
        let db = Database::open_in_memory().unwrap();
        let update = CaseUpdate::new().status(CaseStatus::Closed);
        assert!(!db.update_case("nope", &update).unwrap());
    }

    #[test]
    fn test_conditional_update() {
        let (db, case) = setup();
        let accept = CaseUpdate::new()
            .status(CaseStatus::Accepted)
            .professional_id(FieldUpdate::Set("doc-a".into()));

        // Still InProgress: precondition fails, nothing written
        assert!(!db
            .update_case_if_status(&case.case_id, CaseStatus::Pending, &accept)
            .unwrap());
        assert_eq!(
            db.get_case(&case.case_id).unwrap().unwrap().status,
            CaseStatus::InProgress
        );

        db.update_case(&case.case_id, &CaseUpdate::new().status(CaseStatus::Pending))
            .unwrap();
        assert!(db
            .update_case_if_status(&case.case_id, CaseStatus::Pending, &accept)
            .unwrap());

        assert!(matches!(
            db.update_case_if_status("nope", CaseStatus::Pending, &accept),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_append_chat_lines_in_order() {
        let (db, case) = setup();
        db.append_chat_line(&case.case_id, &ChatLine::user("I have a headache"))
            .unwrap();
        db.append_chat_line(&case.case_id, &ChatLine::assistant("Try resting"))
            .unwrap();

        let stored = db.get_case(&case.case_id).unwrap().unwrap();
        assert_eq!(stored.chat_history.len(), 2);
        assert_eq!(stored.chat_history[0].role, ChatRole::User);
        assert_eq!(stored.chat_history[1].text, "Try resting");
        assert!(!db.append_chat_line("nope", &ChatLine::user("x")).unwrap());
    }

    #[test]
    fn test_append_rejected_by_is_set_like() {
        let (db, case) = setup();
        db.append_rejected_by(&case.case_id, "doc-a").unwrap();
        db.append_rejected_by(&case.case_id, "doc-b").unwrap();
        db.append_rejected_by(&case.case_id, "doc-a").unwrap();

        let stored = db.get_case(&case.case_id).unwrap().unwrap();
        assert_eq!(stored.rejected_by, vec!["doc-a".to_string(), "doc-b".to_string()]);
    }

    #[test]
    fn test_find_open_case_ignores_closed() {
        let (db, case) = setup();
        assert_eq!(db.find_open_case("patient-1").unwrap().unwrap().case_id, case.case_id);

        db.update_case(&case.case_id, &CaseUpdate::new().status(CaseStatus::Closed))
            .unwrap();
        assert!(db.find_open_case("patient-1").unwrap().is_none());
        assert!(db.find_open_case("patient-2").unwrap().is_none());
    }

    #[test]
    fn test_query_newest_first_and_filtered() {
        let (db, first) = setup();
        db.update_case(&first.case_id, &CaseUpdate::new().status(CaseStatus::Closed))
            .unwrap();
        let second = db.insert_case(&NewCase::new("patient-1", profile("Jane Doe"))).unwrap();
        db.insert_case(&NewCase::new("patient-2", profile("John Roe"))).unwrap();

        let mine = db.query_cases(&CaseQuery::for_patient("patient-1")).unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].case_id, second.case_id);
        assert_eq!(mine[1].case_id, first.case_id);

        let closed = db
            .query_cases(&CaseQuery::all().with_statuses(&[CaseStatus::Closed]))
            .unwrap();
        assert_eq!(closed.len(), 1);

        assert!(db
            .query_cases(&CaseQuery::all().with_statuses(&[]))
            .unwrap()
            .is_empty());
        assert_eq!(db.query_cases(&CaseQuery::all()).unwrap().len(), 3);
    }

    #[test]
    fn test_resolved_reads_back() {
        let (db, case) = setup();
        db.conn()
            .execute(
                "UPDATE cases SET status = 'Resolved' WHERE case_id = ?",
                [&case.case_id],
            )
            .unwrap();
        let stored = db.get_case(&case.case_id).unwrap().unwrap();
        assert_eq!(stored.status, CaseStatus::Resolved);
        assert!(db.find_open_case("patient-1").unwrap().is_none());
    }
}
