//! SQLite schema definition.

/// Complete database schema for the triage store.
pub const SCHEMA: &str = r#"
-- ============================================================================
-- Cases
-- ============================================================================

CREATE TABLE IF NOT EXISTS cases (
    case_id TEXT PRIMARY KEY,
    patient_uid TEXT NOT NULL,
    patient_name TEXT NOT NULL DEFAULT '',
    age INTEGER NOT NULL DEFAULT 0 CHECK (age >= 0),
    medical_history TEXT NOT NULL DEFAULT '',
    ailment TEXT NOT NULL DEFAULT '',
    chat_history TEXT NOT NULL DEFAULT '[]',      -- JSON array of {role, text}
    status TEXT NOT NULL DEFAULT 'InProgress'
        CHECK (status IN ('InProgress', 'Pending', 'Accepted', 'Closed', 'Resolved')),
    professional_id TEXT,                         -- NULL unless Accepted
    rejected_by TEXT NOT NULL DEFAULT '[]',       -- JSON array of professional IDs
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- At most one open case per patient
CREATE UNIQUE INDEX IF NOT EXISTS idx_cases_one_open_per_patient
    ON cases(patient_uid)
    WHERE status IN ('InProgress', 'Pending', 'Accepted');

CREATE INDEX IF NOT EXISTS idx_cases_status ON cases(status);
CREATE INDEX IF NOT EXISTS idx_cases_patient_created ON cases(patient_uid, created_at);

-- Array columns only grow
CREATE TRIGGER IF NOT EXISTS cases_chat_history_append_only
BEFORE UPDATE OF chat_history ON cases
WHEN json_array_length(new.chat_history) < json_array_length(old.chat_history)
BEGIN
    SELECT RAISE(ABORT, 'chat_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS cases_rejected_by_grow_only
BEFORE UPDATE OF rejected_by ON cases
WHEN json_array_length(new.rejected_by) < json_array_length(old.rejected_by)
BEGIN
    SELECT RAISE(ABORT, 'rejected_by only grows');
END;

-- ============================================================================
-- Intake Questionnaire
-- ============================================================================

CREATE TABLE IF NOT EXISTS intake_answers (
    user_id TEXT PRIMARY KEY,
    answers TEXT NOT NULL DEFAULT '{}',           -- JSON object prompt -> answer
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
