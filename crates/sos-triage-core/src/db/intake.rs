//! Intake questionnaire database operations.

use rusqlite::{params, OptionalExtension};

use super::{now_timestamp, Database, DbError, DbResult};
use crate::models::IntakeAnswers;

impl Database {
    /// Store (or replace) a user's questionnaire answers.
    pub fn save_intake_answers(&self, user_id: &str, answers: &IntakeAnswers) -> DbResult<()> {
        let answers_json = serde_json::to_string(answers)?;
        self.conn.execute(
            r#"
            INSERT INTO intake_answers (user_id, answers, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET
                answers = excluded.answers,
                updated_at = excluded.updated_at
            "#,
            params![user_id, answers_json, now_timestamp()],
        )?;
        Ok(())
    }

    /// A user's questionnaire answers, if they have been written.
    pub fn get_intake_answers(&self, user_id: &str) -> DbResult<Option<IntakeAnswers>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT answers FROM intake_answers WHERE user_id = ?",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|j| serde_json::from_str::<IntakeAnswers>(&j).map_err(DbError::from))
            .transpose()
    }
}
