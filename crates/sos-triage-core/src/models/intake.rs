//! Intake questionnaire answers and the patient fields harvested from them.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

pub const NAME_PROMPT: &str = "What is your full name?";
pub const BIRTH_DATE_PROMPT: &str = "When were you born?";
pub const AGE_PROMPT: &str = "What is your age?";
pub const BLOOD_TYPE_PROMPT: &str = "What is your blood type?";
pub const ALLERGIES_PROMPT: &str = "Do you have any known allergies?";
pub const CHRONIC_CONDITIONS_PROMPT: &str = "Do you have any chronic conditions?";
pub const SURGERIES_PROMPT: &str = "Have you had any surgeries in the past?";
pub const MEDICATIONS_PROMPT: &str = "Are you currently on any medications?";
pub const AILMENT_PROMPT: &str = "What is your current ailment or health concern?";

/// Prompts folded into the medical-history blob, with their labels.
const HISTORY_FIELDS: &[(&str, &str)] = &[
    (BLOOD_TYPE_PROMPT, "Blood type"),
    (ALLERGIES_PROMPT, "Allergies"),
    (CHRONIC_CONDITIONS_PROMPT, "Chronic conditions"),
    (SURGERIES_PROMPT, "Past surgeries"),
    (MEDICATIONS_PROMPT, "Current medications"),
];

/// Prompt → answer mapping written by the intake questionnaire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct IntakeAnswers(BTreeMap<String, String>);

impl IntakeAnswers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, prompt: impl Into<String>, answer: impl Into<String>) {
        self.0.insert(prompt.into(), answer.into());
    }

    /// Trimmed, non-empty answer for `prompt`.
    pub fn get(&self, prompt: &str) -> Option<&str> {
        self.0
            .get(prompt)
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
    }

    /// Map the answers onto case fields. `today` anchors the age calculation.
    pub fn harvest(&self, today: NaiveDate) -> PatientProfile {
        let age = self
            .get(BIRTH_DATE_PROMPT)
            .and_then(parse_birth_date)
            .and_then(|born| today.years_since(born))
            .or_else(|| self.get(AGE_PROMPT).and_then(|a| a.parse().ok()))
            .unwrap_or(0);

        let medical_history = HISTORY_FIELDS
            .iter()
            .filter_map(|(prompt, label)| self.get(prompt).map(|a| format!("{}: {}", label, a)))
            .collect::<Vec<_>>()
            .join("\n");

        PatientProfile {
            name: self.get(NAME_PROMPT).unwrap_or_default().to_string(),
            age,
            medical_history,
            ailment: self.get(AILMENT_PROMPT).unwrap_or_default().to_string(),
        }
    }
}

impl<P: Into<String>, A: Into<String>> FromIterator<(P, A)> for IntakeAnswers {
    fn from_iter<T: IntoIterator<Item = (P, A)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(p, a)| (p.into(), a.into()))
                .collect(),
        )
    }
}

/// Accepts RFC 3339 timestamps (what the questionnaire's date picker stores)
/// and plain `YYYY-MM-DD` dates.
fn parse_birth_date(s: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.date_naive())
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .ok()
}

/// Patient fields copied onto a case.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatientProfile {
    pub name: String,
    pub age: u32,
    pub medical_history: String,
    pub ailment: String,
}
