//! Records shared with the rest of the application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scheduled medicine. Read-only to the verification session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Medicine {
    pub id: String,
    /// Scheduled dose event this medicine belongs to.
    #[serde(default)]
    pub reminder_id: Option<String>,
    pub name: String,
    /// RFC 3339 alarm time.
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub dosage: String,
    #[serde(default)]
    pub total_dosage: String,
}

impl Medicine {
    pub fn new(id: impl Into<String>, reminder_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reminder_id: Some(reminder_id.into()),
            name: name.into(),
            time: String::new(),
            dosage: String::new(),
            total_dosage: String::new(),
        }
    }

    /// Reminder id, if present and non-blank.
    pub fn reminder(&self) -> Option<&str> {
        self.reminder_id
            .as_deref()
            .map(str::trim)
            .filter(|rid| !rid.is_empty())
    }
}

/// Outcome of a dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoseStatus {
    Taken,
    Missed,
}

impl std::fmt::Display for DoseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Taken => f.write_str("taken"),
            Self::Missed => f.write_str("missed"),
        }
    }
}

/// One recorded dose outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub medicine_id: String,
    pub medicine_name: String,
    pub status: DoseStatus,
    pub time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_medicine_accepts_app_json() {
        let raw = r#"{"id":"7","reminderId":"7","name":"Amoxicillin","time":"2026-10-16T08:00:00Z","dosage":"1 pill","totalDosage":"20"}"#;
        let medicine: Medicine = serde_json::from_str(raw).unwrap();
        assert_eq!(medicine.reminder(), Some("7"));
        assert_eq!(medicine.total_dosage, "20");
    }

    #[test]
    fn test_blank_reminder_is_absent() {
        let raw = r#"{"id":"7","reminderId":"  ","name":"Amoxicillin"}"#;
        let medicine: Medicine = serde_json::from_str(raw).unwrap();
        assert_eq!(medicine.reminder(), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&DoseStatus::Taken).unwrap(), "\"taken\"");
    }
}
