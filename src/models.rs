use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim() {
                    $($text => Ok($name::$variant),)+
                    "" => Err(EngineError::invalid(concat!(stringify!($name), " must not be blank"))),
                    other => Err(EngineError::invalid(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Standing {
    Active,
    Dropped,
}

text_enum!(Standing { Active => "active", Dropped => "dropped" });

#[derive(Debug, Clone, Serialize)]
pub struct Student {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub cohort_id: Uuid,
    pub standing: Standing,
    pub payment_blocked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Course {
    pub id: Uuid,
    pub code: String,
    pub title: String,
    pub credits: i32,
    pub semester: String,
    pub cohort_id: Uuid,
    pub teacher_id: Option<Uuid>,
}

/// Raw assessment scores on the 0–20 scale. `None` means not assessed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Components {
    pub continuous: Option<f64>,
    pub practical: Option<f64>,
    pub exam: Option<f64>,
}

impl Components {
    pub fn new(continuous: Option<f64>, practical: Option<f64>, exam: Option<f64>) -> Self {
        Self {
            continuous,
            practical,
            exam,
        }
    }

    /// Fields set in `patch` replace ours; unset fields keep the current value.
    pub fn overlay(&self, patch: &Components) -> Components {
        Components {
            continuous: patch.continuous.or(self.continuous),
            practical: patch.practical.or(self.practical),
            exam: patch.exam.or(self.exam),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.continuous.is_none() && self.practical.is_none() && self.exam.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LetterGrade {
    A,
    B,
    C,
    D,
    E,
    F,
}

text_enum!(LetterGrade { A => "A", B => "B", C => "C", D => "D", E => "E", F => "F" });

#[derive(Debug, Clone, Serialize)]
pub struct Grade {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub term: String,
    pub components: Components,
    pub final_score: Option<f64>,
    pub letter: Option<LetterGrade>,
    pub validated: bool,
    pub validated_by: Option<Uuid>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationType {
    Correction,
    Appeal,
    JuryDecision,
    Administrative,
}

text_enum!(ModificationType {
    Correction => "correction",
    Appeal => "appeal",
    JuryDecision => "jury_decision",
    Administrative => "administrative",
});

/// Append-only ledger row. Only the two `*_notified` flags change after insert.
#[derive(Debug, Clone, Serialize)]
pub struct GradeModification {
    pub id: Uuid,
    pub grade_id: Uuid,
    pub old_components: Components,
    pub new_components: Components,
    pub old_final_score: Option<f64>,
    pub new_final_score: Option<f64>,
    pub justification: String,
    pub modification_type: ModificationType,
    pub modified_by: Uuid,
    pub deliberation_id: Option<Uuid>,
    pub grader_notified: bool,
    pub president_notified: bool,
    pub approved_by: Option<Uuid>,
    pub approval_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliberationStatus {
    Draft,
    Compiled,
    InSession,
    Adjusted,
}

text_enum!(DeliberationStatus {
    Draft => "DRAFT",
    Compiled => "COMPILED",
    InSession => "IN_SESSION",
    Adjusted => "ADJUSTED",
});

impl DeliberationStatus {
    /// Status after a successful compilation. Only `DRAFT` moves.
    pub fn after_compile(self) -> Self {
        match self {
            DeliberationStatus::Draft => DeliberationStatus::Compiled,
            other => other,
        }
    }

    /// Status after an adjustment linked to this deliberation.
    pub fn after_adjustment(self) -> Self {
        match self {
            DeliberationStatus::Compiled | DeliberationStatus::InSession => {
                DeliberationStatus::Adjusted
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Normal,
    Retake,
}

text_enum!(SessionType { Normal => "normal", Retake => "retake" });

#[derive(Debug, Clone, Serialize)]
pub struct Deliberation {
    pub id: Uuid,
    pub cohort_id: Uuid,
    pub term: String,
    pub semester: Option<String>,
    pub session_type: SessionType,
    pub status: DeliberationStatus,
    pub pass_mark: f64,
    pub starts_on: NaiveDate,
    pub ends_on: NaiveDate,
    pub president_id: Option<Uuid>,
    pub secretary_id: Option<Uuid>,
    pub version: i64,
}

/// Ordered from most to least favourable; `Blocked` sorts last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Admitted,
    AdmittedWithDebt,
    Deferred,
    Refused,
    Blocked,
}

text_enum!(Decision {
    Admitted => "ADMITTED",
    AdmittedWithDebt => "ADMITTED_WITH_DEBT",
    Deferred => "DEFERRED",
    Refused => "REFUSED",
    Blocked => "BLOCKED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mention {
    Excellent,
    VeryGood,
    Good,
    FairlyGood,
    Pass,
}

text_enum!(Mention {
    Excellent => "excellent",
    VeryGood => "very_good",
    Good => "good",
    FairlyGood => "fairly_good",
    Pass => "pass",
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliberationResult {
    pub deliberation_id: Uuid,
    pub student_id: Uuid,
    pub average: Option<f64>,
    pub credits_obtained: i32,
    pub credits_required: i32,
    pub decision: Decision,
    pub rank: Option<i32>,
    pub mention: Option<Mention>,
    pub remarks: Option<String>,
}

/// Hand edits allowed on a compiled row; `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct ResultAmendment {
    pub decision: Option<Decision>,
    pub mention: Option<Option<Mention>>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentHistoryEntry {
    pub deliberation_id: Uuid,
    pub cohort_id: Uuid,
    pub term: String,
    pub semester: Option<String>,
    pub session_type: SessionType,
    pub starts_on: NaiveDate,
    pub result: DeliberationResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
}

text_enum!(Severity { Info => "info", Warning => "warning" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRole {
    Grader,
    President,
}

text_enum!(RecipientRole { Grader => "grader", President => "president" });

/// Outbox row written in the same transaction as the ledger entry.
#[derive(Debug, Clone, Serialize)]
pub struct PendingNotification {
    pub id: Uuid,
    pub modification_id: Uuid,
    pub recipient_id: Uuid,
    pub recipient_role: RecipientRole,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub link: Option<String>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// A student with the in-scope courses they are enrolled in and any grade
/// recorded for the deliberation's term.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub student: Student,
    pub courses: Vec<EnrolledCourse>,
}

#[derive(Debug, Clone)]
pub struct EnrolledCourse {
    pub course: Course,
    pub grade: Option<Grade>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_keeps_unset_components() {
        let current = Components::new(Some(10.0), Some(12.0), Some(8.0));
        let patch = Components::new(None, None, Some(14.0));
        assert_eq!(
            current.overlay(&patch),
            Components::new(Some(10.0), Some(12.0), Some(14.0))
        );
    }

    #[test]
    fn status_transitions_never_regress() {
        use DeliberationStatus::*;
        assert_eq!(Draft.after_compile(), Compiled);
        assert_eq!(Adjusted.after_compile(), Adjusted);
        assert_eq!(InSession.after_compile(), InSession);
        assert_eq!(Compiled.after_adjustment(), Adjusted);
        assert_eq!(InSession.after_adjustment(), Adjusted);
        assert_eq!(Draft.after_adjustment(), Draft);
    }

    #[test]
    fn modification_type_rejects_blank_and_unknown() {
        assert_eq!(
            "appeal".parse::<ModificationType>().unwrap(),
            ModificationType::Appeal
        );
        assert!(matches!(
            "  ".parse::<ModificationType>(),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            "bribe".parse::<ModificationType>(),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn decisions_are_totally_ordered() {
        assert!(Decision::Admitted < Decision::AdmittedWithDebt);
        assert!(Decision::Deferred < Decision::Refused);
        assert!(Decision::Refused < Decision::Blocked);
        assert_eq!("IN_SESSION".parse::<DeliberationStatus>().unwrap(), DeliberationStatus::InSession);
    }
}
