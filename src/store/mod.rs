//! Persistence seam. Each mutating call is one transaction: it either
//! applies completely or leaves every row as it was.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Components, Course, Deliberation, DeliberationResult, DeliberationStatus, Grade,
    GradeModification, LetterGrade, PendingNotification, ResultAmendment, RosterEntry, Student,
    StudentHistoryEntry,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Replaces the whole result set of one deliberation.
#[derive(Debug, Clone)]
pub struct ResultSetCommit {
    pub deliberation_id: Uuid,
    /// Version read before aggregation started; a mismatch is a conflict.
    pub expected_version: i64,
    pub results: Vec<DeliberationResult>,
    pub status: DeliberationStatus,
}

#[derive(Debug, Clone)]
pub struct AdjustmentCommit {
    pub grade_id: Uuid,
    pub expected_grade_version: i64,
    pub components: Components,
    pub final_score: Option<f64>,
    pub letter: Option<LetterGrade>,
    pub modification: GradeModification,
    pub notifications: Vec<PendingNotification>,
    /// Flipped to `ADJUSTED` when compiled or in session; version always bumped.
    pub deliberation_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct AdjustmentApplied {
    pub grade: Grade,
    pub deliberation: Option<Deliberation>,
}

/// Outcome of a raw grade write made outside the ledger (bulk import, seed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawGradeWrite {
    Written,
    Unchanged,
    /// The grade is validated; only a ledger adjustment may change it.
    SkippedValidated,
}

/// Which outbox rows a dispatcher may take.
#[derive(Debug, Clone, Copy)]
pub struct NotificationClaim {
    pub modification_id: Option<Uuid>,
    pub limit: usize,
    /// Rows that already failed this many times stay parked.
    pub max_attempts: i32,
    /// How long a claimed row is hidden from other dispatchers.
    pub lease: Duration,
}

#[async_trait]
pub trait DeliberationStore: Send + Sync {
    async fn deliberation(&self, id: Uuid) -> Result<Option<Deliberation>>;

    async fn grade(&self, id: Uuid) -> Result<Option<Grade>>;

    /// Ordered by rank, unranked rows last.
    async fn results(&self, deliberation_id: Uuid) -> Result<Vec<DeliberationResult>>;

    /// Newest deliberation first.
    async fn student_results(&self, student_id: Uuid) -> Result<Vec<StudentHistoryEntry>>;

    /// Oldest first.
    async fn modifications(&self, grade_id: Uuid) -> Result<Vec<GradeModification>>;

    async fn replace_results(&self, commit: &ResultSetCommit) -> Result<Deliberation>;

    async fn apply_adjustment(&self, commit: &AdjustmentCommit) -> Result<AdjustmentApplied>;

    async fn amend_result(
        &self,
        deliberation_id: Uuid,
        student_id: Uuid,
        amendment: &ResultAmendment,
    ) -> Result<DeliberationResult>;

    async fn set_status(&self, deliberation_id: Uuid, status: DeliberationStatus)
        -> Result<Deliberation>;

    /// Undelivered, unclaimed outbox rows, oldest first. The returned rows
    /// are leased to the caller so a concurrent claim never sees them.
    async fn claim_notifications(&self, claim: &NotificationClaim)
        -> Result<Vec<PendingNotification>>;

    /// Stamps the outbox row, releases its lease and sets the matching flag
    /// on the ledger row. A row that is already delivered is left alone.
    async fn mark_delivered(&self, notification_id: Uuid) -> Result<()>;

    /// Counts the attempt and releases the lease.
    async fn record_delivery_failure(&self, notification_id: Uuid, error: &str) -> Result<()>;
}

/// Read-only view of students, courses and enrollments.
#[async_trait]
pub trait EnrollmentDirectory: Send + Sync {
    /// Active students of the cohort with their in-scope courses and the
    /// grade recorded for `term`, if any.
    async fn roster(
        &self,
        cohort_id: Uuid,
        term: &str,
        semester: Option<&str>,
    ) -> Result<Vec<RosterEntry>>;

    async fn student(&self, student_id: Uuid) -> Result<Option<Student>>;

    async fn course(&self, course_id: Uuid) -> Result<Option<Course>>;
}
