//! In-process store. Every mutation works on a staged copy of the state and
//! swaps it in only when all steps succeed, which gives the same
//! all-or-nothing behaviour as a database transaction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use super::{
    AdjustmentApplied, AdjustmentCommit, DeliberationStore, EnrollmentDirectory,
    NotificationClaim, RawGradeWrite, ResultSetCommit,
};
use crate::error::{EngineError, Result};
use crate::models::{
    Components, Course, Deliberation, DeliberationResult, DeliberationStatus, EnrolledCourse, Grade,
    GradeModification, PendingNotification, RecipientRole, ResultAmendment, RosterEntry, Standing,
    Student, StudentHistoryEntry,
};
use crate::policy::Weights;
use crate::score;

/// Places where a test can make the next commit fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// After the old result rows are gone and half the new ones are written.
    MidResultReplace,
    /// After the ledger row is written, before the grade is updated.
    AfterLedgerInsert,
    /// After the grade and ledger are written, before the status flip.
    BeforeStatusFlip,
}

/// Holds the next `replace_results` call at its entry until `resume` fires.
#[derive(Debug, Default)]
pub struct ReplacePause {
    pub reached: Notify,
    pub resume: Notify,
}

#[derive(Debug, Clone, Default)]
struct State {
    students: HashMap<Uuid, Student>,
    courses: HashMap<Uuid, Course>,
    enrollments: Vec<(Uuid, Uuid)>,
    grades: HashMap<Uuid, Grade>,
    deliberations: HashMap<Uuid, Deliberation>,
    results: HashMap<Uuid, Vec<DeliberationResult>>,
    modifications: Vec<GradeModification>,
    notifications: Vec<PendingNotification>,
    claims: HashMap<Uuid, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_point: Mutex<Option<FailPoint>>,
    pause: Mutex<Option<Arc<ReplacePause>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a one-shot failure for the next commit that reaches `point`.
    pub async fn fail_next(&self, point: FailPoint) {
        *self.fail_point.lock().await = Some(point);
    }

    /// Arms a one-shot pause for the next result replacement.
    pub async fn pause_next_replace(&self) -> Arc<ReplacePause> {
        let pause = Arc::new(ReplacePause::default());
        *self.pause.lock().await = Some(pause.clone());
        pause
    }

    async fn trip(&self, point: FailPoint) -> Result<()> {
        let mut armed = self.fail_point.lock().await;
        if *armed == Some(point) {
            *armed = None;
            return Err(EngineError::Internal(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    pub async fn insert_student(&self, student: Student) {
        self.state.lock().await.students.insert(student.id, student);
    }

    pub async fn insert_course(&self, course: Course) {
        self.state.lock().await.courses.insert(course.id, course);
    }

    pub async fn enroll(&self, student_id: Uuid, course_id: Uuid) {
        self.state.lock().await.enrollments.push((student_id, course_id));
    }

    pub async fn insert_grade(&self, grade: Grade) {
        self.state.lock().await.grades.insert(grade.id, grade);
    }

    pub async fn insert_deliberation(&self, deliberation: Deliberation) {
        self.state
            .lock()
            .await
            .deliberations
            .insert(deliberation.id, deliberation);
    }

    pub async fn insert_notification(&self, notification: PendingNotification) {
        self.state.lock().await.notifications.push(notification);
    }

    /// Raw grade entry outside the ledger, with the same guards as the bulk
    /// import: validated grades are never touched and an identical entry is
    /// a no-op.
    pub async fn record_raw_components(
        &self,
        grade_id: Uuid,
        patch: &Components,
        weights: &Weights,
    ) -> Result<RawGradeWrite> {
        let mut state = self.state.lock().await;
        let grade = state
            .grades
            .get_mut(&grade_id)
            .ok_or_else(|| EngineError::not_found("grade", grade_id))?;
        let components = grade.components.overlay(patch);
        if components == grade.components {
            return Ok(RawGradeWrite::Unchanged);
        }
        if grade.validated {
            return Ok(RawGradeWrite::SkippedValidated);
        }
        let outcome = score::evaluate(&components, weights)?;
        grade.components = components;
        grade.final_score = outcome.final_score;
        grade.letter = outcome.letter;
        grade.validated = false;
        grade.validated_by = None;
        grade.version += 1;
        grade.updated_at = Utc::now();
        Ok(RawGradeWrite::Written)
    }

    pub async fn all_modifications(&self) -> Vec<GradeModification> {
        self.state.lock().await.modifications.clone()
    }

    pub async fn all_notifications(&self) -> Vec<PendingNotification> {
        self.state.lock().await.notifications.clone()
    }
}

fn rank_key(result: &DeliberationResult) -> (i32, Uuid) {
    (result.rank.unwrap_or(i32::MAX), result.student_id)
}

#[async_trait]
impl DeliberationStore for MemoryStore {
    async fn deliberation(&self, id: Uuid) -> Result<Option<Deliberation>> {
        Ok(self.state.lock().await.deliberations.get(&id).cloned())
    }

    async fn grade(&self, id: Uuid) -> Result<Option<Grade>> {
        Ok(self.state.lock().await.grades.get(&id).cloned())
    }

    async fn results(&self, deliberation_id: Uuid) -> Result<Vec<DeliberationResult>> {
        let state = self.state.lock().await;
        let mut rows = state
            .results
            .get(&deliberation_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(rank_key);
        Ok(rows)
    }

    async fn student_results(&self, student_id: Uuid) -> Result<Vec<StudentHistoryEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<StudentHistoryEntry> = state
            .results
            .iter()
            .filter_map(|(deliberation_id, rows)| {
                let deliberation = state.deliberations.get(deliberation_id)?;
                let result = rows.iter().find(|row| row.student_id == student_id)?;
                Some(StudentHistoryEntry {
                    deliberation_id: deliberation.id,
                    cohort_id: deliberation.cohort_id,
                    term: deliberation.term.clone(),
                    semester: deliberation.semester.clone(),
                    session_type: deliberation.session_type,
                    starts_on: deliberation.starts_on,
                    result: result.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            b.starts_on
                .cmp(&a.starts_on)
                .then_with(|| a.deliberation_id.cmp(&b.deliberation_id))
        });
        Ok(entries)
    }

    async fn modifications(&self, grade_id: Uuid) -> Result<Vec<GradeModification>> {
        let state = self.state.lock().await;
        Ok(state
            .modifications
            .iter()
            .filter(|modification| modification.grade_id == grade_id)
            .cloned()
            .collect())
    }

    async fn replace_results(&self, commit: &ResultSetCommit) -> Result<Deliberation> {
        let pause = self.pause.lock().await.take();
        if let Some(pause) = pause {
            pause.reached.notify_one();
            pause.resume.notified().await;
        }

        let mut state = self.state.lock().await;
        let mut staged = state.clone();

        let deliberation = staged
            .deliberations
            .get_mut(&commit.deliberation_id)
            .ok_or_else(|| EngineError::not_found("deliberation", commit.deliberation_id))?;
        if deliberation.version != commit.expected_version {
            return Err(EngineError::conflict(format!(
                "deliberation {} moved from version {} to {} during compilation",
                commit.deliberation_id, commit.expected_version, deliberation.version
            )));
        }
        deliberation.status = commit.status;
        deliberation.version += 1;
        let updated = deliberation.clone();

        let rows = staged.results.entry(commit.deliberation_id).or_default();
        rows.clear();
        let halfway = commit.results.len() / 2;
        for (index, result) in commit.results.iter().enumerate() {
            if index == halfway {
                self.trip(FailPoint::MidResultReplace).await?;
            }
            rows.push(result.clone());
        }

        *state = staged;
        Ok(updated)
    }

    async fn apply_adjustment(&self, commit: &AdjustmentCommit) -> Result<AdjustmentApplied> {
        let mut state = self.state.lock().await;
        let mut staged = state.clone();

        let current_version = staged
            .grades
            .get(&commit.grade_id)
            .ok_or_else(|| EngineError::not_found("grade", commit.grade_id))?
            .version;
        if current_version != commit.expected_grade_version {
            return Err(EngineError::conflict(format!(
                "grade {} changed while the adjustment was prepared",
                commit.grade_id
            )));
        }

        staged.modifications.push(commit.modification.clone());
        staged.notifications.extend(commit.notifications.iter().cloned());
        self.trip(FailPoint::AfterLedgerInsert).await?;

        let grade = staged
            .grades
            .get_mut(&commit.grade_id)
            .ok_or_else(|| EngineError::not_found("grade", commit.grade_id))?;
        grade.components = commit.components;
        grade.final_score = commit.final_score;
        grade.letter = commit.letter;
        grade.validated = false;
        grade.validated_by = None;
        grade.version += 1;
        grade.updated_at = Utc::now();
        let grade = grade.clone();

        self.trip(FailPoint::BeforeStatusFlip).await?;
        let deliberation = match commit.deliberation_id {
            Some(id) => {
                let deliberation = staged
                    .deliberations
                    .get_mut(&id)
                    .ok_or_else(|| EngineError::not_found("deliberation", id))?;
                deliberation.status = deliberation.status.after_adjustment();
                deliberation.version += 1;
                Some(deliberation.clone())
            }
            None => None,
        };

        *state = staged;
        Ok(AdjustmentApplied {
            grade,
            deliberation,
        })
    }

    async fn amend_result(
        &self,
        deliberation_id: Uuid,
        student_id: Uuid,
        amendment: &ResultAmendment,
    ) -> Result<DeliberationResult> {
        let mut state = self.state.lock().await;
        let row = state
            .results
            .get_mut(&deliberation_id)
            .and_then(|rows| rows.iter_mut().find(|row| row.student_id == student_id))
            .ok_or_else(|| EngineError::not_found("deliberation result", student_id))?;
        if let Some(decision) = amendment.decision {
            row.decision = decision;
        }
        if let Some(mention) = amendment.mention {
            row.mention = mention;
        }
        if let Some(remarks) = &amendment.remarks {
            row.remarks = Some(remarks.clone());
        }
        Ok(row.clone())
    }

    async fn set_status(
        &self,
        deliberation_id: Uuid,
        status: DeliberationStatus,
    ) -> Result<Deliberation> {
        let mut state = self.state.lock().await;
        let deliberation = state
            .deliberations
            .get_mut(&deliberation_id)
            .ok_or_else(|| EngineError::not_found("deliberation", deliberation_id))?;
        deliberation.status = status;
        deliberation.version += 1;
        Ok(deliberation.clone())
    }

    async fn claim_notifications(
        &self,
        claim: &NotificationClaim,
    ) -> Result<Vec<PendingNotification>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let claimed: Vec<PendingNotification> = state
            .notifications
            .iter()
            .filter(|n| n.delivered_at.is_none() && n.attempts < claim.max_attempts)
            .filter(|n| claim.modification_id.map_or(true, |id| n.modification_id == id))
            .filter(|n| state.claims.get(&n.id).map_or(true, |until| *until <= now))
            .take(claim.limit)
            .cloned()
            .collect();
        for notification in &claimed {
            state.claims.insert(notification.id, now + claim.lease);
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, notification_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let notification = state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
            .ok_or_else(|| EngineError::not_found("notification", notification_id))?;
        if notification.delivered_at.is_some() {
            return Ok(());
        }
        notification.attempts += 1;
        notification.delivered_at = Some(Utc::now());
        let (modification_id, role) = (notification.modification_id, notification.recipient_role);
        state.claims.remove(&notification_id);

        if let Some(modification) = state
            .modifications
            .iter_mut()
            .find(|m| m.id == modification_id)
        {
            match role {
                RecipientRole::Grader => modification.grader_notified = true,
                RecipientRole::President => modification.president_notified = true,
            }
        }
        Ok(())
    }

    async fn record_delivery_failure(&self, notification_id: Uuid, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let notification = state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
            .ok_or_else(|| EngineError::not_found("notification", notification_id))?;
        notification.attempts += 1;
        notification.last_error = Some(error.to_string());
        state.claims.remove(&notification_id);
        Ok(())
    }
}

#[async_trait]
impl EnrollmentDirectory for MemoryStore {
    async fn roster(
        &self,
        cohort_id: Uuid,
        term: &str,
        semester: Option<&str>,
    ) -> Result<Vec<RosterEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<RosterEntry> = state
            .students
            .values()
            .filter(|s| s.cohort_id == cohort_id && s.standing == Standing::Active)
            .map(|student| {
                let courses = state
                    .enrollments
                    .iter()
                    .filter(|(student_id, _)| *student_id == student.id)
                    .filter_map(|(_, course_id)| state.courses.get(course_id))
                    .filter(|course| semester.map_or(true, |s| course.semester == s))
                    .map(|course| EnrolledCourse {
                        course: course.clone(),
                        grade: state
                            .grades
                            .values()
                            .find(|g| {
                                g.student_id == student.id
                                    && g.course_id == course.id
                                    && g.term == term
                            })
                            .cloned(),
                    })
                    .collect();
                RosterEntry {
                    student: student.clone(),
                    courses,
                }
            })
            .collect();
        entries.sort_by_key(|entry| entry.student.id);
        Ok(entries)
    }

    async fn student(&self, student_id: Uuid) -> Result<Option<Student>> {
        Ok(self.state.lock().await.students.get(&student_id).cloned())
    }

    async fn course(&self, course_id: Uuid) -> Result<Option<Course>> {
        Ok(self.state.lock().await.courses.get(&course_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::{ModificationType, Severity};
    use crate::testing::Fixture;

    #[tokio::test]
    async fn raw_entry_never_rewrites_a_validated_grade() {
        let fixture = Fixture::build().await;
        let before = fixture.store.grade(fixture.strong_grade).await.unwrap().unwrap();
        assert!(before.validated);

        let outcome = fixture
            .store
            .record_raw_components(
                fixture.strong_grade,
                &Components::new(None, None, Some(18.0)),
                &Weights::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, RawGradeWrite::SkippedValidated);

        let after = fixture.store.grade(fixture.strong_grade).await.unwrap().unwrap();
        assert_eq!(after.components, before.components);
        assert_eq!(after.final_score, before.final_score);
        assert_eq!(after.version, before.version);
        assert!(after.validated);
        assert!(fixture.store.all_modifications().await.is_empty());
    }

    #[tokio::test]
    async fn raw_entry_updates_pending_grades_and_ignores_repeats() {
        let fixture = Fixture::build().await;
        let patch = Components::new(None, None, Some(9.0));

        let first = fixture
            .store
            .record_raw_components(fixture.weak_grade, &patch, &Weights::default())
            .await
            .unwrap();
        let second = fixture
            .store
            .record_raw_components(fixture.weak_grade, &patch, &Weights::default())
            .await
            .unwrap();

        assert_eq!(first, RawGradeWrite::Written);
        assert_eq!(second, RawGradeWrite::Unchanged);
        let grade = fixture.store.grade(fixture.weak_grade).await.unwrap().unwrap();
        assert_eq!(grade.components.exam, Some(9.0));
        assert_eq!(grade.version, 1);
    }

    fn outbox_row(id: u128, attempts: i32) -> PendingNotification {
        PendingNotification {
            id: Uuid::from_u128(id),
            modification_id: Uuid::from_u128(0xAD),
            recipient_id: Uuid::from_u128(0xA2),
            recipient_role: RecipientRole::Grader,
            title: "Grade modified".to_string(),
            message: format!("{} changed", ModificationType::Correction),
            severity: Severity::Info,
            link: None,
            attempts,
            last_error: None,
            delivered_at: None,
        }
    }

    fn claim(limit: usize) -> NotificationClaim {
        NotificationClaim {
            modification_id: None,
            limit,
            max_attempts: 3,
            lease: Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn claimed_rows_are_hidden_from_a_second_dispatcher() {
        let store = MemoryStore::new();
        for row in [outbox_row(1, 0), outbox_row(2, 0), outbox_row(3, 3)] {
            store.insert_notification(row).await;
        }

        let first = store.claim_notifications(&claim(10)).await.unwrap();
        let second = store.claim_notifications(&claim(10)).await.unwrap();

        let ids: Vec<Uuid> = first.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
        assert!(second.is_empty());

        store.record_delivery_failure(Uuid::from_u128(1), "timeout").await.unwrap();
        let retry = store.claim_notifications(&claim(10)).await.unwrap();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].id, Uuid::from_u128(1));
        assert_eq!(retry[0].attempts, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_claimable_again() {
        let store = MemoryStore::new();
        store.insert_notification(outbox_row(1, 0)).await;

        let expired = NotificationClaim {
            lease: Duration::zero(),
            ..claim(10)
        };
        assert_eq!(store.claim_notifications(&expired).await.unwrap().len(), 1);
        assert_eq!(store.claim_notifications(&claim(10)).await.unwrap().len(), 1);
    }
}
