//! Post-compilation grade changes. Every call writes one immutable ledger
//! row, the grade update, the outbox rows and the deliberation status flip
//! in a single store commit.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::access::{require, Authorizer, Capability};
use crate::error::{EngineError, Result};
use crate::locks::DeliberationLocks;
use crate::models::{
    Components, Course, Deliberation, Grade, GradeModification, ModificationType,
    PendingNotification, RecipientRole, Severity, Student,
};
use crate::notify::{DispatchSummary, Dispatcher};
use crate::policy::Policy;
use crate::score;
use crate::store::{AdjustmentCommit, DeliberationStore, EnrollmentDirectory};

#[derive(Debug, Clone)]
pub struct AdjustmentRequest {
    pub grade_id: Uuid,
    /// Unset components keep their current value.
    pub components: Components,
    pub justification: String,
    pub modification_type: ModificationType,
    pub deliberation_id: Option<Uuid>,
    pub approved_by: Option<Uuid>,
    pub approval_notes: Option<String>,
}

impl AdjustmentRequest {
    fn validate(&self) -> Result<()> {
        if self.justification.trim().is_empty() {
            return Err(EngineError::invalid("justification is required"));
        }
        if self.components.is_empty() {
            return Err(EngineError::invalid("no component score supplied"));
        }
        score::validate_components(&self.components)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentReceipt {
    pub modification: GradeModification,
    pub grade: Grade,
    pub deliberation: Option<Deliberation>,
    pub notifications: DispatchSummary,
}

pub struct GradeLedger {
    store: Arc<dyn DeliberationStore>,
    directory: Arc<dyn EnrollmentDirectory>,
    authorizer: Arc<dyn Authorizer>,
    policy: Arc<Policy>,
    locks: Arc<DeliberationLocks>,
    dispatcher: Dispatcher,
}

impl GradeLedger {
    pub fn new(
        store: Arc<dyn DeliberationStore>,
        directory: Arc<dyn EnrollmentDirectory>,
        authorizer: Arc<dyn Authorizer>,
        policy: Arc<Policy>,
        locks: Arc<DeliberationLocks>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            directory,
            authorizer,
            policy,
            locks,
            dispatcher,
        }
    }

    #[tracing::instrument(skip_all, fields(%actor, grade = %request.grade_id))]
    pub async fn adjust(&self, actor: Uuid, request: AdjustmentRequest) -> Result<AdjustmentReceipt> {
        request.validate()?;
        require(self.authorizer.as_ref(), actor, Capability::AdjustGrades).await?;

        let grade = self.load_grade(request.grade_id).await?;
        let course = self
            .directory
            .course(grade.course_id)
            .await?
            .ok_or_else(|| EngineError::not_found("course", grade.course_id))?;
        if let Some(id) = request.deliberation_id {
            let deliberation = self.load_deliberation(id).await?;
            let student = self
                .directory
                .student(grade.student_id)
                .await?
                .ok_or_else(|| EngineError::not_found("student", grade.student_id))?;
            ensure_covers(&deliberation, &grade, &student, &course)?;
        }

        let guard = self.locks.acquire_optional(request.deliberation_id).await;
        // re-read under the lock so the versions we commit against are current
        let grade = self.load_grade(request.grade_id).await?;
        let deliberation = match request.deliberation_id {
            Some(id) => Some(self.load_deliberation(id).await?),
            None => None,
        };

        let new_components = grade.components.overlay(&request.components);
        let outcome = score::evaluate(&new_components, &self.policy.weights)?;

        let modification = GradeModification {
            id: Uuid::new_v4(),
            grade_id: grade.id,
            old_components: grade.components,
            new_components,
            old_final_score: grade.final_score,
            new_final_score: outcome.final_score,
            justification: request.justification.trim().to_string(),
            modification_type: request.modification_type,
            modified_by: actor,
            deliberation_id: request.deliberation_id,
            grader_notified: false,
            president_notified: false,
            approved_by: request.approved_by,
            approval_notes: request.approval_notes.clone(),
            created_at: Utc::now(),
        };
        let notifications = outbox_rows(&modification, &course, deliberation.as_ref());

        let applied = self
            .store
            .apply_adjustment(&AdjustmentCommit {
                grade_id: grade.id,
                expected_grade_version: grade.version,
                components: new_components,
                final_score: outcome.final_score,
                letter: outcome.letter,
                modification: modification.clone(),
                notifications,
                deliberation_id: request.deliberation_id,
            })
            .await?;
        drop(guard);

        tracing::info!(
            modification = %modification.id,
            old_final = ?modification.old_final_score,
            new_final = ?modification.new_final_score,
            status = ?applied.deliberation.as_ref().map(|d| d.status),
            "grade adjusted"
        );

        // committed data stands even if every channel is down
        let notifications = match self.dispatcher.dispatch_for(modification.id).await {
            Ok(summary) => summary,
            Err(err) => {
                tracing::warn!(modification = %modification.id, error = %err, "outbox drain failed");
                DispatchSummary::default()
            }
        };

        Ok(AdjustmentReceipt {
            modification,
            grade: applied.grade,
            deliberation: applied.deliberation,
            notifications,
        })
    }

    async fn load_grade(&self, grade_id: Uuid) -> Result<Grade> {
        self.store
            .grade(grade_id)
            .await?
            .ok_or_else(|| EngineError::not_found("grade", grade_id))
    }

    async fn load_deliberation(&self, deliberation_id: Uuid) -> Result<Deliberation> {
        self.store
            .deliberation(deliberation_id)
            .await?
            .ok_or_else(|| EngineError::not_found("deliberation", deliberation_id))
    }

    /// Ledger rows for one grade, oldest first.
    pub async fn history(&self, actor: Uuid, grade_id: Uuid) -> Result<Vec<GradeModification>> {
        require(self.authorizer.as_ref(), actor, Capability::AdjustGrades).await?;
        if self.store.grade(grade_id).await?.is_none() {
            return Err(EngineError::not_found("grade", grade_id));
        }
        self.store.modifications(grade_id).await
    }
}

/// A deliberation covers a grade when the student sits in its cohort, the
/// term matches and its semester filter, if any, includes the course.
fn ensure_covers(
    deliberation: &Deliberation,
    grade: &Grade,
    student: &Student,
    course: &Course,
) -> Result<()> {
    let semester_matches = deliberation
        .semester
        .as_deref()
        .map_or(true, |semester| semester == course.semester);
    if student.cohort_id != deliberation.cohort_id
        || grade.term != deliberation.term
        || !semester_matches
    {
        return Err(EngineError::invalid(format!(
            "grade {} is outside deliberation {} (cohort {}, term {})",
            grade.id, deliberation.id, deliberation.cohort_id, deliberation.term
        )));
    }
    Ok(())
}

fn describe(score: Option<f64>) -> String {
    score.map_or_else(|| "none".to_string(), |value| format!("{value:.2}"))
}

fn outbox_rows(
    modification: &GradeModification,
    course: &Course,
    deliberation: Option<&Deliberation>,
) -> Vec<PendingNotification> {
    let link = format!(
        "/grades/{}/modifications/{}",
        modification.grade_id, modification.id
    );
    let change = format!(
        "Final score changed from {} to {} ({}): {}",
        describe(modification.old_final_score),
        describe(modification.new_final_score),
        modification.modification_type,
        modification.justification
    );

    let mut rows = Vec::new();
    if let Some(teacher_id) = course.teacher_id {
        rows.push(PendingNotification {
            id: Uuid::new_v4(),
            modification_id: modification.id,
            recipient_id: teacher_id,
            recipient_role: RecipientRole::Grader,
            title: format!("Grade amended in {}", course.code),
            message: change.clone(),
            severity: Severity::Info,
            link: Some(link.clone()),
            attempts: 0,
            last_error: None,
            delivered_at: None,
        });
    }
    if let Some(president_id) = deliberation.and_then(|d| d.president_id) {
        rows.push(PendingNotification {
            id: Uuid::new_v4(),
            modification_id: modification.id,
            recipient_id: president_id,
            recipient_role: RecipientRole::President,
            title: format!("Grade amended after deliberation ({})", course.code),
            message: change,
            severity: Severity::Warning,
            link: Some(link),
            attempts: 0,
            last_error: None,
            delivered_at: None,
        });
    }
    rows
}
