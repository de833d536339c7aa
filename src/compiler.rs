use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::access::{require, Authorizer, Capability};
use crate::decision::{self, ClassifierInput};
use crate::error::{EngineError, Result};
use crate::locks::DeliberationLocks;
use crate::models::{Decision, Deliberation, DeliberationResult, RosterEntry};
use crate::policy::{AverageMode, Policy};
use crate::ranking::assign_ranks;
use crate::score;
use crate::store::{DeliberationStore, EnrollmentDirectory, ResultSetCommit};

#[derive(Debug, Clone, Serialize)]
pub struct CompilationReport {
    pub deliberation: Deliberation,
    pub results: Vec<DeliberationResult>,
    /// Refused students the enrollment service should review for standing.
    pub standing_review: Vec<Uuid>,
}

pub struct DeliberationCompiler {
    store: Arc<dyn DeliberationStore>,
    directory: Arc<dyn EnrollmentDirectory>,
    authorizer: Arc<dyn Authorizer>,
    policy: Arc<Policy>,
    locks: Arc<DeliberationLocks>,
}

impl DeliberationCompiler {
    pub fn new(
        store: Arc<dyn DeliberationStore>,
        directory: Arc<dyn EnrollmentDirectory>,
        authorizer: Arc<dyn Authorizer>,
        policy: Arc<Policy>,
        locks: Arc<DeliberationLocks>,
    ) -> Self {
        Self {
            store,
            directory,
            authorizer,
            policy,
            locks,
        }
    }

    async fn load(&self, deliberation_id: Uuid) -> Result<Deliberation> {
        self.store
            .deliberation(deliberation_id)
            .await?
            .ok_or_else(|| EngineError::not_found("deliberation", deliberation_id))
    }

    /// Recomputes and replaces the full result set of one deliberation.
    #[tracing::instrument(skip_all, fields(%actor, %deliberation_id))]
    pub async fn compile(&self, actor: Uuid, deliberation_id: Uuid) -> Result<CompilationReport> {
        let scoped = self.load(deliberation_id).await?;
        require(
            self.authorizer.as_ref(),
            actor,
            Capability::CompileDeliberations {
                cohort_id: scoped.cohort_id,
            },
        )
        .await?;

        let _guard = self.locks.acquire(deliberation_id).await;
        // re-read under the lock so the version we commit against is current
        let deliberation = self.load(deliberation_id).await?;

        let roster = self
            .directory
            .roster(
                deliberation.cohort_id,
                &deliberation.term,
                deliberation.semester.as_deref(),
            )
            .await?;
        tracing::debug!(students = roster.len(), "roster loaded");

        let results = roster
            .iter()
            .map(|entry| aggregate(entry, &deliberation, &self.policy))
            .collect::<Result<Vec<_>>>()?;
        let ranked = assign_ranks(results, self.policy.ranking_mode);

        let committed = self
            .store
            .replace_results(&ResultSetCommit {
                deliberation_id,
                expected_version: deliberation.version,
                results: ranked.clone(),
                status: deliberation.status.after_compile(),
            })
            .await?;

        let standing_review = ranked
            .iter()
            .filter(|result| result.decision == Decision::Refused)
            .map(|result| result.student_id)
            .collect();

        tracing::info!(
            results = ranked.len(),
            status = %committed.status,
            version = committed.version,
            "deliberation compiled"
        );

        Ok(CompilationReport {
            deliberation: committed,
            results: ranked,
            standing_review,
        })
    }

    /// Single-student result with the same policy as [`compile`](Self::compile),
    /// unranked and never persisted.
    pub async fn preview_student(
        &self,
        actor: Uuid,
        deliberation_id: Uuid,
        student_id: Uuid,
    ) -> Result<DeliberationResult> {
        let deliberation = self.load(deliberation_id).await?;
        require(
            self.authorizer.as_ref(),
            actor,
            Capability::ViewResults {
                cohort_id: deliberation.cohort_id,
            },
        )
        .await?;

        let roster = self
            .directory
            .roster(
                deliberation.cohort_id,
                &deliberation.term,
                deliberation.semester.as_deref(),
            )
            .await?;
        let entry = roster
            .iter()
            .find(|entry| entry.student.id == student_id)
            .ok_or_else(|| EngineError::not_found("student", student_id))?;

        aggregate(entry, &deliberation, &self.policy)
    }
}

/// One student's unranked result. Final scores are recomputed from the raw
/// components so stored derived values can never drift into a decision.
pub fn aggregate(
    entry: &RosterEntry,
    deliberation: &Deliberation,
    policy: &Policy,
) -> Result<DeliberationResult> {
    let mut credits_required = 0;
    let mut credits_obtained = 0;
    let mut graded: Vec<(f64, i32)> = Vec::new();

    for enrolled in &entry.courses {
        let credits = enrolled.course.credits;
        if credits <= 0 {
            return Err(EngineError::invalid(format!(
                "course {} has non-positive credit weight {credits}",
                enrolled.course.code
            )));
        }
        credits_required += credits;

        let final_score = match &enrolled.grade {
            Some(grade) => score::compute_final_score(&grade.components, &policy.weights)?,
            None => None,
        };
        if let Some(final_score) = final_score {
            if final_score >= deliberation.pass_mark {
                credits_obtained += credits;
            }
            graded.push((final_score, credits));
        }
    }

    let average = average(&graded, policy.average_mode);
    let ungraded = entry.courses.len() - graded.len();
    let remarks = (ungraded > 0).then(|| format!("{ungraded} of {} courses ungraded", entry.courses.len()));

    Ok(DeliberationResult {
        deliberation_id: deliberation.id,
        student_id: entry.student.id,
        average,
        credits_obtained,
        credits_required,
        decision: decision::classify(
            &ClassifierInput {
                average,
                credits_obtained,
                credits_required,
                blocked: entry.student.payment_blocked,
            },
            &policy.decision_bands,
        )?,
        rank: None,
        mention: decision::mention(average),
        remarks,
    })
}

fn average(graded: &[(f64, i32)], mode: AverageMode) -> Option<f64> {
    if graded.is_empty() {
        return None;
    }
    let raw = match mode {
        AverageMode::Simple => {
            graded.iter().map(|(score, _)| score).sum::<f64>() / graded.len() as f64
        }
        AverageMode::CreditWeighted => {
            let credits: i32 = graded.iter().map(|(_, credits)| credits).sum();
            graded
                .iter()
                .map(|(score, credits)| score * f64::from(*credits))
                .sum::<f64>()
                / f64::from(credits)
        }
    };
    Some(score::round_half_up(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StaticAuthorizer;
    use crate::models::{DeliberationStatus, Mention};
    use crate::store::memory::FailPoint;
    use crate::store::MemoryStore;
    use crate::testing::Fixture;

    fn compiler(fixture: &Fixture, authorizer: StaticAuthorizer) -> DeliberationCompiler {
        DeliberationCompiler::new(
            fixture.store.clone(),
            fixture.store.clone(),
            Arc::new(authorizer),
            Arc::new(Policy::default()),
            Arc::new(DeliberationLocks::new()),
        )
    }

    #[tokio::test]
    async fn compile_classifies_ranks_and_advances_status() {
        let fixture = Fixture::build().await;
        let compiler = compiler(&fixture, StaticAuthorizer::superuser(fixture.officer));

        let report = compiler
            .compile(fixture.officer, fixture.deliberation_id)
            .await
            .unwrap();

        assert_eq!(report.deliberation.status, DeliberationStatus::Compiled);
        assert_eq!(report.results.len(), 3);

        let top = &report.results[0];
        assert_eq!(top.student_id, fixture.blocked_student);
        assert_eq!(top.rank, Some(1));
        assert_eq!(top.decision, Decision::Blocked);
        assert_eq!(top.mention, Some(Mention::Excellent));

        let strong = &report.results[1];
        assert_eq!(strong.student_id, fixture.strong_student);
        assert_eq!(strong.average, Some(13.5));
        assert_eq!(strong.credits_obtained, 10);
        assert_eq!(strong.credits_required, 10);
        assert_eq!(strong.decision, Decision::Admitted);
        assert_eq!(strong.mention, Some(Mention::FairlyGood));

        let weak = &report.results[2];
        assert_eq!(weak.student_id, fixture.weak_student);
        assert_eq!(weak.rank, Some(3));
        assert_eq!(weak.credits_obtained, 0);
        assert_eq!(weak.decision, Decision::Refused);
        assert_eq!(report.standing_review, vec![fixture.weak_student]);

        let stored = fixture.store.results(fixture.deliberation_id).await.unwrap();
        assert_eq!(stored, report.results);
    }

    #[tokio::test]
    async fn recompiling_unchanged_grades_is_idempotent() {
        let fixture = Fixture::build().await;
        let compiler = compiler(&fixture, StaticAuthorizer::superuser(fixture.officer));

        let first = compiler
            .compile(fixture.officer, fixture.deliberation_id)
            .await
            .unwrap();
        let second = compiler
            .compile(fixture.officer, fixture.deliberation_id)
            .await
            .unwrap();

        assert_eq!(first.results, second.results);
        assert_eq!(second.deliberation.status, DeliberationStatus::Compiled);
    }

    #[tokio::test]
    async fn failed_replace_leaves_previous_result_set_intact() {
        let fixture = Fixture::build().await;
        let compiler = compiler(&fixture, StaticAuthorizer::superuser(fixture.officer));
        let committed = compiler
            .compile(fixture.officer, fixture.deliberation_id)
            .await
            .unwrap();

        fixture
            .set_exam(fixture.weak_grade, Some(19.5))
            .await;
        fixture.store.fail_next(FailPoint::MidResultReplace).await;

        let err = compiler
            .compile(fixture.officer, fixture.deliberation_id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));

        let stored = fixture.store.results(fixture.deliberation_id).await.unwrap();
        assert_eq!(stored, committed.results);
        let deliberation = fixture
            .store
            .deliberation(fixture.deliberation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deliberation.version, committed.deliberation.version);
    }

    #[tokio::test]
    async fn unknown_deliberation_is_not_found() {
        let fixture = Fixture::build().await;
        let compiler = compiler(&fixture, StaticAuthorizer::superuser(fixture.officer));
        let err = compiler
            .compile(fixture.officer, Uuid::from_u128(999))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "deliberation", .. }));
    }

    #[tokio::test]
    async fn compile_requires_cohort_capability() {
        let fixture = Fixture::build().await;
        let compiler = compiler(&fixture, StaticAuthorizer::default());
        let err = compiler
            .compile(fixture.officer, fixture.deliberation_id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden { .. }));
        assert!(fixture
            .store
            .results(fixture.deliberation_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn preview_matches_compiled_row_without_rank() {
        let fixture = Fixture::build().await;
        let compiler = compiler(&fixture, StaticAuthorizer::superuser(fixture.officer));

        let preview = compiler
            .preview_student(fixture.officer, fixture.deliberation_id, fixture.strong_student)
            .await
            .unwrap();
        assert_eq!(preview.rank, None);

        let report = compiler
            .compile(fixture.officer, fixture.deliberation_id)
            .await
            .unwrap();
        let compiled = report
            .results
            .iter()
            .find(|r| r.student_id == fixture.strong_student)
            .unwrap();
        assert_eq!(preview.decision, compiled.decision);
        assert_eq!(preview.average, compiled.average);
        assert!(fixture
            .store
            .results(fixture.deliberation_id)
            .await
            .unwrap()
            .iter()
            .all(|r| r.rank.is_some()));
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let store = Arc::new(MemoryStore::new());
        let fixture = Fixture::build_on(store.clone()).await;
        let deliberation = store
            .deliberation(fixture.deliberation_id)
            .await
            .unwrap()
            .unwrap();
        store
            .set_status(fixture.deliberation_id, DeliberationStatus::InSession)
            .await
            .unwrap();

        let err = store
            .replace_results(&ResultSetCommit {
                deliberation_id: fixture.deliberation_id,
                expected_version: deliberation.version,
                results: Vec::new(),
                status: DeliberationStatus::Compiled,
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn credit_weighted_average_uses_course_credits() {
        let graded = [(16.0, 6), (10.0, 2)];
        assert_eq!(average(&graded, AverageMode::Simple), Some(13.0));
        assert_eq!(average(&graded, AverageMode::CreditWeighted), Some(14.5));
        assert_eq!(average(&[], AverageMode::Simple), None);
    }
}
