use std::sync::Arc;

use uuid::Uuid;

use crate::access::{require, Authorizer, Capability};
use crate::error::{EngineError, Result};
use crate::locks::DeliberationLocks;
use crate::models::{
    Deliberation, DeliberationResult, DeliberationStatus, ResultAmendment, StudentHistoryEntry,
};
use crate::store::DeliberationStore;

/// Read access to compiled results plus the two explicit manual actions:
/// hand-editing one result row and overriding a deliberation's status.
pub struct ResultReader {
    store: Arc<dyn DeliberationStore>,
    authorizer: Arc<dyn Authorizer>,
    locks: Arc<DeliberationLocks>,
}

impl ResultReader {
    pub fn new(
        store: Arc<dyn DeliberationStore>,
        authorizer: Arc<dyn Authorizer>,
        locks: Arc<DeliberationLocks>,
    ) -> Self {
        Self {
            store,
            authorizer,
            locks,
        }
    }

    pub async fn deliberation(&self, actor: Uuid, deliberation_id: Uuid) -> Result<Deliberation> {
        let deliberation = self.load(deliberation_id).await?;
        require(
            self.authorizer.as_ref(),
            actor,
            Capability::ViewResults {
                cohort_id: deliberation.cohort_id,
            },
        )
        .await?;
        Ok(deliberation)
    }

    async fn load(&self, deliberation_id: Uuid) -> Result<Deliberation> {
        self.store
            .deliberation(deliberation_id)
            .await?
            .ok_or_else(|| EngineError::not_found("deliberation", deliberation_id))
    }

    /// Results in rank order.
    pub async fn list_results(
        &self,
        actor: Uuid,
        deliberation_id: Uuid,
    ) -> Result<Vec<DeliberationResult>> {
        self.deliberation(actor, deliberation_id).await?;
        self.store.results(deliberation_id).await
    }

    /// Newest deliberation first, limited to cohorts the actor may view.
    pub async fn student_history(
        &self,
        actor: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<StudentHistoryEntry>> {
        let entries = self.store.student_results(student_id).await?;
        let total = entries.len();

        let mut visible = Vec::with_capacity(total);
        for entry in entries {
            let capability = Capability::ViewResults {
                cohort_id: entry.cohort_id,
            };
            if self.authorizer.allows(actor, &capability).await? {
                visible.push(entry);
            }
        }

        if total > 0 && visible.is_empty() {
            return Err(EngineError::Forbidden {
                actor,
                capability: format!("view results for student {student_id}"),
            });
        }
        Ok(visible)
    }

    /// Edits decision, mention or remarks of one compiled row. The next
    /// compilation replaces the edit.
    pub async fn amend_result(
        &self,
        actor: Uuid,
        deliberation_id: Uuid,
        student_id: Uuid,
        amendment: ResultAmendment,
    ) -> Result<DeliberationResult> {
        if amendment.decision.is_none() && amendment.mention.is_none() && amendment.remarks.is_none()
        {
            return Err(EngineError::invalid("amendment changes nothing"));
        }
        let deliberation = self.load(deliberation_id).await?;
        require(
            self.authorizer.as_ref(),
            actor,
            Capability::CompileDeliberations {
                cohort_id: deliberation.cohort_id,
            },
        )
        .await?;

        let _guard = self.locks.acquire(deliberation_id).await;
        let amended = self
            .store
            .amend_result(deliberation_id, student_id, &amendment)
            .await?;
        tracing::info!(%actor, %deliberation_id, %student_id, decision = %amended.decision, "result amended");
        Ok(amended)
    }

    /// The only way a status moves backwards.
    pub async fn override_status(
        &self,
        actor: Uuid,
        deliberation_id: Uuid,
        status: DeliberationStatus,
    ) -> Result<Deliberation> {
        let deliberation = self.load(deliberation_id).await?;
        require(
            self.authorizer.as_ref(),
            actor,
            Capability::CompileDeliberations {
                cohort_id: deliberation.cohort_id,
            },
        )
        .await?;

        let _guard = self.locks.acquire(deliberation_id).await;
        let updated = self.store.set_status(deliberation_id, status).await?;
        tracing::warn!(
            %actor,
            %deliberation_id,
            from = %deliberation.status,
            to = %updated.status,
            "deliberation status overridden"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Grant, GrantKind, StaticAuthorizer};
    use crate::compiler::DeliberationCompiler;
    use crate::models::{Decision, Mention};
    use crate::policy::Policy;
    use crate::testing::Fixture;

    async fn compiled(authorizer: StaticAuthorizer) -> (Fixture, ResultReader) {
        let fixture = Fixture::build().await;
        let locks = Arc::new(DeliberationLocks::new());
        let compiler = DeliberationCompiler::new(
            fixture.store.clone(),
            fixture.store.clone(),
            Arc::new(StaticAuthorizer::superuser(fixture.officer)),
            Arc::new(Policy::default()),
            locks.clone(),
        );
        compiler
            .compile(fixture.officer, fixture.deliberation_id)
            .await
            .unwrap();
        let reader = ResultReader::new(fixture.store.clone(), Arc::new(authorizer), locks);
        (fixture, reader)
    }

    #[tokio::test]
    async fn results_come_back_in_rank_order() {
        let officer = Uuid::from_u128(0xA1);
        let (fixture, reader) = compiled(StaticAuthorizer::superuser(officer)).await;
        let results = reader
            .list_results(officer, fixture.deliberation_id)
            .await
            .unwrap();
        let ranks: Vec<i32> = results.iter().filter_map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn history_is_hidden_from_other_cohorts() {
        let viewer = Uuid::from_u128(0xE1);
        let (fixture, reader) = compiled(StaticAuthorizer::new(vec![Grant {
            actor: viewer,
            capability: GrantKind::View,
            cohort: Some(Uuid::from_u128(0xFFFF)),
        }]))
        .await;

        let err = reader
            .student_history(viewer, fixture.strong_student)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn history_lists_each_deliberation_for_the_student() {
        let viewer = Uuid::from_u128(0xE1);
        let (fixture, reader) = compiled(StaticAuthorizer::new(vec![Grant {
            actor: viewer,
            capability: GrantKind::View,
            cohort: None,
        }]))
        .await;

        let history = reader
            .student_history(viewer, fixture.strong_student)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].deliberation_id, fixture.deliberation_id);
        assert_eq!(history[0].cohort_id, fixture.cohort_id);
        assert_eq!(history[0].result.decision, Decision::Admitted);
    }

    #[tokio::test]
    async fn amendment_edits_only_the_named_fields() {
        let officer = Uuid::from_u128(0xA1);
        let (fixture, reader) = compiled(StaticAuthorizer::superuser(officer)).await;

        let amended = reader
            .amend_result(
                officer,
                fixture.deliberation_id,
                fixture.weak_student,
                ResultAmendment {
                    decision: Some(Decision::Deferred),
                    mention: None,
                    remarks: Some("Jury granted a retake".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(amended.decision, Decision::Deferred);
        assert_eq!(amended.remarks.as_deref(), Some("Jury granted a retake"));
        assert_eq!(amended.rank, Some(3));
        assert_eq!(amended.mention, None::<Mention>);

        let err = reader
            .amend_result(
                officer,
                fixture.deliberation_id,
                fixture.weak_student,
                ResultAmendment::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn manual_override_can_move_status_back() {
        let officer = Uuid::from_u128(0xA1);
        let (fixture, reader) = compiled(StaticAuthorizer::superuser(officer)).await;

        let updated = reader
            .override_status(officer, fixture.deliberation_id, DeliberationStatus::Draft)
            .await
            .unwrap();
        assert_eq!(updated.status, DeliberationStatus::Draft);

        let err = reader
            .override_status(Uuid::from_u128(0xBAD), fixture.deliberation_id, DeliberationStatus::Compiled)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden { .. }));
    }
}
