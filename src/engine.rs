use std::sync::Arc;

use uuid::Uuid;

use crate::access::Authorizer;
use crate::compiler::DeliberationCompiler;
use crate::error::Result;
use crate::ledger::GradeLedger;
use crate::locks::DeliberationLocks;
use crate::notify::{Dispatcher, NotificationSink};
use crate::policy::Policy;
use crate::reader::ResultReader;
use crate::report::DeliberationReport;
use crate::store::{DeliberationStore, EnrollmentDirectory};

/// All engine services wired over one store, sharing one lock table so
/// compilation, adjustment and manual edits on the same deliberation queue
/// behind each other.
pub struct Engine {
    pub compiler: DeliberationCompiler,
    pub ledger: GradeLedger,
    pub reader: ResultReader,
    pub dispatcher: Dispatcher,
    directory: Arc<dyn EnrollmentDirectory>,
}

impl Engine {
    pub fn new<S>(
        store: Arc<S>,
        authorizer: Arc<dyn Authorizer>,
        sink: Arc<dyn NotificationSink>,
        policy: Policy,
    ) -> Result<Self>
    where
        S: DeliberationStore + EnrollmentDirectory + 'static,
    {
        policy.validate()?;
        let policy = Arc::new(policy);
        let locks = Arc::new(DeliberationLocks::new());
        let records: Arc<dyn DeliberationStore> = store.clone();
        let directory: Arc<dyn EnrollmentDirectory> = store;
        let dispatcher = Dispatcher::new(records.clone(), sink);

        Ok(Self {
            compiler: DeliberationCompiler::new(
                records.clone(),
                directory.clone(),
                authorizer.clone(),
                policy.clone(),
                locks.clone(),
            ),
            ledger: GradeLedger::new(
                records.clone(),
                directory.clone(),
                authorizer.clone(),
                policy,
                locks.clone(),
                dispatcher.clone(),
            ),
            reader: ResultReader::new(records, authorizer, locks),
            dispatcher,
            directory,
        })
    }

    /// Compiled results joined with student names, for rendering.
    pub async fn report(&self, actor: Uuid, deliberation_id: Uuid) -> Result<DeliberationReport> {
        let deliberation = self.reader.deliberation(actor, deliberation_id).await?;
        let results = self.reader.list_results(actor, deliberation_id).await?;
        let roster = self
            .directory
            .roster(
                deliberation.cohort_id,
                &deliberation.term,
                deliberation.semester.as_deref(),
            )
            .await?;
        Ok(DeliberationReport::new(deliberation, &results, &roster))
    }
}
