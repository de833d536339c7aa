//! Capability checks. Policy lives with the identity service; the engine
//! only asks yes/no questions of an [`Authorizer`].

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    CompileDeliberations { cohort_id: Uuid },
    AdjustGrades,
    ViewResults { cohort_id: Uuid },
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::CompileDeliberations { cohort_id } => {
                write!(f, "compile deliberations for cohort {cohort_id}")
            }
            Capability::AdjustGrades => f.write_str("adjust grades"),
            Capability::ViewResults { cohort_id } => {
                write!(f, "view results for cohort {cohort_id}")
            }
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn allows(&self, actor: Uuid, capability: &Capability) -> Result<bool>;
}

pub async fn require(authorizer: &dyn Authorizer, actor: Uuid, capability: Capability) -> Result<()> {
    if authorizer.allows(actor, &capability).await? {
        Ok(())
    } else {
        tracing::warn!(%actor, %capability, "capability check failed");
        Err(EngineError::Forbidden {
            actor,
            capability: capability.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    Compile,
    Adjust,
    View,
}

/// One configured permission. A grant without a cohort covers every cohort.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Grant {
    pub actor: Uuid,
    pub capability: GrantKind,
    #[serde(default)]
    pub cohort: Option<Uuid>,
}

impl Grant {
    fn covers(&self, actor: Uuid, capability: &Capability) -> bool {
        if self.actor != actor {
            return false;
        }
        let cohort_matches = |cohort_id: &Uuid| self.cohort.map_or(true, |c| c == *cohort_id);
        match (self.capability, capability) {
            (GrantKind::Compile, Capability::CompileDeliberations { cohort_id }) => {
                cohort_matches(cohort_id)
            }
            (GrantKind::View, Capability::ViewResults { cohort_id }) => cohort_matches(cohort_id),
            // whoever may compile a cohort may also read its results
            (GrantKind::Compile, Capability::ViewResults { cohort_id }) => {
                cohort_matches(cohort_id)
            }
            (GrantKind::Adjust, Capability::AdjustGrades) => true,
            _ => false,
        }
    }
}

/// Fixed grant list, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    grants: Vec<Grant>,
}

impl StaticAuthorizer {
    pub fn new(grants: Vec<Grant>) -> Self {
        Self { grants }
    }

    /// Every capability on every cohort for one actor.
    pub fn superuser(actor: Uuid) -> Self {
        Self::new(
            [GrantKind::Compile, GrantKind::Adjust, GrantKind::View]
                .into_iter()
                .map(|capability| Grant {
                    actor,
                    capability,
                    cohort: None,
                })
                .collect(),
        )
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn allows(&self, actor: Uuid, capability: &Capability) -> Result<bool> {
        Ok(self.grants.iter().any(|grant| grant.covers(actor, capability)))
    }
}
