//! Notification outbox. Ledger commits write pending rows; the dispatcher
//! hands them to a [`NotificationSink`] and records the outcome. A failed
//! delivery is logged and left pending for a later pass.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{PendingNotification, Severity};
use crate::store::{DeliberationStore, NotificationClaim};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub recipient_id: Uuid,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub link: Option<String>,
}

impl From<&PendingNotification> for Notification {
    fn from(pending: &PendingNotification) -> Self {
        Self {
            recipient_id: pending.recipient_id,
            title: pending.title.clone(),
            message: pending.message.clone(),
            severity: pending.severity,
            link: pending.link.clone(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Writes each notification to the log. Used by the CLI when no real
/// channel is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            recipient = %notification.recipient_id,
            severity = %notification.severity,
            title = %notification.title,
            link = notification.link.as_deref().unwrap_or(""),
            "notification delivered"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub failed: usize,
}

pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn DeliberationStore>,
    sink: Arc<dyn NotificationSink>,
    max_attempts: i32,
    lease: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn DeliberationStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            sink,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease: Duration::minutes(5),
        }
    }

    /// Rows that failed `max_attempts` times are no longer retried.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn claim(&self, modification_id: Option<Uuid>, limit: usize) -> NotificationClaim {
        NotificationClaim {
            modification_id,
            limit,
            max_attempts: self.max_attempts,
            lease: self.lease,
        }
    }

    pub async fn dispatch_pending(&self, limit: usize) -> Result<DispatchSummary> {
        let pending = self.store.claim_notifications(&self.claim(None, limit)).await?;
        self.deliver_all(&pending).await
    }

    pub async fn dispatch_for(&self, modification_id: Uuid) -> Result<DispatchSummary> {
        let pending = self
            .store
            .claim_notifications(&self.claim(Some(modification_id), usize::MAX))
            .await?;
        self.deliver_all(&pending).await
    }

    async fn deliver_all(&self, pending: &[PendingNotification]) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        for notification in pending {
            match self.sink.deliver(&Notification::from(notification)).await {
                Ok(()) => {
                    self.store.mark_delivered(notification.id).await?;
                    summary.delivered += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        notification = %notification.id,
                        modification = %notification.modification_id,
                        role = %notification.recipient_role,
                        error = %err,
                        "notification delivery failed; left pending"
                    );
                    self.store
                        .record_delivery_failure(notification.id, &err.to_string())
                        .await?;
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}
