//! Notification and work-queue adapters
//!
//! - `TracingDispatcher`: logs pages instead of delivering them
//! - `DedupDispatcher`: suppresses repeated deliveries of the same key
//! - `ChannelWorkQueue`: tokio mpsc hand-off from scheduler to driver

use crate::error::{EscalationError, Result};
use crate::traits::{Clock, NotificationDispatcher, NotificationKey, WorkQueue};
use crate::types::{Target, UserRef};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Dispatcher that only writes a log line per page
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDispatcher;

#[async_trait]
impl NotificationDispatcher for TracingDispatcher {
    async fn notify_oncall(
        &self,
        users: &[UserRef],
        target: &Target,
        key: NotificationKey,
    ) -> Result<()> {
        let recipients = users
            .iter()
            .map(|user| user.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            alert_id = target.id,
            key = %key,
            "Paging {} for alert '{}'",
            recipients,
            target.title
        );
        Ok(())
    }
}

/// Wraps a dispatcher and drops deliveries whose key was already sent
///
/// Keys are remembered for `retention` as measured by `clock`; a failed
/// delivery is not remembered.
pub struct DedupDispatcher {
    inner: Arc<dyn NotificationDispatcher>,
    sent: DashMap<NotificationKey, DateTime<Utc>>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl DedupDispatcher {
    pub fn new(
        inner: Arc<dyn NotificationDispatcher>,
        retention: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            sent: DashMap::new(),
            retention,
            clock,
        }
    }

    /// Forget keys older than the retention window
    pub fn purge(&self, now: DateTime<Utc>) -> usize {
        let before = self.sent.len();
        self.sent.retain(|_, sent_at| now - *sent_at < self.retention);
        before - self.sent.len()
    }

    pub fn remembered(&self) -> usize {
        self.sent.len()
    }
}

#[async_trait]
impl NotificationDispatcher for DedupDispatcher {
    async fn notify_oncall(
        &self,
        users: &[UserRef],
        target: &Target,
        key: NotificationKey,
    ) -> Result<()> {
        let now = self.clock.now();
        self.purge(now);

        // Reserve the key before delivering so concurrent callers back off
        match self.sent.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!("Suppressing duplicate page {}", key);
                return Ok(());
            },
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
            },
        }

        let result = self.inner.notify_oncall(users, target, key).await;
        if result.is_err() {
            self.sent.remove(&key);
        }
        result
    }
}

/// Work queue backed by a bounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelWorkQueue {
    sender: mpsc::Sender<i64>,
}

/// Receiving half drained by the driver
#[derive(Debug)]
pub struct WorkQueueReceiver {
    receiver: mpsc::Receiver<i64>,
}

impl ChannelWorkQueue {
    pub fn new(capacity: usize) -> (Self, WorkQueueReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, WorkQueueReceiver { receiver })
    }
}

/// Never waits for capacity: ids that do not fit are left to the driver's
/// `claim_due` poll.
#[async_trait]
impl WorkQueue for ChannelWorkQueue {
    async fn enqueue(&self, escalation_ids: &[i64]) -> Result<()> {
        for (index, id) in escalation_ids.iter().enumerate() {
            match self.sender.try_send(*id) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Work queue full, {} escalations left for the next poll",
                        escalation_ids.len() - index
                    );
                    break;
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(EscalationError::Queue("work queue receiver dropped".into()));
                },
            }
        }
        Ok(())
    }
}

impl WorkQueueReceiver {
    /// Take up to `max` queued ids without waiting
    pub fn drain(&mut self, max: usize) -> Vec<i64> {
        let mut ids = Vec::new();
        while ids.len() < max {
            match self.receiver.try_recv() {
                Ok(id) => ids.push(id),
                Err(_) => break,
            }
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
