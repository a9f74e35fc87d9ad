use chrono::{DateTime, Utc};

use super::{
    entity::{EntryStatus, QueueEntry, Service},
    error::Result,
};

/// Outcome of removing an entry from its queue's pending set.
#[derive(Debug, Clone)]
pub struct Finished {
    pub entry: QueueEntry,
    /// Pending entries of the same queue whose position moved.
    pub shifted: Vec<QueueEntry>,
}

#[derive(Debug, Clone)]
pub struct Transferred {
    pub source: QueueEntry,
    pub destination: QueueEntry,
    pub shifted: Vec<QueueEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceUpdate {
    pub average_duration_secs: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Reconfigured {
    pub service: Service,
    /// Pending entries re-estimated because throughput changed.
    pub reestimated: Vec<QueueEntry>,
}

/// Every mutating method is a single atomic unit, serialized per queue by the store.
#[async_trait::async_trait]
pub trait EntryRepository: Clone + Send + Sync + 'static {
    async fn load(&self, id: i64) -> Result<Option<QueueEntry>>;

    /// Earliest pending entry of the customer.
    async fn load_active(&self, customer_id: i64) -> Result<Option<QueueEntry>>;

    /// All entries of the customer, newest first.
    async fn load_history(&self, customer_id: i64) -> Result<Vec<QueueEntry>>;

    /// Pending entries of a queue in position order.
    async fn load_pending(&self, service_id: i64) -> Result<Vec<QueueEntry>>;

    async fn load_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<i64>>;

    async fn join(
        &self,
        customer_id: i64,
        service_id: i64,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry>;

    /// Compare-and-set from `pending` to `to`, then closes the gap in the queue.
    async fn finish(&self, id: i64, to: EntryStatus, now: DateTime<Utc>) -> Result<Finished>;

    /// Like `finish(Completed)` but only if the entry is still pending and due at `now`.
    /// `None` means another caller got there first or the entry is not due.
    async fn complete_if_due(&self, id: i64, now: DateTime<Utc>) -> Result<Option<Finished>>;

    async fn transfer(
        &self,
        id: i64,
        destination_service_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Transferred>;
}

#[async_trait::async_trait]
pub trait ServiceRepository: Clone + Send + Sync + 'static {
    async fn load(&self, id: i64) -> Result<Option<Service>>;

    async fn create(&self, name: &str, average_duration_secs: i64) -> Result<Service>;

    async fn update(
        &self,
        id: i64,
        update: &ServiceUpdate,
        now: DateTime<Utc>,
    ) -> Result<Reconfigured>;
}
