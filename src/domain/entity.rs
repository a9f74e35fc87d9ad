use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{
    error::QueueError,
    estimator::{self, Remaining, WaitEstimate},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Completed,
    Cancelled,
    Transferred,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Completed => "completed",
            EntryStatus::Cancelled => "cancelled",
            EntryStatus::Transferred => "transferred",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "completed" => Ok(EntryStatus::Completed),
            "cancelled" => Ok(EntryStatus::Cancelled),
            "transferred" => Ok(EntryStatus::Transferred),
            other => Err(anyhow::anyhow!("unknown entry status: {}", other)),
        }
    }
}

/// A logical queue: one service at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub is_active: bool,

    // Throughput, injected by the business
    pub average_duration_secs: i64,
}

impl Service {
    pub fn average_duration(&self) -> Result<Duration, QueueError> {
        estimator::average_duration(self.average_duration_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    // ID
    pub id: i64,
    pub service_id: i64,
    pub customer_id: i64,

    // Lifecycle
    pub status: EntryStatus,
    pub time_created: DateTime<Utc>,
    pub time_finished: Option<DateTime<Utc>>,

    // Ordering and estimate, only meaningful while pending
    pub position: Option<i32>,
    pub total_wait: Option<i64>,
    pub expected_ready_time: Option<DateTime<Utc>>,

    // Transfer links
    pub transferred_from_id: Option<i64>,
    pub transferred_to_id: Option<i64>,
}

impl QueueEntry {
    /// A pending entry that has not been ranked yet. Stores assign `id` and `position`.
    pub fn new(
        id: i64,
        service_id: i64,
        customer_id: i64,
        time_created: DateTime<Utc>,
        transferred_from_id: Option<i64>,
    ) -> Self {
        Self {
            id,
            service_id,
            customer_id,
            status: EntryStatus::Pending,
            time_created,
            time_finished: None,
            position: None,
            total_wait: None,
            expected_ready_time: None,
            transferred_from_id,
            transferred_to_id: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending()
            && self
                .expected_ready_time
                .map(|ready| ready <= now)
                .unwrap_or(false)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        now - self.time_created
    }

    pub fn apply_estimate(&mut self, estimate: WaitEstimate) {
        self.total_wait = Some(estimate.total_wait);
        self.expected_ready_time = Some(estimate.expected_ready_time);
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Result<Remaining, QueueError> {
        match (self.position, self.expected_ready_time) {
            (Some(position), Some(ready)) if position > 0 => Ok(estimator::remaining(ready, now)),
            _ => Err(QueueError::EstimationUnavailable),
        }
    }

    /// Marks the entry terminal. Callers go through `lifecycle::transition` first.
    pub fn finish(&mut self, status: EntryStatus, now: DateTime<Utc>) {
        self.status = status;
        self.position = None;
        self.time_finished = Some(now);
    }
}
