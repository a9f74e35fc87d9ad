use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{QueueEntry, Service};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Joined(EntrySnapshot),
    PositionChanged(EntrySnapshot),
    Completed(EntrySnapshot),
    Cancelled(EntrySnapshot),
    Transferred {
        source: EntrySnapshot,
        destination: EntrySnapshot,
    },
    ServiceUpdated {
        service_id: i64,
        is_active: bool,
        average_duration_secs: i64,
    },
}

impl QueueEvent {
    /// Subject suffix the event is published under.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::Joined(_) => "joined",
            QueueEvent::PositionChanged(_) => "position_changed",
            QueueEvent::Completed(_) => "completed",
            QueueEvent::Cancelled(_) => "cancelled",
            QueueEvent::Transferred { .. } => "transferred",
            QueueEvent::ServiceUpdated { .. } => "service_updated",
        }
    }

    pub fn service_updated(service: &Service) -> Self {
        QueueEvent::ServiceUpdated {
            service_id: service.id,
            is_active: service.is_active,
            average_duration_secs: service.average_duration_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub entry_id: i64,
    pub customer_id: i64,
    pub service_id: i64,
    pub position: Option<i32>,
    pub expected_ready_time: Option<DateTime<Utc>>,
}

impl From<&QueueEntry> for EntrySnapshot {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            entry_id: entry.id,
            customer_id: entry.customer_id,
            service_id: entry.service_id,
            position: entry.position,
            expected_ready_time: entry.expected_ready_time,
        }
    }
}

#[async_trait::async_trait]
pub trait EventTransport: Clone + Send + Sync + 'static {
    async fn publish(&self, event: &QueueEvent) -> Result<()>;
}
