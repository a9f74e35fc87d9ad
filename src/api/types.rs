use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entity::{EntryStatus, Service};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(alias = "user_id")]
    pub customer_id: i64,
    pub service_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub message: String,
    pub queue_id: i64,
    pub position: Option<i32>,
    pub expected_ready_time: Option<DateTime<Utc>>,
    pub estimated_wait_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDetail {
    pub queue_id: i64,
    pub service_id: i64,
    pub service_name: String,
    pub current_position: Option<i32>,
    pub total_wait: Option<i64>,
    pub expected_ready_time: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    pub time_created: DateTime<Utc>,
    pub is_transferred: bool,
    pub original_queue_id: Option<i64>,

    // Seconds until ready, 0 once processing is imminent. Null while no estimate exists.
    pub remaining_wait: Option<i64>,
    pub processing_imminent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveResponse {
    pub message: String,
    pub queue_id: i64,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub queue_id: i64,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckCompleteResponse {
    pub queue_id: i64,
    pub status: EntryStatus,
    pub message: String,
    pub remaining_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub original_queue_id: i64,
    pub target_service_id: i64,
    #[serde(alias = "user_id")]
    pub customer_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResponse {
    pub message: String,
    pub queue_id: i64,
    pub original_queue_id: i64,
    pub service_name: String,
    pub position: Option<i32>,
    pub expected_ready_time: Option<DateTime<Utc>>,
    pub estimated_wait_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: i64,
    pub service_id: i64,
    pub service_name: String,
    pub status: EntryStatus,
    pub date_created: DateTime<Utc>,
    pub date_finished: Option<DateTime<Utc>>,
    /// Seconds.
    pub waiting_time: Option<i64>,
    pub position: Option<i32>,
    pub transferred_from: Option<i64>,
    pub transferred_to: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub average_duration_secs: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateServiceRequest {
    pub average_duration_secs: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub service_id: i64,
    pub name: String,
    pub is_active: bool,
    pub current_customers: usize,
    pub average_duration_secs: i64,
}

impl ServiceSummary {
    pub fn new(service: Service, current_customers: usize) -> Self {
        Self {
            service_id: service.id,
            name: service.name,
            is_active: service.is_active,
            current_customers,
            average_duration_secs: service.average_duration_secs,
        }
    }
}
