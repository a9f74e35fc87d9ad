use crate::domain::{entity::Service, error::Result};

use self::types::*;

pub mod http;
pub mod service;
pub mod sweep;
pub mod types;

#[async_trait::async_trait]
pub trait QueueService: Clone + Send + Sync + 'static {
    async fn join(&self, req: JoinRequest) -> Result<JoinResponse>;

    /// Also runs the auto-completion check for the entry.
    async fn detail(&self, id: i64) -> Result<QueueDetail>;

    async fn active(&self, customer_id: i64) -> Result<Option<QueueDetail>>;

    async fn leave(&self, id: i64) -> Result<LeaveResponse>;

    async fn complete(&self, id: i64) -> Result<CompleteResponse>;

    async fn check_complete(&self, id: i64) -> Result<CheckCompleteResponse>;

    async fn transfer(&self, req: TransferRequest) -> Result<TransferResponse>;

    async fn history(&self, customer_id: i64) -> Result<Vec<HistoryItem>>;

    async fn create_service(&self, req: CreateServiceRequest) -> Result<Service>;

    async fn update_service(&self, id: i64, req: UpdateServiceRequest) -> Result<Service>;

    async fn service_summary(&self, id: i64) -> Result<ServiceSummary>;

    /// Auto-completes up to `limit` due entries, returns how many this call completed.
    async fn sweep(&self, limit: i64) -> Result<usize>;
}
