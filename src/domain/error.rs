use thiserror::Error;

use super::entity::EntryStatus;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The entry already left `pending`; nothing was changed.
    #[error("cannot move entry from {from} to {to}")]
    InvalidTransition { from: EntryStatus, to: EntryStatus },

    #[error("{action} is only allowed within {limit_secs} seconds of joining")]
    WindowExpired {
        action: &'static str,
        limit_secs: i64,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// The source entry is untouched when this is returned.
    #[error("destination service {0} is unavailable")]
    TransferDestinationUnavailable(i64),

    #[error("wait estimate is not available yet")]
    EstimationUnavailable,

    #[error("service {0} is not accepting customers")]
    ServiceInactive(i64),

    /// An entry has at most one transfer link, so a transfer destination stays put.
    #[error("entry {0} was created by a transfer and cannot be transferred again")]
    AlreadyTransferred(i64),

    #[error("entry is already queued at service {0}")]
    SameDestination(i64),

    #[error("entry {entry_id} does not belong to customer {customer_id}")]
    NotOwner { entry_id: i64, customer_id: i64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl QueueError {
    pub fn entry_not_found(id: i64) -> Self {
        QueueError::NotFound { kind: "entry", id }
    }

    pub fn service_not_found(id: i64) -> Self {
        QueueError::NotFound { kind: "service", id }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
