use super::{
    entity::EntryStatus,
    error::{QueueError, Result},
};

/// `pending` is the only non-terminal state and every edge leaves it.
pub fn transition(from: EntryStatus, to: EntryStatus) -> Result<EntryStatus> {
    match (from, to) {
        (EntryStatus::Pending, EntryStatus::Completed)
        | (EntryStatus::Pending, EntryStatus::Cancelled)
        | (EntryStatus::Pending, EntryStatus::Transferred) => Ok(to),
        _ => Err(QueueError::InvalidTransition { from, to }),
    }
}
