use anyhow::Context;
use chrono::{DateTime, Duration, Utc};

use super::{entity::QueueEntry, error::Result, estimator};

pub fn fifo_order(pending: &mut [QueueEntry]) {
    pending.sort_by(|a, b| {
        a.time_created
            .cmp(&b.time_created)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Ranks the pending set of one queue 1..=N in FIFO order.
///
/// Only entries whose rank moved (or that had none) get a fresh estimate; the rest
/// keep their ready time. Returns the ids that moved.
pub fn recompute(
    pending: &mut [QueueEntry],
    average_duration: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<i64>> {
    fifo_order(pending);

    let mut moved = Vec::new();

    for (rank, entry) in pending.iter_mut().enumerate() {
        let position = i32::try_from(rank + 1).context("position::recompute")?;

        if entry.position == Some(position) {
            continue;
        }

        entry.position = Some(position);
        entry.apply_estimate(estimator::estimate(entry.position, average_duration, now)?);
        moved.push(entry.id);
    }

    Ok(moved)
}

/// Throughput changed: every pending entry gets a fresh estimate from `now`.
pub fn reestimate(
    pending: &mut [QueueEntry],
    average_duration: Duration,
    now: DateTime<Utc>,
) -> Result<()> {
    recompute(pending, average_duration, now)?;

    for entry in pending.iter_mut() {
        entry.apply_estimate(estimator::estimate(entry.position, average_duration, now)?);
    }

    Ok(())
}
