use chrono::{DateTime, Duration, Utc};

use super::{
    entity::QueueEntry,
    error::{QueueError, Result},
};

/// Time-bounded self-service action, measured from `time_created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    action: &'static str,
    limit: Duration,
}

impl Window {
    pub fn leave(limit: Duration) -> Self {
        Self {
            action: "leaving the queue",
            limit,
        }
    }

    pub fn transfer(limit: Duration) -> Self {
        Self {
            action: "transferring",
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn check(&self, entry: &QueueEntry, now: DateTime<Utc>) -> Result<()> {
        if entry.elapsed(now) <= self.limit {
            return Ok(());
        }

        Err(QueueError::WindowExpired {
            action: self.action,
            limit_secs: self.limit.num_seconds(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub leave: Window,
    /// `None` lets a pending entry be transferred at any time.
    pub transfer: Option<Window>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            leave: Window::leave(Duration::seconds(60)),
            transfer: Some(Window::transfer(Duration::seconds(120))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn joined() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn leave_window_boundary() {
        let entry = QueueEntry::new(1, 1, 1, joined(), None);
        let window = Policy::default().leave;

        assert!(window.check(&entry, joined() + Duration::seconds(59)).is_ok());
        assert!(window.check(&entry, joined() + Duration::seconds(60)).is_ok());
        assert!(matches!(
            window.check(&entry, joined() + Duration::seconds(61)),
            Err(QueueError::WindowExpired { limit_secs: 60, .. })
        ));
    }

    #[test]
    fn clock_behind_join_time_is_inside_the_window() {
        let entry = QueueEntry::new(1, 1, 1, joined(), None);

        assert!(Window::leave(Duration::seconds(60))
            .check(&entry, joined() - Duration::seconds(5))
            .is_ok());
    }
}
