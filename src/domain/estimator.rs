use chrono::{DateTime, Duration, Utc};

use super::error::{QueueError, Result};

/// Upper bound on a service's average duration: one day per customer.
pub const MAX_AVERAGE_DURATION_SECS: i64 = 86_400;

// Largest span `chrono::Duration::seconds` accepts.
const MAX_WAIT_SECS: i64 = i64::MAX / 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitEstimate {
    /// Seconds, `position × average duration`.
    pub total_wait: i64,
    pub expected_ready_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    /// Ready time has passed (or the clocks disagree); service is about to happen.
    Imminent,
    Seconds(i64),
}

impl Remaining {
    pub fn as_secs(&self) -> i64 {
        match self {
            Remaining::Imminent => 0,
            Remaining::Seconds(secs) => *secs,
        }
    }

    pub fn is_imminent(&self) -> bool {
        matches!(self, Remaining::Imminent)
    }
}

/// Validates a configured throughput and turns it into a duration.
pub fn average_duration(secs: i64) -> Result<Duration> {
    if secs <= 0 || secs > MAX_AVERAGE_DURATION_SECS {
        return Err(QueueError::InvalidArgument(format!(
            "average_duration_secs must be within 1..={}, got {}",
            MAX_AVERAGE_DURATION_SECS, secs
        )));
    }

    Ok(Duration::seconds(secs))
}

pub fn estimate(
    position: Option<i32>,
    average_duration: Duration,
    now: DateTime<Utc>,
) -> Result<WaitEstimate> {
    let position = match position {
        Some(p) if p > 0 => i64::from(p),
        _ => return Err(QueueError::EstimationUnavailable),
    };

    if average_duration <= Duration::zero() {
        return Err(QueueError::InvalidArgument(format!(
            "average service duration must be positive, got {}s",
            average_duration.num_seconds()
        )));
    }

    let out_of_range = || {
        QueueError::InvalidArgument(format!(
            "wait for position {} at {}s per customer is out of range",
            position,
            average_duration.num_seconds()
        ))
    };

    let total_wait = position
        .checked_mul(average_duration.num_seconds())
        .filter(|secs| *secs <= MAX_WAIT_SECS)
        .ok_or_else(out_of_range)?;

    let expected_ready_time = now
        .checked_add_signed(Duration::seconds(total_wait))
        .ok_or_else(out_of_range)?;

    Ok(WaitEstimate {
        total_wait,
        expected_ready_time,
    })
}

pub fn remaining(expected_ready_time: DateTime<Utc>, now: DateTime<Utc>) -> Remaining {
    let secs = (expected_ready_time - now).num_seconds();

    if secs <= 0 {
        Remaining::Imminent
    } else {
        Remaining::Seconds(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn wait_is_position_times_duration() {
        let e = estimate(Some(3), Duration::seconds(120), now()).unwrap();

        assert_eq!(e.total_wait, 360);
        assert_eq!(e.expected_ready_time, now() + Duration::seconds(360));
    }

    #[test]
    fn unassigned_position_is_not_estimated() {
        for position in [None, Some(0), Some(-2)] {
            assert!(matches!(
                estimate(position, Duration::seconds(60), now()),
                Err(QueueError::EstimationUnavailable)
            ));
        }
    }

    #[test]
    fn non_positive_throughput_is_rejected() {
        assert!(matches!(
            estimate(Some(1), Duration::zero(), now()),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[test]
    fn oversized_waits_are_rejected_instead_of_overflowing() {
        // Past chrono's last representable date.
        assert!(matches!(
            estimate(Some(1), Duration::seconds(10_000_000_000_000), now()),
            Err(QueueError::InvalidArgument(_))
        ));
        // Past i64 seconds.
        assert!(matches!(
            estimate(Some(i32::MAX), Duration::seconds(MAX_WAIT_SECS / 2), now()),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[test]
    fn throughput_must_be_within_a_day() {
        assert_eq!(average_duration(60).unwrap(), Duration::seconds(60));
        assert!(average_duration(MAX_AVERAGE_DURATION_SECS).is_ok());

        for secs in [0, -1, MAX_AVERAGE_DURATION_SECS + 1, 10_000_000_000_000] {
            assert!(matches!(
                average_duration(secs),
                Err(QueueError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn elapsed_or_skewed_ready_time_is_imminent() {
        assert_eq!(remaining(now(), now()), Remaining::Imminent);
        assert_eq!(
            remaining(now() - Duration::seconds(30), now()),
            Remaining::Imminent
        );
        assert_eq!(
            remaining(now() + Duration::seconds(45), now()),
            Remaining::Seconds(45)
        );
        assert_eq!(Remaining::Imminent.as_secs(), 0);
    }
}
