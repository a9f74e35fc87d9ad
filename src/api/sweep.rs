use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::QueueService;

/// Drives auto-completion on a timer so it never depends on clients polling.
pub async fn run<S: QueueService>(service: S, every: Duration, batch: i64) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(every = ?every, batch, "Sweep started");

    loop {
        ticker.tick().await;

        match service.sweep(batch).await {
            Ok(0) => debug!("Sweep found nothing due"),
            Ok(completed) => info!(completed, "Sweep completed entries"),
            Err(e) => error!("Sweep failed: {:?}", e),
        }
    }
}
