use std::{net::SocketAddr, time::Duration as StdDuration};

use chrono::Duration;
use clap::Parser;
use tracing_subscriber::{fmt::format, prelude::__tracing_subscriber_field_MakeExt, EnvFilter};

use crate::domain::policy::{Policy, Window};

#[derive(Debug, Parser)]
pub struct Config {
    /// Postgres connection string. Without it the engine keeps its state in memory.
    #[clap(long, env)]
    pub database_url: Option<String>,
    /// Without it events are only logged.
    #[clap(long, env)]
    pub nats_url: Option<String>,
    #[clap(long, default_value = "0.0.0.0:8000", env)]
    pub bind_addr: SocketAddr,
    #[clap(long, default_value = "60", env)]
    pub leave_window_secs: i64,
    /// 0 disables the transfer window.
    #[clap(long, default_value = "120", env)]
    pub transfer_window_secs: i64,
    #[clap(long, default_value = "10", env)]
    pub sweep_interval_secs: u64,
    #[clap(long, default_value = "100", env)]
    pub sweep_batch: u32,
    #[clap(long, default_value = "", env)]
    pub env: String,
}

impl Config {
    pub fn policy(&self) -> Policy {
        Policy {
            leave: Window::leave(Duration::seconds(self.leave_window_secs)),
            transfer: (self.transfer_window_secs > 0)
                .then(|| Window::transfer(Duration::seconds(self.transfer_window_secs))),
        }
    }

    pub fn sweep_batch(&self) -> i64 {
        i64::from(self.sweep_batch)
    }

    pub fn sweep_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.sweep_interval_secs.max(1))
    }
}

pub fn configure_tracing(env: &str) {
    if env == "production" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .init();
        return;
    }

    let formatter =
        format::debug_fn(|writer, field, value| write!(writer, "{}={:?}", field, value))
            .delimited(" ");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .fmt_fields(formatter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_service_contract() {
        let config = Config::parse_from(["queue-engine"]);
        let policy = config.policy();

        assert_eq!(policy.leave.limit(), Duration::seconds(60));
        assert_eq!(
            policy.transfer.map(|w| w.limit()),
            Some(Duration::seconds(120))
        );
        assert_eq!(config.sweep_batch, 100);
    }

    #[test]
    fn zero_transfer_window_disables_it() {
        let config = Config::parse_from(["queue-engine", "--transfer-window-secs", "0"]);

        assert!(config.policy().transfer.is_none());
    }

    #[test]
    fn negative_sweep_batch_is_refused() {
        assert!(Config::try_parse_from(["queue-engine", "--sweep-batch=-5"]).is_err());

        let config = Config::parse_from(["queue-engine", "--sweep-batch=25"]);
        assert_eq!(config.sweep_batch(), 25);
    }
}
