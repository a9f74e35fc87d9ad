use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use tracing::{debug, info};

use crate::domain::event::{EventTransport, QueueEvent};

#[derive(Clone, Debug)]
pub struct NATSEventTransport {
    client: async_nats::Client,
    prefix: String,
}

impl NATSEventTransport {
    pub fn new(client: async_nats::Client, prefix: String) -> Self {
        Self { client, prefix }
    }

    fn subject(&self, event: &QueueEvent) -> String {
        format!("{}.{}", self.prefix, event.kind())
    }
}

#[async_trait::async_trait]
impl EventTransport for NATSEventTransport {
    async fn publish(&self, event: &QueueEvent) -> Result<()> {
        let subject = self.subject(event);
        let payload = serde_json::to_vec(event).context("NATSEventTransport::publish")?;

        debug!(subject = %subject, "Publishing event");

        self.client
            .publish(subject.clone(), Bytes::from(payload))
            .await
            .map_err(|e| anyhow!("NATSEventTransport::publish {}: {}", subject, e))?;

        Ok(())
    }
}

/// Used when no broker is configured: events only reach the log.
#[derive(Clone, Debug, Default)]
pub struct LogEventTransport;

#[async_trait::async_trait]
impl EventTransport for LogEventTransport {
    async fn publish(&self, event: &QueueEvent) -> Result<()> {
        info!(kind = event.kind(), "Event: {:?}", event);

        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::{Arc, Mutex};

    use anyhow::Result;

    use crate::domain::event::{EventTransport, QueueEvent};

    #[derive(Clone, Debug, Default)]
    pub struct RecordingTransport(Arc<Mutex<Vec<QueueEvent>>>);

    impl RecordingTransport {
        pub fn events(&self) -> Vec<QueueEvent> {
            self.0.lock().unwrap().clone()
        }

        pub fn count(&self, kind: &str) -> usize {
            self.events().iter().filter(|e| e.kind() == kind).count()
        }
    }

    #[async_trait::async_trait]
    impl EventTransport for RecordingTransport {
        async fn publish(&self, event: &QueueEvent) -> Result<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }
}
