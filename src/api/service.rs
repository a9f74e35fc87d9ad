use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{error, info, warn};

use super::{types::*, QueueService};
use crate::domain::{
    clock::Clock,
    entity::{EntryStatus, QueueEntry, Service},
    error::{QueueError, Result},
    event::{EventTransport, QueueEvent},
    lifecycle,
    policy::Policy,
    repository::{EntryRepository, Finished, ServiceRepository, ServiceUpdate},
};

/// Result of running the auto-completion check on one entry.
#[derive(Debug, Clone)]
pub enum AutoCompletion {
    /// This call performed the `pending -> completed` transition.
    Completed(QueueEntry),
    /// Not due yet.
    Pending(QueueEntry),
    /// Already terminal, possibly by a concurrent trigger.
    Final(QueueEntry),
}

impl AutoCompletion {
    pub fn entry(&self) -> &QueueEntry {
        match self {
            AutoCompletion::Completed(e) | AutoCompletion::Pending(e) | AutoCompletion::Final(e) => e,
        }
    }

    fn into_entry(self) -> QueueEntry {
        match self {
            AutoCompletion::Completed(e) | AutoCompletion::Pending(e) | AutoCompletion::Final(e) => e,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueueServiceImpl<ER, SR, E, C>
where
    ER: EntryRepository,
    SR: ServiceRepository,
    E: EventTransport,
    C: Clock,
{
    entries: ER,
    services: SR,
    event: E,
    clock: C,
    policy: Policy,
}

fn wait_minutes(entry: &QueueEntry, now: DateTime<Utc>) -> i64 {
    entry
        .remaining(now)
        .map(|r| r.as_secs() / 60)
        .unwrap_or(0)
}

impl<ER, SR, E, C> QueueServiceImpl<ER, SR, E, C>
where
    ER: EntryRepository,
    SR: ServiceRepository,
    E: EventTransport,
    C: Clock,
{
    pub fn new(entries: ER, services: SR, event: E, clock: C, policy: Policy) -> Self {
        Self {
            entries,
            services,
            event,
            clock,
            policy,
        }
    }

    async fn load_entry(&self, id: i64) -> Result<QueueEntry> {
        self.entries
            .load(id)
            .await?
            .ok_or_else(|| QueueError::entry_not_found(id))
    }

    async fn load_service(&self, id: i64) -> Result<Service> {
        self.services
            .load(id)
            .await?
            .ok_or_else(|| QueueError::service_not_found(id))
    }

    // Events go out after the store committed; a broker failure never undoes the change.
    async fn publish(&self, events: Vec<QueueEvent>) {
        let results = join_all(events.iter().map(|e| self.event.publish(e))).await;

        for (event, result) in events.iter().zip(results) {
            if let Err(e) = result {
                error!(kind = event.kind(), "Failed to publish event: {:?}", e);
            }
        }
    }

    fn shifted_events(shifted: &[QueueEntry]) -> impl Iterator<Item = QueueEvent> + '_ {
        shifted
            .iter()
            .map(|e| QueueEvent::PositionChanged(e.into()))
    }

    async fn publish_finished(&self, finished: &Finished) {
        let event = match finished.entry.status {
            EntryStatus::Cancelled => QueueEvent::Cancelled((&finished.entry).into()),
            _ => QueueEvent::Completed((&finished.entry).into()),
        };

        let mut events = vec![event];
        events.extend(Self::shifted_events(&finished.shifted));

        self.publish(events).await;
    }

    /// Single funnel for every `pending -> completed` edge driven by elapsed time.
    pub async fn auto_complete(&self, id: i64) -> Result<AutoCompletion> {
        let entry = self.load_entry(id).await?;

        if !entry.is_pending() {
            return Ok(AutoCompletion::Final(entry));
        }

        let now = self.clock.now();
        if !entry.is_due(now) {
            return Ok(AutoCompletion::Pending(entry));
        }

        match self.entries.complete_if_due(id, now).await? {
            Some(finished) => {
                info!(entry_id = id, service_id = finished.entry.service_id, "Entry auto-completed");
                self.publish_finished(&finished).await;

                Ok(AutoCompletion::Completed(finished.entry))
            }
            // Lost the race, or an entry ahead left and pushed the estimate back.
            None => {
                let entry = self.load_entry(id).await?;

                if entry.is_pending() {
                    Ok(AutoCompletion::Pending(entry))
                } else {
                    Ok(AutoCompletion::Final(entry))
                }
            }
        }
    }

    async fn describe(
        &self,
        entry: &QueueEntry,
        original_queue_id: Option<i64>,
    ) -> Result<QueueDetail> {
        let service = self.load_service(entry.service_id).await?;
        let now = self.clock.now();

        let (remaining_wait, processing_imminent) = match entry.remaining(now) {
            Ok(remaining) => (Some(remaining.as_secs()), remaining.is_imminent()),
            Err(QueueError::EstimationUnavailable) => (None, false),
            Err(e) => return Err(e),
        };

        Ok(QueueDetail {
            queue_id: entry.id,
            service_id: entry.service_id,
            service_name: service.name,
            current_position: entry.position,
            total_wait: entry.total_wait,
            expected_ready_time: entry.expected_ready_time,
            status: entry.status,
            time_created: entry.time_created,
            is_transferred: original_queue_id.is_some(),
            original_queue_id,
            remaining_wait,
            processing_imminent,
        })
    }
}

#[async_trait::async_trait]
impl<ER, SR, E, C> QueueService for QueueServiceImpl<ER, SR, E, C>
where
    ER: EntryRepository,
    SR: ServiceRepository,
    E: EventTransport,
    C: Clock,
{
    async fn join(&self, req: JoinRequest) -> Result<JoinResponse> {
        info!("Join request: {:?}", req);

        let now = self.clock.now();
        let entry = self
            .entries
            .join(req.customer_id, req.service_id, now)
            .await?;

        info!(
            entry_id = entry.id,
            service_id = entry.service_id,
            position = ?entry.position,
            "Entry joined"
        );

        self.publish(vec![QueueEvent::Joined((&entry).into())]).await;

        Ok(JoinResponse {
            message: "Queue created".to_string(),
            queue_id: entry.id,
            position: entry.position,
            expected_ready_time: entry.expected_ready_time,
            estimated_wait_minutes: wait_minutes(&entry, now),
        })
    }

    async fn detail(&self, id: i64) -> Result<QueueDetail> {
        let requested = self.load_entry(id).await?;

        // A transferred entry answers with wherever the customer is queued now.
        if requested.status == EntryStatus::Transferred {
            let mut current = requested.clone();

            while let (EntryStatus::Transferred, Some(next)) =
                (current.status, current.transferred_to_id)
            {
                current = self.load_entry(next).await?;
            }

            let current = self.auto_complete(current.id).await?.into_entry();
            return self.describe(&current, Some(requested.id)).await;
        }

        let entry = self.auto_complete(id).await?.into_entry();
        self.describe(&entry, entry.transferred_from_id).await
    }

    async fn active(&self, customer_id: i64) -> Result<Option<QueueDetail>> {
        // Each pass either returns or moves one due entry out of `pending`.
        while let Some(entry) = self.entries.load_active(customer_id).await? {
            if let AutoCompletion::Pending(entry) = self.auto_complete(entry.id).await? {
                return Ok(Some(self.describe(&entry, entry.transferred_from_id).await?));
            }
        }

        Ok(None)
    }

    async fn leave(&self, id: i64) -> Result<LeaveResponse> {
        let entry = self.load_entry(id).await?;

        lifecycle::transition(entry.status, EntryStatus::Cancelled)?;

        if let Err(e) = self.policy.leave.check(&entry, self.clock.now()) {
            warn!(entry_id = id, "Leave rejected: {}", e);
            return Err(e);
        }

        let finished = self
            .entries
            .finish(id, EntryStatus::Cancelled, self.clock.now())
            .await?;

        info!(entry_id = id, shifted = finished.shifted.len(), "Entry left queue");
        self.publish_finished(&finished).await;

        Ok(LeaveResponse {
            message: "Successfully left the queue".to_string(),
            queue_id: id,
            status: finished.entry.status,
        })
    }

    async fn complete(&self, id: i64) -> Result<CompleteResponse> {
        let finished = self
            .entries
            .finish(id, EntryStatus::Completed, self.clock.now())
            .await?;

        info!(entry_id = id, shifted = finished.shifted.len(), "Entry completed");
        self.publish_finished(&finished).await;

        Ok(CompleteResponse {
            queue_id: id,
            status: finished.entry.status,
        })
    }

    async fn check_complete(&self, id: i64) -> Result<CheckCompleteResponse> {
        let outcome = self.auto_complete(id).await?;
        let now = self.clock.now();

        let (message, remaining_time) = match &outcome {
            AutoCompletion::Completed(_) => ("Queue automatically marked as completed", None),
            AutoCompletion::Final(_) => ("Queue is already processed", None),
            AutoCompletion::Pending(entry) => (
                "Queue is still pending",
                entry.remaining(now).ok().map(|r| r.as_secs()),
            ),
        };

        Ok(CheckCompleteResponse {
            queue_id: id,
            status: outcome.entry().status,
            message: message.to_string(),
            remaining_time,
        })
    }

    async fn transfer(&self, req: TransferRequest) -> Result<TransferResponse> {
        info!("Transfer request: {:?}", req);

        let source = self.load_entry(req.original_queue_id).await?;

        if source.customer_id != req.customer_id {
            return Err(QueueError::NotOwner {
                entry_id: source.id,
                customer_id: req.customer_id,
            });
        }

        lifecycle::transition(source.status, EntryStatus::Transferred)?;

        if source.transferred_from_id.is_some() {
            return Err(QueueError::AlreadyTransferred(source.id));
        }

        let now = self.clock.now();
        if let Some(window) = self.policy.transfer {
            window.check(&source, now)?;
        }

        let transferred = match self
            .entries
            .transfer(source.id, req.target_service_id, now)
            .await
        {
            Ok(transferred) => transferred,
            Err(e) => {
                warn!(entry_id = source.id, "Transfer failed: {}", e);
                return Err(e);
            }
        };

        info!(
            entry_id = source.id,
            destination_id = transferred.destination.id,
            service_id = req.target_service_id,
            "Entry transferred"
        );

        let mut events = vec![QueueEvent::Transferred {
            source: (&transferred.source).into(),
            destination: (&transferred.destination).into(),
        }];
        events.extend(Self::shifted_events(&transferred.shifted));
        self.publish(events).await;

        let service = self.load_service(transferred.destination.service_id).await?;

        Ok(TransferResponse {
            message: "Queue transferred successfully".to_string(),
            queue_id: transferred.destination.id,
            original_queue_id: transferred.source.id,
            service_name: service.name,
            position: transferred.destination.position,
            expected_ready_time: transferred.destination.expected_ready_time,
            estimated_wait_minutes: wait_minutes(&transferred.destination, now),
        })
    }

    async fn history(&self, customer_id: i64) -> Result<Vec<HistoryItem>> {
        let entries = self.entries.load_history(customer_id).await?;
        let mut names: HashMap<i64, String> = HashMap::new();
        let mut items = Vec::with_capacity(entries.len());

        for entry in entries {
            if !names.contains_key(&entry.service_id) {
                let name = match self.services.load(entry.service_id).await? {
                    Some(service) => service.name,
                    None => "Unknown Service".to_string(),
                };
                names.insert(entry.service_id, name);
            }

            items.push(HistoryItem {
                id: entry.id,
                service_id: entry.service_id,
                service_name: names[&entry.service_id].clone(),
                status: entry.status,
                date_created: entry.time_created,
                date_finished: entry.time_finished,
                waiting_time: entry.total_wait,
                position: entry.position,
                transferred_from: entry.transferred_from_id,
                transferred_to: entry.transferred_to_id,
            });
        }

        Ok(items)
    }

    async fn create_service(&self, req: CreateServiceRequest) -> Result<Service> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(QueueError::InvalidArgument("name must not be empty".to_string()));
        }

        let service = self
            .services
            .create(name, req.average_duration_secs)
            .await?;

        info!(service_id = service.id, "Service created: {:?}", service);

        Ok(service)
    }

    async fn update_service(&self, id: i64, req: UpdateServiceRequest) -> Result<Service> {
        let update = ServiceUpdate {
            average_duration_secs: req.average_duration_secs,
            is_active: req.is_active,
        };

        let reconfigured = self
            .services
            .update(id, &update, self.clock.now())
            .await?;

        info!(
            service_id = id,
            reestimated = reconfigured.reestimated.len(),
            "Service updated: {:?}",
            reconfigured.service
        );

        let mut events = vec![QueueEvent::service_updated(&reconfigured.service)];
        events.extend(Self::shifted_events(&reconfigured.reestimated));
        self.publish(events).await;

        Ok(reconfigured.service)
    }

    async fn service_summary(&self, id: i64) -> Result<ServiceSummary> {
        let service = self.load_service(id).await?;
        let pending = self.entries.load_pending(id).await?;

        Ok(ServiceSummary::new(service, pending.len()))
    }

    async fn sweep(&self, limit: i64) -> Result<usize> {
        let due = self.entries.load_due(self.clock.now(), limit).await?;
        let mut completed = 0;

        for id in due {
            match self.auto_complete(id).await {
                Ok(AutoCompletion::Completed(_)) => completed += 1,
                Ok(_) => {}
                Err(e) => warn!(entry_id = id, "Sweep could not complete entry: {:?}", e),
            }
        }

        Ok(completed)
    }
}
