use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};

use crate::domain::{
    entity::{EntryStatus, QueueEntry, Service},
    error::{QueueError, Result},
    estimator, lifecycle, position,
    repository::{
        EntryRepository, Finished, Reconfigured, ServiceRepository, ServiceUpdate, Transferred,
    },
};

/// Process-local store. Each mutation runs against a copy of the state that replaces
/// the original only on success, so a failed operation leaves nothing behind.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

#[derive(Clone, Debug, Default)]
struct State {
    services: BTreeMap<i64, Service>,
    entries: BTreeMap<i64, QueueEntry>,
    next_service_id: i64,
    next_entry_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Mutations only ever touch a copy, so a panic mid-transaction leaves the guarded
    // state as it was and the poison flag can be ignored.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> Result<T> {
        Ok(f(&self.lock()))
    }

    fn transaction<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.lock();

        let mut working = state.clone();
        let out = f(&mut working)?;
        *state = working;

        Ok(out)
    }
}

impl State {
    fn service(&self, id: i64) -> Result<&Service> {
        self.services
            .get(&id)
            .ok_or_else(|| QueueError::service_not_found(id))
    }

    fn pending(&self, service_id: i64) -> Vec<QueueEntry> {
        let mut pending: Vec<QueueEntry> = self
            .entries
            .values()
            .filter(|e| e.service_id == service_id && e.is_pending())
            .cloned()
            .collect();

        position::fifo_order(&mut pending);
        pending
    }

    fn store_all(&mut self, entries: &[QueueEntry]) {
        for entry in entries {
            self.entries.insert(entry.id, entry.clone());
        }
    }

    fn recompute(&mut self, service_id: i64, now: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        let average_duration = self.service(service_id)?.average_duration()?;

        let mut pending = self.pending(service_id);
        let moved = position::recompute(&mut pending, average_duration, now)?;
        self.store_all(&pending);

        Ok(pending
            .into_iter()
            .filter(|e| moved.contains(&e.id))
            .collect())
    }

    fn insert(
        &mut self,
        customer_id: i64,
        service_id: i64,
        now: DateTime<Utc>,
        transferred_from_id: Option<i64>,
    ) -> Result<QueueEntry> {
        self.next_entry_id += 1;
        let id = self.next_entry_id;

        self.entries.insert(
            id,
            QueueEntry::new(id, service_id, customer_id, now, transferred_from_id),
        );
        self.recompute(service_id, now)?;

        self.entries
            .get(&id)
            .cloned()
            .ok_or_else(|| QueueError::entry_not_found(id))
    }

    fn finish(&mut self, id: i64, to: EntryStatus, now: DateTime<Utc>) -> Result<Finished> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| QueueError::entry_not_found(id))?;

        lifecycle::transition(entry.status, to)?;
        entry.finish(to, now);
        let entry = entry.clone();

        let shifted = self.recompute(entry.service_id, now)?;

        Ok(Finished { entry, shifted })
    }
}

#[async_trait::async_trait]
impl EntryRepository for MemoryStore {
    async fn load(&self, id: i64) -> Result<Option<QueueEntry>> {
        self.read(|s| s.entries.get(&id).cloned())
    }

    async fn load_active(&self, customer_id: i64) -> Result<Option<QueueEntry>> {
        self.read(|s| {
            s.entries
                .values()
                .filter(|e| e.customer_id == customer_id && e.is_pending())
                .min_by(|a, b| {
                    a.time_created
                        .cmp(&b.time_created)
                        .then_with(|| a.id.cmp(&b.id))
                })
                .cloned()
        })
    }

    async fn load_history(&self, customer_id: i64) -> Result<Vec<QueueEntry>> {
        self.read(|s| {
            let mut history: Vec<QueueEntry> = s
                .entries
                .values()
                .filter(|e| e.customer_id == customer_id)
                .cloned()
                .collect();

            history.sort_by(|a, b| {
                b.time_created
                    .cmp(&a.time_created)
                    .then_with(|| b.id.cmp(&a.id))
            });
            history
        })
    }

    async fn load_pending(&self, service_id: i64) -> Result<Vec<QueueEntry>> {
        self.read(|s| s.pending(service_id))
    }

    async fn load_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
        self.read(|s| {
            let mut due: Vec<&QueueEntry> = s.entries.values().filter(|e| e.is_due(now)).collect();
            due.sort_by_key(|e| (e.expected_ready_time, e.id));

            due.into_iter()
                .take(usize::try_from(limit).unwrap_or(0))
                .map(|e| e.id)
                .collect()
        })
    }

    async fn join(
        &self,
        customer_id: i64,
        service_id: i64,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        self.transaction(|s| {
            if !s.service(service_id)?.is_active {
                return Err(QueueError::ServiceInactive(service_id));
            }

            s.insert(customer_id, service_id, now, None)
        })
    }

    async fn finish(&self, id: i64, to: EntryStatus, now: DateTime<Utc>) -> Result<Finished> {
        self.transaction(|s| s.finish(id, to, now))
    }

    async fn complete_if_due(&self, id: i64, now: DateTime<Utc>) -> Result<Option<Finished>> {
        self.transaction(|s| {
            let due = s.entries.get(&id).map(|e| e.is_due(now)).unwrap_or(false);
            if !due {
                return Ok(None);
            }

            s.finish(id, EntryStatus::Completed, now).map(Some)
        })
    }

    async fn transfer(
        &self,
        id: i64,
        destination_service_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Transferred> {
        self.transaction(|s| {
            let source = s
                .entries
                .get(&id)
                .cloned()
                .ok_or_else(|| QueueError::entry_not_found(id))?;

            lifecycle::transition(source.status, EntryStatus::Transferred)?;

            if source.transferred_from_id.is_some() {
                return Err(QueueError::AlreadyTransferred(source.id));
            }

            if source.service_id == destination_service_id {
                return Err(QueueError::SameDestination(destination_service_id));
            }

            match s.services.get(&destination_service_id) {
                Some(service) if service.is_active => {}
                _ => {
                    return Err(QueueError::TransferDestinationUnavailable(
                        destination_service_id,
                    ))
                }
            }

            let destination =
                s.insert(source.customer_id, destination_service_id, now, Some(source.id))?;

            let finished = s.finish(source.id, EntryStatus::Transferred, now)?;
            let mut source = finished.entry;
            source.transferred_to_id = Some(destination.id);
            s.entries.insert(source.id, source.clone());

            Ok(Transferred {
                source,
                destination,
                shifted: finished.shifted,
            })
        })
    }
}

#[async_trait::async_trait]
impl ServiceRepository for MemoryStore {
    async fn load(&self, id: i64) -> Result<Option<Service>> {
        self.read(|s| s.services.get(&id).cloned())
    }

    async fn create(&self, name: &str, average_duration_secs: i64) -> Result<Service> {
        estimator::average_duration(average_duration_secs)?;

        self.transaction(|s| {
            s.next_service_id += 1;

            let service = Service {
                id: s.next_service_id,
                name: name.to_string(),
                is_active: true,
                average_duration_secs,
            };
            s.services.insert(service.id, service.clone());

            Ok(service)
        })
    }

    async fn update(
        &self,
        id: i64,
        update: &ServiceUpdate,
        now: DateTime<Utc>,
    ) -> Result<Reconfigured> {
        if let Some(secs) = update.average_duration_secs {
            estimator::average_duration(secs)?;
        }

        self.transaction(|s| {
            let service = s
                .services
                .get_mut(&id)
                .ok_or_else(|| QueueError::service_not_found(id))?;

            if let Some(active) = update.is_active {
                service.is_active = active;
            }

            let throughput_changed = match update.average_duration_secs {
                Some(secs) if secs != service.average_duration_secs => {
                    service.average_duration_secs = secs;
                    true
                }
                _ => false,
            };

            let service = service.clone();
            let mut reestimated = Vec::new();

            if throughput_changed {
                reestimated = s.pending(id);
                position::reestimate(&mut reestimated, service.average_duration()?, now)?;
                s.store_all(&reestimated);
            }

            Ok(Reconfigured {
                service,
                reestimated,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use super::*;

    #[tokio::test]
    async fn panicking_transaction_does_not_wedge_the_store() {
        let store = MemoryStore::new();
        let service = store.create("Desk", 60).await.unwrap();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            store.transaction(|s| -> Result<()> {
                s.services.clear();
                panic!("boom");
            })
        }));
        assert!(outcome.is_err());

        let entry = store.join(7, service.id, Utc::now()).await.unwrap();
        assert_eq!(entry.position, Some(1));
    }

    #[tokio::test]
    async fn absurd_throughput_is_rejected_up_front() {
        let store = MemoryStore::new();

        assert!(matches!(
            store.create("Slow", 10_000_000_000_000).await,
            Err(QueueError::InvalidArgument(_))
        ));

        let service = store.create("Desk", 60).await.unwrap();
        let update = ServiceUpdate {
            average_duration_secs: Some(10_000_000_000_000),
            ..Default::default()
        };
        assert!(matches!(
            store.update(service.id, &update, Utc::now()).await,
            Err(QueueError::InvalidArgument(_))
        ));

        let entry = store.join(7, service.id, Utc::now()).await.unwrap();
        assert_eq!(entry.total_wait, Some(60));
    }
}
