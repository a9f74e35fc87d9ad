use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Postgres, Row, Transaction};

use crate::domain::{
    entity::{EntryStatus, QueueEntry, Service},
    error::{QueueError, Result},
    estimator, lifecycle, position,
    repository::{
        EntryRepository, Finished, Reconfigured, ServiceRepository, ServiceUpdate, Transferred,
    },
};

// Every mutation of a queue's pending set takes the row lock on its service first.
// That lock is what serializes position recompute per queue.

async fn lock_services(
    tx: &mut Transaction<'_, Postgres>,
    ids: &[i64],
) -> anyhow::Result<Vec<Service>> {
    let services: Vec<Service> =
        sqlx::query_as("SELECT * FROM queue.services WHERE id = ANY($1) ORDER BY id FOR UPDATE")
            .bind(ids.to_vec())
            .fetch_all(&mut *tx)
            .await
            .context("lock_services")?;

    Ok(services)
}

async fn lock_service(tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<Service> {
    lock_services(tx, &[id])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| QueueError::service_not_found(id))
}

async fn load_pending_locked(
    tx: &mut Transaction<'_, Postgres>,
    service_id: i64,
) -> anyhow::Result<Vec<QueueEntry>> {
    let pending: Vec<QueueEntry> = sqlx::query_as(
        r#"
        SELECT * FROM queue.entries
        WHERE service_id = $1 AND status = 'pending'
        ORDER BY time_created ASC, id ASC
        FOR UPDATE
        "#,
    )
    .bind(service_id)
    .fetch_all(&mut *tx)
    .await
    .context("load_pending_locked")?;

    Ok(pending)
}

async fn store_estimate(
    tx: &mut Transaction<'_, Postgres>,
    entry: &QueueEntry,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE queue.entries
        SET position = $1, total_wait = $2, expected_ready_time = $3
        WHERE id = $4
        "#,
    )
    .bind(&entry.position)
    .bind(&entry.total_wait)
    .bind(&entry.expected_ready_time)
    .bind(&entry.id)
    .execute(&mut *tx)
    .await
    .context("store_estimate")?;

    Ok(())
}

/// Re-ranks the queue and persists entries whose position moved, in ascending order.
async fn recompute(
    tx: &mut Transaction<'_, Postgres>,
    service: &Service,
    now: DateTime<Utc>,
) -> Result<Vec<QueueEntry>> {
    let mut pending = load_pending_locked(tx, service.id).await?;
    let moved = position::recompute(&mut pending, service.average_duration()?, now)?;

    let moved: Vec<QueueEntry> = pending
        .into_iter()
        .filter(|e| moved.contains(&e.id))
        .collect();

    for entry in &moved {
        store_estimate(tx, entry).await?;
    }

    Ok(moved)
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    customer_id: i64,
    service_id: i64,
    now: DateTime<Utc>,
    transferred_from_id: Option<i64>,
) -> anyhow::Result<i64> {
    let id: i64 = sqlx::query(
        r#"
        INSERT INTO queue.entries (service_id, customer_id, status, time_created, transferred_from_id)
        VALUES ($1, $2, 'pending', $3, $4)
        RETURNING id
        "#,
    )
    .bind(&service_id)
    .bind(&customer_id)
    .bind(&now)
    .bind(&transferred_from_id)
    .map(|row: PgRow| row.get(0))
    .fetch_one(&mut *tx)
    .await
    .context("insert_entry")?;

    Ok(id)
}

/// Conditional `pending -> to`. `None` when the entry is not pending (or not due).
async fn compare_and_finish(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
    to: EntryStatus,
    now: DateTime<Utc>,
    only_if_due: bool,
) -> anyhow::Result<Option<QueueEntry>> {
    let entry: Option<QueueEntry> = sqlx::query_as(
        r#"
        UPDATE queue.entries
        SET status = $2, position = NULL, time_finished = $3
        WHERE id = $1
          AND status = 'pending'
          AND (NOT $4 OR expected_ready_time <= $3)
        RETURNING *
        "#,
    )
    .bind(&id)
    .bind(to.as_str())
    .bind(&now)
    .bind(&only_if_due)
    .fetch_optional(&mut *tx)
    .await
    .context("compare_and_finish")?;

    Ok(entry)
}

async fn load_entry(pool: &PgPool, id: i64) -> anyhow::Result<Option<QueueEntry>> {
    let entry: Option<QueueEntry> = sqlx::query_as("SELECT * FROM queue.entries WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("load_entry")?;

    Ok(entry)
}

#[derive(Clone, Debug)]
pub struct PgEntryRepository {
    pool: PgPool,
}

impl PgEntryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn finish_with(
        &self,
        id: i64,
        to: EntryStatus,
        now: DateTime<Utc>,
        only_if_due: bool,
    ) -> Result<Option<Finished>> {
        lifecycle::transition(EntryStatus::Pending, to)?;

        let current = load_entry(&self.pool, id)
            .await?
            .ok_or_else(|| QueueError::entry_not_found(id))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("EntryRepository::finish")?;

        let service = lock_service(&mut tx, current.service_id).await?;

        let entry = match compare_and_finish(&mut tx, id, to, now, only_if_due).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let shifted = recompute(&mut tx, &service, now).await?;

        tx.commit().await.context("EntryRepository::finish")?;

        Ok(Some(Finished { entry, shifted }))
    }
}

#[async_trait::async_trait]
impl EntryRepository for PgEntryRepository {
    async fn load(&self, id: i64) -> Result<Option<QueueEntry>> {
        Ok(load_entry(&self.pool, id).await?)
    }

    async fn load_active(&self, customer_id: i64) -> Result<Option<QueueEntry>> {
        let entry: Option<QueueEntry> = sqlx::query_as(
            r#"
            SELECT * FROM queue.entries
            WHERE customer_id = $1 AND status = 'pending'
            ORDER BY time_created ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .context("EntryRepository::load_active")?;

        Ok(entry)
    }

    async fn load_history(&self, customer_id: i64) -> Result<Vec<QueueEntry>> {
        let entries: Vec<QueueEntry> = sqlx::query_as(
            r#"
            SELECT * FROM queue.entries
            WHERE customer_id = $1
            ORDER BY time_created DESC, id DESC
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .context("EntryRepository::load_history")?;

        Ok(entries)
    }

    async fn load_pending(&self, service_id: i64) -> Result<Vec<QueueEntry>> {
        let entries: Vec<QueueEntry> = sqlx::query_as(
            r#"
            SELECT * FROM queue.entries
            WHERE service_id = $1 AND status = 'pending'
            ORDER BY time_created ASC, id ASC
            "#,
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await
        .context("EntryRepository::load_pending")?;

        Ok(entries)
    }

    async fn load_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query(
            r#"
            SELECT id FROM queue.entries
            WHERE status = 'pending' AND expected_ready_time <= $1
            ORDER BY expected_ready_time ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .map(|row: PgRow| row.get(0))
        .fetch_all(&self.pool)
        .await
        .context("EntryRepository::load_due")?;

        Ok(ids)
    }

    async fn join(
        &self,
        customer_id: i64,
        service_id: i64,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry> {
        let mut tx = self.pool.begin().await.context("EntryRepository::join")?;

        let service = lock_service(&mut tx, service_id).await?;
        if !service.is_active {
            return Err(QueueError::ServiceInactive(service_id));
        }

        let id = insert_entry(&mut tx, customer_id, service_id, now, None).await?;
        let ranked = recompute(&mut tx, &service, now).await?;

        tx.commit().await.context("EntryRepository::join")?;

        ranked
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| QueueError::entry_not_found(id))
    }

    async fn finish(&self, id: i64, to: EntryStatus, now: DateTime<Utc>) -> Result<Finished> {
        match self.finish_with(id, to, now, false).await? {
            Some(finished) => Ok(finished),
            None => {
                let current = self
                    .load(id)
                    .await?
                    .ok_or_else(|| QueueError::entry_not_found(id))?;

                Err(QueueError::InvalidTransition {
                    from: current.status,
                    to,
                })
            }
        }
    }

    async fn complete_if_due(&self, id: i64, now: DateTime<Utc>) -> Result<Option<Finished>> {
        self.finish_with(id, EntryStatus::Completed, now, true)
            .await
    }

    async fn transfer(
        &self,
        id: i64,
        destination_service_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Transferred> {
        let source = self
            .load(id)
            .await?
            .ok_or_else(|| QueueError::entry_not_found(id))?;

        lifecycle::transition(source.status, EntryStatus::Transferred)?;

        if source.transferred_from_id.is_some() {
            return Err(QueueError::AlreadyTransferred(source.id));
        }

        if source.service_id == destination_service_id {
            return Err(QueueError::SameDestination(destination_service_id));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("EntryRepository::transfer")?;

        // Both queues, ascending id, so concurrent opposite transfers cannot deadlock.
        let services = lock_services(&mut tx, &[source.service_id, destination_service_id]).await?;

        let origin = services
            .iter()
            .find(|s| s.id == source.service_id)
            .cloned()
            .ok_or_else(|| QueueError::service_not_found(source.service_id))?;

        let destination_service = match services.into_iter().find(|s| s.id == destination_service_id) {
            Some(service) if service.is_active => service,
            _ => {
                return Err(QueueError::TransferDestinationUnavailable(
                    destination_service_id,
                ))
            }
        };

        let mut moved = match compare_and_finish(&mut tx, id, EntryStatus::Transferred, now, false)
            .await?
        {
            Some(entry) => entry,
            None => {
                return Err(QueueError::InvalidTransition {
                    from: load_entry(&self.pool, id)
                        .await?
                        .map(|e| e.status)
                        .unwrap_or(source.status),
                    to: EntryStatus::Transferred,
                })
            }
        };

        let destination_id =
            insert_entry(&mut tx, source.customer_id, destination_service.id, now, Some(id))
                .await?;

        let ranked = recompute(&mut tx, &destination_service, now).await?;
        let destination = ranked
            .into_iter()
            .find(|e| e.id == destination_id)
            .ok_or_else(|| QueueError::entry_not_found(destination_id))?;

        sqlx::query("UPDATE queue.entries SET transferred_to_id = $1 WHERE id = $2")
            .bind(&destination_id)
            .bind(&id)
            .execute(&mut tx)
            .await
            .context("EntryRepository::transfer")?;
        moved.transferred_to_id = Some(destination_id);

        let shifted = recompute(&mut tx, &origin, now).await?;

        tx.commit().await.context("EntryRepository::transfer")?;

        Ok(Transferred {
            source: moved,
            destination,
            shifted,
        })
    }
}

#[derive(Clone, Debug)]
pub struct PgServiceRepository {
    pool: PgPool,
}

impl PgServiceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ServiceRepository for PgServiceRepository {
    async fn load(&self, id: i64) -> Result<Option<Service>> {
        let service: Option<Service> = sqlx::query_as("SELECT * FROM queue.services WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("ServiceRepository::load")?;

        Ok(service)
    }

    async fn create(&self, name: &str, average_duration_secs: i64) -> Result<Service> {
        estimator::average_duration(average_duration_secs)?;

        let service: Service = sqlx::query_as(
            r#"
            INSERT INTO queue.services (name, average_duration_secs)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(average_duration_secs)
        .fetch_one(&self.pool)
        .await
        .context("ServiceRepository::create")?;

        Ok(service)
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

        let mut tx = self
            .pool
            .begin()
            .await
            .context("ServiceRepository::update")?;

        let before = lock_service(&mut tx, id).await?;

        let service: Service = sqlx::query_as(
            r#"
            UPDATE queue.services
            SET is_active = COALESCE($2, is_active),
                average_duration_secs = COALESCE($3, average_duration_secs)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&update.is_active)
        .bind(&update.average_duration_secs)
        .fetch_one(&mut tx)
        .await
        .context("ServiceRepository::update")?;

        let mut reestimated = Vec::new();

        if service.average_duration_secs != before.average_duration_secs {
            reestimated = load_pending_locked(&mut tx, id).await?;
            position::reestimate(&mut reestimated, service.average_duration()?, now)?;

            for entry in &reestimated {
                store_estimate(&mut tx, entry).await?;
            }
        }

        tx.commit().await.context("ServiceRepository::update")?;

        Ok(Reconfigured {
            service,
            reestimated,
        })
    }
}

impl FromRow<'_, PgRow> for Service {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            is_active: row.try_get("is_active")?,
            average_duration_secs: row.try_get("average_duration_secs")?,
        })
    }
}

impl FromRow<'_, PgRow> for QueueEntry {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status: EntryStatus = status
            .parse()
            .map_err(|e: anyhow::Error| sqlx::Error::Decode(e.into()))?;

        Ok(Self {
            id: row.try_get("id")?,
            service_id: row.try_get("service_id")?,
            customer_id: row.try_get("customer_id")?,
            status,
            time_created: row.try_get("time_created")?,
            time_finished: row.try_get("time_finished")?,
            position: row.try_get("position")?,
            total_wait: row.try_get("total_wait")?,
            expected_ready_time: row.try_get("expected_ready_time")?,
            transferred_from_id: row.try_get("transferred_from_id")?,
            transferred_to_id: row.try_get("transferred_to_id")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use futures::future::join_all;
    use sqlx::postgres::PgPoolOptions;

    use super::*;

    // Runs against the database in DATABASE_URL; without one these tests are skipped.
    async fn repositories() -> Option<(PgEntryRepository, PgServiceRepository)> {
        let url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("DATABASE_URL not set, skipping postgres test");
                return None;
            }
        };

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        Some((
            PgEntryRepository::new(pool.clone()),
            PgServiceRepository::new(pool),
        ))
    }

    // Whole seconds, so values survive the round trip through TIMESTAMPTZ unchanged.
    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap()
    }

    async fn ranks(entries: &PgEntryRepository, service_id: i64) -> Vec<(i64, i32)> {
        entries
            .load_pending(service_id)
            .await
            .unwrap()
            .iter()
            .map(|e| (e.id, e.position.unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn positions_stay_gapless_across_join_leave_transfer() {
        let (entries, services) = match repositories().await {
            Some(repos) => repos,
            None => return,
        };
        let q1 = services.create("pg north", 60).await.unwrap();
        let q2 = services.create("pg south", 60).await.unwrap();
        let now = now();

        let a = entries.join(1, q1.id, now).await.unwrap();
        let b = entries.join(2, q1.id, now).await.unwrap();
        let c = entries.join(3, q1.id, now).await.unwrap();
        assert_eq!(
            ranks(&entries, q1.id).await,
            vec![(a.id, 1), (b.id, 2), (c.id, 3)]
        );
        assert_eq!(c.total_wait, Some(180));
        assert_eq!(c.expected_ready_time, Some(now + Duration::seconds(180)));

        let left = entries
            .finish(b.id, EntryStatus::Cancelled, now)
            .await
            .unwrap();
        assert_eq!(left.entry.status, EntryStatus::Cancelled);
        assert_eq!(left.entry.position, None);
        assert_eq!(
            left.shifted.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![c.id]
        );
        assert_eq!(ranks(&entries, q1.id).await, vec![(a.id, 1), (c.id, 2)]);

        let moved = entries.transfer(a.id, q2.id, now).await.unwrap();
        assert_eq!(moved.source.status, EntryStatus::Transferred);
        assert_eq!(moved.source.transferred_to_id, Some(moved.destination.id));
        assert_eq!(moved.destination.transferred_from_id, Some(a.id));
        assert_eq!(moved.destination.position, Some(1));
        assert_eq!(ranks(&entries, q1.id).await, vec![(c.id, 1)]);

        let stored = entries.load(a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EntryStatus::Transferred);
        assert_eq!(stored.position, None);
        assert_eq!(stored.transferred_to_id, Some(moved.destination.id));

        let again = entries
            .transfer(moved.destination.id, q1.id, now)
            .await
            .unwrap_err();
        assert!(matches!(again, QueueError::AlreadyTransferred(_)));
    }

    #[tokio::test]
    async fn concurrent_joins_are_serialized_per_queue() {
        let (entries, services) = match repositories().await {
            Some(repos) => repos,
            None => return,
        };
        let q = services.create("pg rush", 30).await.unwrap();
        let now = now();

        let joined = join_all((0..20).map(|customer| entries.join(customer, q.id, now))).await;
        for result in joined {
            result.unwrap();
        }

        let positions: Vec<i32> = ranks(&entries, q.id).await.into_iter().map(|(_, p)| p).collect();
        assert_eq!(positions, (1..=20).collect::<Vec<i32>>());
    }

    #[tokio::test]
    async fn complete_if_due_transitions_once() {
        let (entries, services) = match repositories().await {
            Some(repos) => repos,
            None => return,
        };
        let q = services.create("pg kiosk", 60).await.unwrap();
        let now = now();
        let a = entries.join(1, q.id, now).await.unwrap();

        assert!(entries.complete_if_due(a.id, now).await.unwrap().is_none());

        let due = now + Duration::seconds(60);
        let (first, second) = tokio::join!(
            entries.complete_if_due(a.id, due),
            entries.complete_if_due(a.id, due)
        );
        let completed = [first.unwrap(), second.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(completed, 1);

        let stored = entries.load(a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EntryStatus::Completed);
        assert_eq!(stored.time_finished, Some(due));
        assert!(entries.complete_if_due(a.id, due).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_transfer_rolls_back() {
        let (entries, services) = match repositories().await {
            Some(repos) => repos,
            None => return,
        };
        let q1 = services.create("pg origin", 60).await.unwrap();
        let q2 = services.create("pg closed", 60).await.unwrap();
        let now = now();

        let update = ServiceUpdate {
            is_active: Some(false),
            ..Default::default()
        };
        services.update(q2.id, &update, now).await.unwrap();

        entries.join(7, q1.id, now).await.unwrap();
        let a = entries.join(1, q1.id, now).await.unwrap();

        for target in [q2.id, i64::MAX] {
            let err = entries.transfer(a.id, target, now).await.unwrap_err();
            assert!(matches!(err, QueueError::TransferDestinationUnavailable(t) if t == target));

            let source = entries.load(a.id).await.unwrap().unwrap();
            assert_eq!(source.status, EntryStatus::Pending);
            assert_eq!(source.position, Some(2));
            assert_eq!(source.transferred_to_id, None);
        }

        assert!(entries.load_pending(q2.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn throughput_bounds_hold_in_the_store() {
        let (_, services) = match repositories().await {
            Some(repos) => repos,
            None => return,
        };

        assert!(matches!(
            services.create("pg slow", 10_000_000_000_000).await,
            Err(QueueError::InvalidArgument(_))
        ));

        let q = services.create("pg steady", 60).await.unwrap();
        let update = ServiceUpdate {
            average_duration_secs: Some(90),
            ..Default::default()
        };
        let reconfigured = services.update(q.id, &update, now()).await.unwrap();
        assert_eq!(reconfigured.service.average_duration_secs, 90);
    }
}
