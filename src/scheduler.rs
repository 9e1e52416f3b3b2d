use std::future::Future;

use chrono::NaiveDate;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{LOCK_RETRIES_TOTAL, REJECTIONS_TOTAL, WAL_COMPACTIONS_TOTAL};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFilter {
    All,
    /// Authored or joined by the user.
    ForUser(UserId),
}

/// Public operation set. Each call is one engine transaction; only lock
/// timeouts are retried, business rejections come straight back.
pub struct Scheduler {
    engine: Engine,
    retry: RetryPolicy,
    compact_threshold: u64,
}

impl Scheduler {
    pub fn new(engine: Engine, retry: RetryPolicy, compact_threshold: u64) -> Self {
        Self {
            engine,
            retry,
            compact_threshold,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        self.engine.catalog()
    }

    pub fn window(&self) -> &BookingWindow {
        self.engine.window()
    }

    async fn run<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let result = self
            .retry
            .retry_when(
                |e| matches!(e, EngineError::Timeout),
                |attempt| {
                    if attempt > 0 {
                        debug!("{op_name}: lock timeout, attempt {}", attempt + 1);
                        metrics::counter!(LOCK_RETRIES_TOTAL, "op" => op_name).increment(1);
                    }
                    op()
                },
            )
            .await;
        if let Err(e) = &result {
            debug!("{op_name} rejected: {e}");
            metrics::counter!(REJECTIONS_TOTAL, "op" => op_name, "reason" => e.label()).increment(1);
        }
        result
    }

    /// Compaction piggybacks on writes. Its failure never fails the write that
    /// triggered it; the log just stays long until the next attempt.
    async fn after_commit(&self) {
        match self.engine.maybe_compact(self.compact_threshold).await {
            Ok(true) => metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1),
            Ok(false) => {}
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }

    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        let r = self
            .run("create", || self.engine.create_reservation(req.clone()))
            .await?;
        self.after_commit().await;
        Ok(r)
    }

    pub async fn update_reservation(
        &self,
        id: Ulid,
        change: ReservationChange,
        requester_id: UserId,
    ) -> Result<Reservation, EngineError> {
        let r = self
            .run("update", || self.engine.update_reservation(id, change, requester_id))
            .await?;
        self.after_commit().await;
        Ok(r)
    }

    pub async fn delete_reservation(&self, id: Ulid, requester_id: UserId) -> Result<(), EngineError> {
        self.run("delete", || self.engine.delete_reservation(id, requester_id))
            .await?;
        self.after_commit().await;
        Ok(())
    }

    pub async fn join(&self, id: Ulid, user_id: UserId) -> Result<Reservation, EngineError> {
        let r = self.run("join", || self.engine.join(id, user_id)).await?;
        self.after_commit().await;
        Ok(r)
    }

    pub async fn leave(&self, id: Ulid, user_id: UserId) -> Result<Reservation, EngineError> {
        let r = self.run("leave", || self.engine.leave(id, user_id)).await?;
        self.after_commit().await;
        Ok(r)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.run("get", || self.engine.get_reservation(id)).await
    }

    pub async fn list_reservations(&self, filter: ReservationFilter) -> Result<Vec<Reservation>, EngineError> {
        match filter {
            ReservationFilter::All => self.run("list_all", || self.engine.list_all()).await,
            ReservationFilter::ForUser(user_id) => {
                self.run("list_for_user", || self.engine.list_for_user(user_id))
                    .await
            }
        }
    }

    pub async fn list_by_resource_and_date(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        self.run("list_by_date", || {
            self.engine.list_by_resource_and_date(resource_id, date)
        })
        .await
    }

    /// Advisory: a free hour here can still be lost to a concurrent create.
    pub async fn occupied_hours(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
    ) -> Result<Vec<HourSlot>, EngineError> {
        self.run("occupied_hours", || self.engine.occupied_hours(resource_id, date))
            .await
    }

    pub async fn free_intervals(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
    ) -> Result<Vec<HourSlot>, EngineError> {
        self.run("free_intervals", || self.engine.free_intervals(resource_id, date))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::engine::EngineSettings;

    fn at(hour: i64) -> Ms {
        chrono::Utc
            .with_ymd_and_hms(2030, 6, 10, 0, 0, 0)
            .unwrap()
            .timestamp_millis()
            + hour * HOUR_MS
    }

    fn wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fieldtime_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn scheduler(name: &str, retry: RetryPolicy, compact_threshold: u64) -> Scheduler {
        let settings = EngineSettings {
            window: BookingWindow::new(6, 22, chrono_tz::UTC).unwrap(),
            lock_timeout: Duration::from_millis(50),
            allow_past: true,
        };
        let engine = Engine::new(wal_path(name), Catalog::builtin(), settings).unwrap();
        Scheduler::new(engine, retry, compact_threshold)
    }

    fn booking(resource_id: ResourceId, hour: i64) -> NewReservation {
        NewReservation {
            resource_id,
            span: Span::new(at(hour), at(hour + 1)),
            author_id: 1,
            max_participants: 2,
            participants: Vec::new(),
        }
    }

    #[tokio::test]
    async fn filters_select_reservations() {
        let s = scheduler("filters.wal", RetryPolicy::none(), 0);
        let mine = s.create_reservation(booking(1, 9)).await.unwrap();
        let theirs = s
            .create_reservation(NewReservation {
                author_id: 2,
                ..booking(2, 10)
            })
            .await
            .unwrap();

        assert_eq!(s.list_reservations(ReservationFilter::All).await.unwrap().len(), 2);
        assert_eq!(
            s.list_reservations(ReservationFilter::ForUser(1)).await.unwrap(),
            vec![mine.clone()]
        );
        s.join(mine.id, 2).await.unwrap();
        let for_two: Vec<_> = s
            .list_reservations(ReservationFilter::ForUser(2))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(for_two, vec![theirs.id, mine.id]);
    }

    #[tokio::test]
    async fn business_errors_are_not_retried() {
        let s = scheduler("no_retry.wal", RetryPolicy::new(5, 1, 1, 0.0), 0);
        let first = s.create_reservation(booking(1, 9)).await.unwrap();
        assert_eq!(
            s.create_reservation(booking(1, 9)).await,
            Err(EngineError::Overlap(first.id))
        );
        assert_eq!(
            s.delete_reservation(first.id, 99).await,
            Err(EngineError::Forbidden(first.id))
        );
    }

    #[tokio::test]
    async fn timeout_surfaces_after_retries() {
        let s = scheduler("timeout_exhausted.wal", RetryPolicy::new(2, 1, 1, 0.0), 0);
        let rs = s.engine.get_resource(1).unwrap();
        let _held = rs.write_owned().await;
        assert_eq!(s.create_reservation(booking(1, 9)).await, Err(EngineError::Timeout));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_retried_until_lock_frees() {
        let s = Arc::new(scheduler("timeout_retry.wal", RetryPolicy::new(10, 20, 20, 0.0), 0));
        let rs = s.engine.get_resource(1).unwrap();
        let held = rs.write_owned().await;
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            drop(held);
        });
        s.create_reservation(booking(1, 9)).await.unwrap();
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn writes_trigger_compaction() {
        let s = scheduler("auto_compact.wal", RetryPolicy::none(), 3);
        for hour in 9..12 {
            s.create_reservation(booking(1, hour)).await.unwrap();
        }
        assert_eq!(s.engine.wal_appends_since_compact().await, 0);
        s.create_reservation(booking(1, 12)).await.unwrap();
        assert_eq!(s.engine.wal_appends_since_compact().await, 1);
    }

    #[tokio::test]
    async fn availability_passthrough() {
        let s = scheduler("availability.wal", RetryPolicy::none(), 0);
        s.create_reservation(booking(3, 9)).await.unwrap();
        let date = chrono::NaiveDate::from_ymd_opt(2030, 6, 10).unwrap();
        let occupied: Vec<_> = s.occupied_hours(3, date).await.unwrap().iter().map(|h| h.label()).collect();
        assert_eq!(occupied, vec!["09:00"]);
        assert_eq!(s.free_intervals(3, date).await.unwrap().len(), 15);
        assert_eq!(s.list_by_resource_and_date(3, date).await.unwrap().len(), 1);
    }
}
