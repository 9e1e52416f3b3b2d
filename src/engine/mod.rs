mod availability;
mod conflict;
mod error;
mod membership;
mod mutations;
mod queries;

pub use availability::{free_slots, occupied_slots};
pub use error::EngineError;
pub use membership::{check_join, check_leave};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Knobs the engine enforces on every call.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub window: BookingWindow,
    /// Budget for acquiring any lock before `EngineError::Timeout`.
    pub lock_timeout: Duration,
    /// Accept spans that start before now.
    pub allow_past: bool,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Each wake-up drains every append already queued and makes
/// them durable with a single fsync before acknowledging any of them.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Control commands see every append queued before them.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        tracing::error!("WAL write to {} failed: {e}", wal.path().display());
        // Every caller in this batch is told it failed, so none of it may
        // stay on disk ahead of the next batch.
        if let Err(e) = wal.discard_unsynced() {
            tracing::error!("rolling back {} failed: {e}", wal.path().display());
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed as control command")));
        }
    }
}

/// The reservation store. One `RwLock` per field serializes every check and
/// commit touching that field; different fields never contend.
pub struct Engine {
    catalog: Catalog,
    resources: HashMap<ResourceId, SharedResourceState>,
    /// Reverse lookup: reservation id → field currently holding it.
    pub(super) reservation_index: DashMap<Ulid, ResourceId>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) settings: EngineSettings,
}

/// Apply a committed event to one field's state. The caller holds the lock.
/// Moves call this on both the source and destination field.
pub(super) fn apply_to_resource(
    rs: &mut ResourceState,
    event: &Event,
    index: &DashMap<Ulid, ResourceId>,
) {
    match event {
        Event::ReservationCreated { reservation } => {
            rs.insert_reservation(reservation.clone());
            index.insert(reservation.id, rs.id);
        }
        Event::ReservationUpdated {
            from_resource,
            reservation,
        } => {
            if rs.id == *from_resource {
                rs.remove_reservation(reservation.id);
            }
            if rs.id == reservation.resource_id {
                rs.insert_reservation(reservation.clone());
                index.insert(reservation.id, rs.id);
            }
        }
        Event::ReservationDeleted { id, .. } => {
            rs.remove_reservation(*id);
            index.remove(id);
        }
        Event::ParticipantJoined { id, user_id, .. } => {
            if let Some(r) = rs.get_mut(id) {
                r.participants.insert(*user_id);
            }
        }
        Event::ParticipantLeft { id, user_id, .. } => {
            if let Some(r) = rs.get_mut(id) {
                r.participants.remove(user_id);
            }
        }
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` over the catalog and start the writer task.
    /// Must be called inside a Tokio runtime.
    pub fn new(wal_path: PathBuf, catalog: Catalog, settings: EngineSettings) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;

        // Replay into plain state first; locks are only wrapped on afterwards.
        let mut states: HashMap<ResourceId, ResourceState> = catalog
            .iter()
            .map(|r| (r.id, ResourceState::new(r.id, r.name.clone())))
            .collect();
        let reservation_index = DashMap::new();
        let mut skipped = 0usize;
        for event in &events {
            let touched = event.resources();
            if !touched.iter().all(|rid| states.contains_key(rid)) {
                skipped += 1;
                continue;
            }
            for rid in touched {
                if let Some(rs) = states.get_mut(&rid) {
                    apply_to_resource(rs, event, &reservation_index);
                }
            }
        }
        if skipped > 0 {
            warn!("replay skipped {skipped} events for fields missing from the catalog");
        }
        info!(
            "replayed {} events from {}: {} live reservations",
            events.len(),
            wal_path.display(),
            reservation_index.len()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            catalog,
            resources: states
                .into_iter()
                .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
                .collect(),
            reservation_index,
            wal_tx,
            settings,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn window(&self) -> &BookingWindow {
        &self.settings.window
    }

    pub fn get_resource(&self, id: ResourceId) -> Option<SharedResourceState> {
        self.resources.get(&id).cloned()
    }

    pub fn resource_of(&self, reservation_id: &Ulid) -> Option<ResourceId> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    /// Send an event to the group-commit writer and wait until it is durable.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply, under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.reservation_index);
        Ok(())
    }

    // ── Locking ──────────────────────────────────────────

    pub(super) async fn lock_resource(
        &self,
        id: ResourceId,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self.get_resource(id).ok_or(EngineError::UnknownResource(id))?;
        tokio::time::timeout(self.settings.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| EngineError::Timeout)
    }

    pub(super) async fn read_resource(
        &self,
        id: ResourceId,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        let rs = self.get_resource(id).ok_or(EngineError::UnknownResource(id))?;
        tokio::time::timeout(self.settings.lock_timeout, rs.read_owned())
            .await
            .map_err(|_| EngineError::Timeout)
    }

    /// Lock two fields in ascending id order; guards come back as `(a, b)`.
    pub(super) async fn lock_pair(
        &self,
        a: ResourceId,
        b: ResourceId,
    ) -> Result<(OwnedRwLockWriteGuard<ResourceState>, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        debug_assert_ne!(a, b);
        if a < b {
            let ga = self.lock_resource(a).await?;
            let gb = self.lock_resource(b).await?;
            Ok((ga, gb))
        } else {
            let gb = self.lock_resource(b).await?;
            let ga = self.lock_resource(a).await?;
            Ok((ga, gb))
        }
    }

    /// Write-lock the field holding `id`. Retries if the reservation moved to
    /// another field while we waited for the lock.
    pub(super) async fn lock_reservation(
        &self,
        id: Ulid,
    ) -> Result<(ResourceId, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        loop {
            let rid = self.resource_of(&id).ok_or(EngineError::NotFound(id))?;
            let guard = self.lock_resource(rid).await?;
            if guard.get(&id).is_some() {
                return Ok((rid, guard));
            }
            drop(guard);
            if self.resource_of(&id).ok_or(EngineError::NotFound(id))? == rid {
                return Err(EngineError::NotFound(id));
            }
        }
    }

    /// Read-lock counterpart of `lock_reservation`.
    pub(super) async fn read_reservation(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, EngineError> {
        loop {
            let rid = self.resource_of(&id).ok_or(EngineError::NotFound(id))?;
            let guard = self.read_resource(rid).await?;
            if guard.get(&id).is_some() {
                return Ok(guard);
            }
            drop(guard);
            if self.resource_of(&id).ok_or(EngineError::NotFound(id))? == rid {
                return Err(EngineError::NotFound(id));
            }
        }
    }

    /// Field ids in ascending order.
    pub(super) fn resource_ids(&self) -> Vec<ResourceId> {
        self.catalog.iter().map(|r| r.id).collect()
    }
}
