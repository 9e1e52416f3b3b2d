use std::collections::BTreeSet;

use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_overlap, now_ms, validate_capacity, validate_span};
use super::{apply_to_resource, Engine, EngineError, WalCommand};

/// Author-only guard shared by update and delete.
fn check_author(reservation: &Reservation, requester_id: UserId) -> Result<(), EngineError> {
    if reservation.author_id != requester_id {
        return Err(EngineError::Forbidden(reservation.id));
    }
    Ok(())
}

/// The post-update reservation, or the reason the change is refused.
/// Shrinking below the current roster is refused rather than evicting anyone.
fn apply_change(
    current: &Reservation,
    change: &ReservationChange,
    requester_id: UserId,
) -> Result<Reservation, EngineError> {
    check_author(current, requester_id)?;
    if (change.max_participants as usize) < current.occupied() {
        return Err(EngineError::CapacityBelowCurrent {
            requested: change.max_participants,
            occupied: current.occupied(),
        });
    }
    Ok(Reservation {
        resource_id: change.resource_id,
        span: change.span,
        max_participants: change.max_participants,
        ..current.clone()
    })
}

impl Engine {
    /// Book `req.span` on `req.resource_id`. Overlap is checked and the event
    /// committed under the field's write lock.
    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        validate_capacity(req.max_participants)?;
        validate_span(&self.settings.window, &req.span, now_ms(), self.settings.allow_past)?;

        let participants: BTreeSet<UserId> = req.participants.iter().copied().collect();
        if participants.contains(&req.author_id) {
            return Err(EngineError::AuthorInRoster(req.author_id));
        }
        if participants.len() + 1 > req.max_participants as usize {
            return Err(EngineError::CapacityFull(req.max_participants));
        }

        let mut guard = self.lock_resource(req.resource_id).await?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }
        check_no_overlap(&guard, &req.span, None)?;

        let reservation = Reservation {
            id: Ulid::new(),
            resource_id: req.resource_id,
            span: req.span,
            author_id: req.author_id,
            max_participants: req.max_participants,
            participants,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(
            "reservation {id} created on resource {} by user {}",
            reservation.resource_id, reservation.author_id, id = reservation.id
        );
        Ok(reservation)
    }

    /// Replace field, span and capacity. Only the author may do this; the
    /// reservation's own interval never counts as a conflict. A move to another
    /// field holds both fields' locks, taken in ascending id order.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        change: ReservationChange,
        requester_id: UserId,
    ) -> Result<Reservation, EngineError> {
        validate_capacity(change.max_participants)?;
        validate_span(&self.settings.window, &change.span, now_ms(), self.settings.allow_past)?;
        if self.get_resource(change.resource_id).is_none() {
            return Err(EngineError::UnknownResource(change.resource_id));
        }

        loop {
            let from_resource = self.resource_of(&id).ok_or(EngineError::NotFound(id))?;

            if from_resource == change.resource_id {
                let mut guard = self.lock_resource(from_resource).await?;
                let Some(current) = guard.get(&id) else {
                    if self.moved_away(&id, from_resource)? {
                        continue;
                    }
                    return Err(EngineError::NotFound(id));
                };
                let updated = apply_change(current, &change, requester_id)?;
                check_no_overlap(&guard, &change.span, Some(id))?;

                let event = Event::ReservationUpdated {
                    from_resource,
                    reservation: updated.clone(),
                };
                self.persist_and_apply(&mut guard, &event).await?;
                info!("reservation {id} updated by user {requester_id}");
                return Ok(updated);
            }

            let (mut src, mut dst) = self.lock_pair(from_resource, change.resource_id).await?;
            let Some(current) = src.get(&id) else {
                if self.moved_away(&id, from_resource)? {
                    continue;
                }
                return Err(EngineError::NotFound(id));
            };
            let updated = apply_change(current, &change, requester_id)?;
            if dst.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
                return Err(EngineError::LimitExceeded("too many reservations on resource"));
            }
            check_no_overlap(&dst, &change.span, None)?;

            let event = Event::ReservationUpdated {
                from_resource,
                reservation: updated.clone(),
            };
            self.wal_append(&event).await?;
            apply_to_resource(&mut src, &event, &self.reservation_index);
            apply_to_resource(&mut dst, &event, &self.reservation_index);
            info!(
                "reservation {id} moved from resource {from_resource} to {} by user {requester_id}",
                change.resource_id
            );
            return Ok(updated);
        }
    }

    /// After a lookup miss under `rid`'s lock: true when the index now points
    /// elsewhere, i.e. the reservation moved while we waited.
    fn moved_away(&self, id: &Ulid, rid: ResourceId) -> Result<bool, EngineError> {
        let now_at = self.resource_of(id).ok_or(EngineError::NotFound(*id))?;
        Ok(now_at != rid)
    }

    pub async fn delete_reservation(&self, id: Ulid, requester_id: UserId) -> Result<(), EngineError> {
        let (resource_id, mut guard) = self.lock_reservation(id).await?;
        let current = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        check_author(current, requester_id)?;

        let event = Event::ReservationDeleted { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("reservation {id} deleted by user {requester_id}");
        Ok(())
    }

    /// Rewrite the WAL as one `ReservationCreated` per live reservation.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Every mutation holds its field's write lock until its event is
        // durable, so holding all read locks pins a snapshot the log agrees
        // with. Ascending order matches `lock_pair`.
        let mut guards = Vec::new();
        let mut events = Vec::new();
        for rid in self.resource_ids() {
            let guard = self.read_resource(rid).await?;
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
            guards.push(guard);
        }
        let live = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        info!("WAL compacted to {live} reservations");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Compact once `threshold` appends have piled up. Returns whether it ran.
    pub async fn maybe_compact(&self, threshold: u64) -> Result<bool, EngineError> {
        if threshold == 0 || self.wal_appends_since_compact().await < threshold {
            return Ok(false);
        }
        self.compact_wal().await?;
        Ok(true)
    }
}
