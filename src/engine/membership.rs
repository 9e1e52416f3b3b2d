use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Whether `user_id` may join `r`. The author holds a slot implicitly and is
/// never listed; re-joining is an error, not a no-op.
pub fn check_join(r: &Reservation, user_id: UserId) -> Result<(), EngineError> {
    if r.author_id == user_id {
        return Err(EngineError::AlreadyAuthor(r.id));
    }
    if r.participants.contains(&user_id) {
        return Err(EngineError::AlreadyParticipant(r.id));
    }
    if r.is_full() {
        return Err(EngineError::CapacityFull(r.max_participants));
    }
    Ok(())
}

/// Whether `user_id` may leave `r`. The author cannot leave through this path.
pub fn check_leave(r: &Reservation, user_id: UserId) -> Result<(), EngineError> {
    if !r.participants.contains(&user_id) {
        return Err(EngineError::NotAParticipant(r.id));
    }
    Ok(())
}

impl Engine {
    pub async fn join(&self, id: Ulid, user_id: UserId) -> Result<Reservation, EngineError> {
        let (resource_id, mut guard) = self.lock_reservation(id).await?;
        check_join(guard.get(&id).ok_or(EngineError::NotFound(id))?, user_id)?;

        let event = Event::ParticipantJoined {
            id,
            resource_id,
            user_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("user {user_id} joined reservation {id}");
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn leave(&self, id: Ulid, user_id: UserId) -> Result<Reservation, EngineError> {
        let (resource_id, mut guard) = self.lock_reservation(id).await?;
        check_leave(guard.get(&id).ok_or(EngineError::NotFound(id))?, user_id)?;

        let event = Event::ParticipantLeft {
            id,
            resource_id,
            user_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("user {user_id} left reservation {id}");
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}
