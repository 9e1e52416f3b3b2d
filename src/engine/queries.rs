use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{free_slots, occupied_slots};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let guard = self.read_reservation(id).await?;
        guard.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Reservations overlapping the local calendar day, ascending by start.
    pub async fn list_by_resource_and_date(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        let day = self
            .settings
            .window
            .day_span(date)
            .ok_or(EngineError::InvalidInterval("date has no local midnight"))?;
        let guard = self.read_resource(resource_id).await?;
        Ok(guard.overlapping(&day).cloned().collect())
    }

    /// Everything the user authored or joined, newest start first.
    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Reservation>, EngineError> {
        let mut found = Vec::new();
        for rid in self.resource_ids() {
            let guard = self.read_resource(rid).await?;
            found.extend(guard.reservations.iter().filter(|r| r.involves(user_id)).cloned());
        }
        found.sort_by(|a, b| {
            b.span
                .start
                .cmp(&a.span.start)
                .then(a.resource_id.cmp(&b.resource_id))
        });
        Ok(found)
    }

    /// Every reservation, ascending by start then field.
    pub async fn list_all(&self) -> Result<Vec<Reservation>, EngineError> {
        let mut all = Vec::new();
        for rid in self.resource_ids() {
            let guard = self.read_resource(rid).await?;
            all.extend(guard.reservations.iter().cloned());
        }
        all.sort_by_key(|r| (r.span.start, r.resource_id));
        Ok(all)
    }

    /// Reserved spans on the field that touch the day's bookable window.
    async fn reserved_in_window(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
    ) -> Result<(HourSlots, Vec<Span>), EngineError> {
        let window = &self.settings.window;
        let bounds = window
            .bounds(date)
            .ok_or(EngineError::InvalidInterval("bookable window does not exist on date"))?;
        let guard = self.read_resource(resource_id).await?;
        let reserved = guard.overlapping(&bounds).map(|r| r.span).collect();
        Ok((window.hour_slots(date), reserved))
    }

    /// Hour slots touched by any reservation on `date`.
    pub async fn occupied_hours(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
    ) -> Result<Vec<HourSlot>, EngineError> {
        let (slots, reserved) = self.reserved_in_window(resource_id, date).await?;
        Ok(occupied_slots(slots, &reserved))
    }

    /// Complement of `occupied_hours` within the window, one hour per entry.
    pub async fn free_intervals(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
    ) -> Result<Vec<HourSlot>, EngineError> {
        let (slots, reserved) = self.reserved_in_window(resource_id, date).await?;
        Ok(free_slots(slots, &reserved))
    }
}
