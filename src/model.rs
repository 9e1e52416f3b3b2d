use std::collections::BTreeSet;

use chrono::{NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). Every stored instant uses this.
pub type Ms = i64;

/// Catalog id of a bookable field or court.
pub type ResourceId = u32;

/// Caller-supplied, already-authenticated user id.
pub type UserId = u64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `end > start`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Bookable window ──────────────────────────────────────────────

/// Daily bookable hours `[open_hour, close_hour)` in a fixed time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingWindow {
    open_hour: u32,
    close_hour: u32,
    tz: Tz,
}

impl BookingWindow {
    /// Requires `open_hour < close_hour <= 24`.
    pub fn new(open_hour: u32, close_hour: u32, tz: Tz) -> Option<Self> {
        (open_hour < close_hour && close_hour <= 24).then_some(Self {
            open_hour,
            close_hour,
            tz,
        })
    }

    pub fn open_hour(&self) -> u32 {
        self.open_hour
    }

    pub fn close_hour(&self) -> u32 {
        self.close_hour
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Calendar date of an instant in the window's zone.
    pub fn local_date(&self, t: Ms) -> Option<NaiveDate> {
        self.tz
            .timestamp_millis_opt(t)
            .single()
            .map(|dt| dt.date_naive())
    }

    /// Local midnight to the following local midnight.
    pub fn day_span(&self, date: NaiveDate) -> Option<Span> {
        let start = local_hour_instant(self.tz, date, 0)?;
        let end = local_hour_instant(self.tz, date, 24)?;
        Span::checked(start, end)
    }

    /// Opening to closing instant on `date`.
    pub fn bounds(&self, date: NaiveDate) -> Option<Span> {
        let start = local_hour_instant(self.tz, date, self.open_hour)?;
        let end = local_hour_instant(self.tz, date, self.close_hour)?;
        Span::checked(start, end)
    }

    /// True when `span` sits inside the window of its start's local date.
    pub fn contains(&self, span: &Span) -> bool {
        self.local_date(span.start)
            .and_then(|date| self.bounds(date))
            .is_some_and(|bounds| bounds.contains_span(span))
    }

    /// One-hour candidate slots covering the window on `date`.
    pub fn hour_slots(&self, date: NaiveDate) -> HourSlots {
        HourSlots {
            tz: self.tz,
            date,
            next_hour: self.open_hour,
            close_hour: self.close_hour,
        }
    }

    /// RFC 3339 rendering in the window's zone.
    pub fn format_instant(&self, t: Ms) -> String {
        match self.tz.timestamp_millis_opt(t).single() {
            Some(dt) => dt.to_rfc3339(),
            None => t.to_string(),
        }
    }
}

/// Instant of `hour:00` local time on `date`. Hour 24 is the next midnight.
/// Ambiguous local times resolve to the earlier instant; nonexistent ones are `None`.
fn local_hour_instant(tz: Tz, date: NaiveDate, hour: u32) -> Option<Ms> {
    let naive = if hour == 24 {
        date.succ_opt()?.and_hms_opt(0, 0, 0)?
    } else {
        date.and_hms_opt(hour, 0, 0)?
    };
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// A one-hour candidate slot, labelled by its local starting hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourSlot {
    pub hour: u32,
    pub span: Span,
}

impl HourSlot {
    /// `"09:00"`
    pub fn label(&self) -> String {
        format!("{:02}:00", self.hour)
    }

    /// `"09:00 - 10:00"`
    pub fn range_label(&self) -> String {
        format!("{:02}:00 - {:02}:00", self.hour, self.hour + 1)
    }
}

/// Lazy iterator over a day's hour slots. Clone it to iterate again.
#[derive(Debug, Clone)]
pub struct HourSlots {
    tz: Tz,
    date: NaiveDate,
    next_hour: u32,
    close_hour: u32,
}

impl Iterator for HourSlots {
    type Item = HourSlot;

    fn next(&mut self) -> Option<HourSlot> {
        while self.next_hour < self.close_hour {
            let hour = self.next_hour;
            self.next_hour += 1;
            // DST gap: a local hour that never happens yields no slot, and the
            // slot before it runs to the next local hour that does exist.
            let start = local_hour_instant(self.tz, self.date, hour);
            let end = (hour + 1..=24).find_map(|h| local_hour_instant(self.tz, self.date, h));
            if let (Some(start), Some(end)) = (start, end)
                && let Some(span) = Span::checked(start, end)
            {
                return Some(HourSlot { hour, span });
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.close_hour.saturating_sub(self.next_hour) as usize))
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: ResourceId,
    pub span: Span,
    pub author_id: UserId,
    pub max_participants: u32,
    /// Joiners besides the author. Never contains `author_id`.
    pub participants: BTreeSet<UserId>,
}

impl Reservation {
    /// Slots in use, counting the author.
    pub fn occupied(&self) -> usize {
        self.participants.len() + 1
    }

    pub fn is_full(&self) -> bool {
        self.occupied() >= self.max_participants as usize
    }

    pub fn open_slots(&self) -> usize {
        (self.max_participants as usize).saturating_sub(self.occupied())
    }

    /// Author or participant.
    pub fn involves(&self, user: UserId) -> bool {
        self.author_id == user || self.participants.contains(&user)
    }
}

/// Input for a new reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub resource_id: ResourceId,
    pub span: Span,
    pub author_id: UserId,
    pub max_participants: u32,
    pub participants: Vec<UserId>,
}

/// The author-editable fields of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationChange {
    pub resource_id: ResourceId,
    pub span: Span,
    pub max_participants: u32,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: ResourceId,
    pub name: String,
    /// Sorted by `span.start`; pairwise non-overlapping.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: ResourceId, name: String) -> Self {
        Self {
            id,
            name,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose span overlaps the query window, in start order.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// WAL record format. Each variant names the resource(s) it touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Reservation,
    },
    /// Carries the full post-update reservation; `from_resource` differs from
    /// `reservation.resource_id` when the booking moved fields.
    ReservationUpdated {
        from_resource: ResourceId,
        reservation: Reservation,
    },
    ReservationDeleted {
        id: Ulid,
        resource_id: ResourceId,
    },
    ParticipantJoined {
        id: Ulid,
        resource_id: ResourceId,
        user_id: UserId,
    },
    ParticipantLeft {
        id: Ulid,
        resource_id: ResourceId,
        user_id: UserId,
    },
}

impl Event {
    /// Resources whose state this event changes (one, or two for a move).
    pub fn resources(&self) -> Vec<ResourceId> {
        match self {
            Event::ReservationCreated { reservation } => vec![reservation.resource_id],
            Event::ReservationUpdated {
                from_resource,
                reservation,
            } if *from_resource != reservation.resource_id => {
                vec![*from_resource, reservation.resource_id]
            }
            Event::ReservationUpdated { reservation, .. } => vec![reservation.resource_id],
            Event::ReservationDeleted { resource_id, .. }
            | Event::ParticipantJoined { resource_id, .. }
            | Event::ParticipantLeft { resource_id, .. } => vec![*resource_id],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc_window() -> BookingWindow {
        BookingWindow::new(6, 22, chrono_tz::UTC).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 6, 10).unwrap()
    }

    fn at(hour: i64) -> Ms {
        let midnight = chrono::Utc
            .with_ymd_and_hms(2030, 6, 10, 0, 0, 0)
            .unwrap()
            .timestamp_millis();
        midnight + hour * HOUR_MS
    }

    fn reservation(start: Ms, end: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id: 1,
            span: Span::new(start, end),
            author_id: 7,
            max_participants: 2,
            participants: BTreeSet::new(),
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_checked_rejects_empty_and_inverted() {
        assert!(Span::checked(100, 100).is_none());
        assert!(Span::checked(200, 100).is_none());
        assert_eq!(Span::checked(100, 101), Some(Span::new(100, 101)));
    }

    #[test]
    fn window_rejects_bad_hours() {
        assert!(BookingWindow::new(22, 6, chrono_tz::UTC).is_none());
        assert!(BookingWindow::new(6, 6, chrono_tz::UTC).is_none());
        assert!(BookingWindow::new(0, 25, chrono_tz::UTC).is_none());
        assert!(BookingWindow::new(0, 24, chrono_tz::UTC).is_some());
    }

    #[test]
    fn hour_slots_cover_window() {
        let slots: Vec<_> = utc_window().hour_slots(day()).collect();
        assert_eq!(slots.len(), 16);
        assert_eq!(slots[0].hour, 6);
        assert_eq!(slots[0].span, Span::new(at(6), at(7)));
        assert_eq!(slots[15].hour, 21);
        assert_eq!(slots[15].span, Span::new(at(21), at(22)));
        assert!(slots.windows(2).all(|w| w[0].span.end == w[1].span.start));
    }

    #[test]
    fn hour_slots_restartable() {
        let slots = utc_window().hour_slots(day());
        let first: Vec<_> = slots.clone().collect();
        let second: Vec<_> = slots.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn hour_slots_skip_dst_gap() {
        // Europe/Bucharest jumps 03:00 -> 04:00 on 2030-03-31.
        let window = BookingWindow::new(0, 6, chrono_tz::Europe::Bucharest).unwrap();
        let date = NaiveDate::from_ymd_opt(2030, 3, 31).unwrap();
        let hours: Vec<u32> = window.hour_slots(date).map(|s| s.hour).collect();
        assert_eq!(hours, vec![0, 1, 2, 4, 5]);
    }

    #[test]
    fn slot_labels() {
        let slot = HourSlot {
            hour: 9,
            span: Span::new(at(9), at(10)),
        };
        assert_eq!(slot.label(), "09:00");
        assert_eq!(slot.range_label(), "09:00 - 10:00");
    }

    #[test]
    fn window_contains() {
        let w = utc_window();
        assert!(w.contains(&Span::new(at(6), at(7))));
        assert!(w.contains(&Span::new(at(21), at(22))));
        assert!(!w.contains(&Span::new(at(5), at(7))));
        assert!(!w.contains(&Span::new(at(21), at(23))));
    }

    #[test]
    fn window_local_date_respects_zone() {
        let w = BookingWindow::new(6, 22, chrono_tz::Europe::Bucharest).unwrap();
        // 22:30 UTC on June 9th is already June 10th in Bucharest (UTC+3).
        let t = at(-1) - HOUR_MS / 2;
        assert_eq!(w.local_date(t), Some(day()));
    }

    #[test]
    fn reservation_capacity_counts_author() {
        let mut r = reservation(at(9), at(10));
        assert_eq!(r.occupied(), 1);
        assert!(!r.is_full());
        r.participants.insert(8);
        assert!(r.is_full());
        assert_eq!(r.open_slots(), 0);
        assert!(r.involves(7));
        assert!(r.involves(8));
        assert!(!r.involves(9));
    }

    #[test]
    fn reservations_kept_in_start_order() {
        let mut rs = ResourceState::new(1, "Football Field 1".into());
        rs.insert_reservation(reservation(at(12), at(13)));
        rs.insert_reservation(reservation(at(8), at(9)));
        rs.insert_reservation(reservation(at(10), at(11)));
        let starts: Vec<_> = rs.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![at(8), at(10), at(12)]);
    }

    #[test]
    fn remove_missing_returns_none() {
        let mut rs = ResourceState::new(1, "Court".into());
        rs.insert_reservation(reservation(at(8), at(9)));
        assert!(rs.remove_reservation(Ulid::new()).is_none());
        assert_eq!(rs.reservations.len(), 1);
    }

    #[test]
    fn overlapping_window_query() {
        let mut rs = ResourceState::new(1, "Court".into());
        rs.insert_reservation(reservation(at(7), at(8)));
        rs.insert_reservation(reservation(at(9), at(11)));
        rs.insert_reservation(reservation(at(14), at(15)));

        let hits: Vec<_> = rs.overlapping(&Span::new(at(10), at(14))).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(at(9), at(11)));

        // Adjacent on both sides: nothing.
        let none: Vec<_> = rs.overlapping(&Span::new(at(8), at(9))).collect();
        assert!(none.is_empty());
    }

    #[test]
    fn event_touches_both_resources_on_move() {
        let mut r = reservation(at(9), at(10));
        r.resource_id = 3;
        let moved = Event::ReservationUpdated {
            from_resource: 1,
            reservation: r.clone(),
        };
        assert_eq!(moved.resources(), vec![1, 3]);

        let in_place = Event::ReservationUpdated {
            from_resource: 3,
            reservation: r,
        };
        assert_eq!(in_place.resources(), vec![3]);
    }
}
