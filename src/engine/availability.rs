use crate::model::*;

// ── Hour-slot occupancy ───────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Walk the slots and the merged busy spans together, splitting slots by
/// whether they touch any busy span. A partial overlap claims the whole hour.
fn partition_slots(
    slots: impl IntoIterator<Item = HourSlot>,
    reserved: &[Span],
) -> (Vec<HourSlot>, Vec<HourSlot>) {
    let mut sorted = reserved.to_vec();
    sorted.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&sorted);

    let mut occupied = Vec::new();
    let mut free = Vec::new();
    let mut bi = 0;
    for slot in slots {
        while bi < busy.len() && busy[bi].end <= slot.span.start {
            bi += 1;
        }
        if bi < busy.len() && busy[bi].overlaps(&slot.span) {
            occupied.push(slot);
        } else {
            free.push(slot);
        }
    }
    (occupied, free)
}

/// Slots overlapping any reserved span, in chronological order.
pub fn occupied_slots(slots: impl IntoIterator<Item = HourSlot>, reserved: &[Span]) -> Vec<HourSlot> {
    partition_slots(slots, reserved).0
}

/// Slots overlapping no reserved span, in chronological order. Runs are not
/// merged: each entry is a single hour.
pub fn free_slots(slots: impl IntoIterator<Item = HourSlot>, reserved: &[Span]) -> Vec<HourSlot> {
    partition_slots(slots, reserved).1
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;

    fn window() -> BookingWindow {
        BookingWindow::new(6, 22, chrono_tz::UTC).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 6, 10).unwrap()
    }

    fn at(hour: i64, minute: i64) -> Ms {
        chrono::Utc
            .with_ymd_and_hms(2030, 6, 10, 0, 0, 0)
            .unwrap()
            .timestamp_millis()
            + hour * HOUR_MS
            + minute * 60_000
    }

    fn hours(slots: &[HourSlot]) -> Vec<u32> {
        slots.iter().map(|s| s.hour).collect()
    }

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(0, 10), Span::new(5, 15), Span::new(20, 30)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 15), Span::new(20, 30)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(0, 10), Span::new(10, 20)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 20)]);
    }

    #[test]
    fn empty_day_is_all_free() {
        let slots = window().hour_slots(day());
        assert!(occupied_slots(slots.clone(), &[]).is_empty());
        assert_eq!(free_slots(slots, &[]).len(), 16);
    }

    #[test]
    fn two_booked_hours_leave_fourteen_free() {
        let reserved = [Span::new(at(9, 0), at(11, 0))];
        let slots = window().hour_slots(day());
        assert_eq!(hours(&occupied_slots(slots.clone(), &reserved)), vec![9, 10]);

        let free = free_slots(slots, &reserved);
        assert_eq!(free.len(), 14);
        assert!(free.windows(2).all(|w| w[0].span.start < w[1].span.start));
        assert!(!hours(&free).contains(&9));
        assert!(!hours(&free).contains(&10));
    }

    #[test]
    fn partial_overlap_claims_whole_hour() {
        let reserved = [Span::new(at(13, 30), at(14, 15))];
        let occupied = occupied_slots(window().hour_slots(day()), &reserved);
        assert_eq!(hours(&occupied), vec![13, 14]);
    }

    #[test]
    fn boundary_touch_is_not_occupied() {
        // Ends exactly when the 10:00 slot starts.
        let reserved = [Span::new(at(9, 0), at(10, 0))];
        let occupied = occupied_slots(window().hour_slots(day()), &reserved);
        assert_eq!(hours(&occupied), vec![9]);
    }

    #[test]
    fn unsorted_reservations_handled() {
        let reserved = [
            Span::new(at(18, 0), at(19, 0)),
            Span::new(at(7, 0), at(8, 0)),
            Span::new(at(12, 0), at(13, 0)),
        ];
        let occupied = occupied_slots(window().hour_slots(day()), &reserved);
        assert_eq!(hours(&occupied), vec![7, 12, 18]);
    }

    #[test]
    fn occupied_and_free_partition_the_window() {
        let reserved = [Span::new(at(6, 0), at(6, 30)), Span::new(at(21, 45), at(22, 0))];
        let slots = window().hour_slots(day());
        let occupied = occupied_slots(slots.clone(), &reserved);
        let free = free_slots(slots.clone(), &reserved);
        assert_eq!(occupied.len() + free.len(), slots.count());
        assert_eq!(hours(&occupied), vec![6, 21]);
    }
}
