//! Time-slot math for the reservation grid.
//!
//! All intervals are half-open `[start, end)`: a reservation ending at 10:00
//! never conflicts with one starting at 10:00. Conflict detection is a linear
//! scan over one resource's reservations for the affected window, which stays
//! cheap at clinic scale (dozens of rows per day).

use chrono::{DateTime, Duration, Timelike, Utc};
use uuid::Uuid;

pub const MINUTES_PER_DAY: i32 = 1440;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("derived duration must be positive, got {0} minutes")]
    NonPositiveDuration(i64),
    #[error("end_at must be after start_at")]
    EmptyInterval,
}

/// One already-booked interval on a resource, as fed to the conflict scan.
#[derive(Debug, Clone)]
pub struct BookedInterval {
    pub reservation_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

/// Half-open interval overlap: `[a_start, a_end)` vs `[b_start, b_end)`.
pub fn overlaps(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && a_end > b_start
}

/// Linear scan for conflicts against `existing`, skipping `exclude`
/// (the reservation being moved). Callers pre-filter terminal statuses.
pub fn find_conflicts(
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    existing: &[BookedInterval],
    exclude: Option<Uuid>,
) -> Vec<Uuid> {
    existing
        .iter()
        .filter(|b| exclude != Some(b.reservation_id))
        .filter(|b| overlaps(start_at, end_at, b.start_at, b.end_at))
        .map(|b| b.reservation_id)
        .collect()
}

/// Duration of a booking: menu base plus the delta of every selected option.
pub fn derive_duration_minutes(
    menu_minutes: i32,
    option_deltas: &[i32],
) -> Result<i64, ScheduleError> {
    let total = menu_minutes as i64 + option_deltas.iter().map(|d| *d as i64).sum::<i64>();
    if total <= 0 {
        return Err(ScheduleError::NonPositiveDuration(total));
    }
    Ok(total)
}

pub fn derive_end(start_at: DateTime<Utc>, duration_minutes: i64) -> DateTime<Utc> {
    start_at + Duration::minutes(duration_minutes)
}

/// Duration-preserving reschedule: drag-and-drop moves the block, the length
/// stays `end_at - start_at`.
pub fn shift_preserving_duration(
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    new_start: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let duration = end_at - start_at;
    (new_start, new_start + duration)
}

pub fn minute_of_day(ts: DateTime<Utc>) -> i32 {
    (ts.hour() * 60 + ts.minute()) as i32
}

/// Floor-snap a raw minute (the grid's pixel-to-time mapping) onto the slot
/// grid. Out-of-range input clamps into `0..MINUTES_PER_DAY`.
pub fn snap_to_slot(minute: i32, slot_minutes: i32) -> i32 {
    let m = minute.clamp(0, MINUTES_PER_DAY - 1);
    (m / slot_minutes) * slot_minutes
}

/// Same-day opening-hours check. `close_minute` may be 1440 (midnight close).
pub fn within_opening_hours(
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    open_minute: i32,
    close_minute: i32,
) -> Result<bool, ScheduleError> {
    if end_at <= start_at {
        return Err(ScheduleError::EmptyInterval);
    }
    // i64 throughout: a pathological end_at (years out) must not wrap the
    // minute arithmetic and slip past the close check.
    let start_minute = i64::from(minute_of_day(start_at));
    let end_minute = start_minute + (end_at - start_at).num_minutes();
    Ok(start_minute >= i64::from(open_minute)
        && end_minute <= i64::from(close_minute)
        && end_minute <= i64::from(MINUTES_PER_DAY))
}

/// Walk the day's slot grid and propose up to `limit` non-conflicting
/// intervals of `duration_minutes`. `day_start` is the grid day's midnight.
pub fn suggest_free_slots(
    existing: &[BookedInterval],
    day_start: DateTime<Utc>,
    open_minute: i32,
    close_minute: i32,
    duration_minutes: i64,
    slot_minutes: i32,
    limit: usize,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut out = Vec::new();
    if duration_minutes <= 0 || slot_minutes <= 0 || limit == 0 {
        return out;
    }

    let mut minute = snap_to_slot(open_minute, slot_minutes);
    if minute < open_minute {
        minute += slot_minutes;
    }

    while minute + duration_minutes as i32 <= close_minute && out.len() < limit {
        let slot_start = day_start + Duration::minutes(minute as i64);
        let slot_end = derive_end(slot_start, duration_minutes);
        if find_conflicts(slot_start, slot_end, existing, None).is_empty() {
            out.push((slot_start, slot_end));
        }
        minute += slot_minutes;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn booked(start: DateTime<Utc>, end: DateTime<Utc>) -> BookedInterval {
        BookedInterval {
            reservation_id: Uuid::new_v4(),
            start_at: start,
            end_at: end,
        }
    }

    #[test]
    fn overlap_is_half_open() {
        // back-to-back never conflicts
        assert!(!overlaps(ts(9, 0), ts(10, 0), ts(10, 0), ts(11, 0)));
        assert!(!overlaps(ts(10, 0), ts(11, 0), ts(9, 0), ts(10, 0)));
        // one minute of shared time does
        assert!(overlaps(ts(9, 0), ts(10, 1), ts(10, 0), ts(11, 0)));
        // containment
        assert!(overlaps(ts(9, 0), ts(12, 0), ts(10, 0), ts(11, 0)));
        assert!(overlaps(ts(10, 15), ts(10, 30), ts(10, 0), ts(11, 0)));
        // identical
        assert!(overlaps(ts(10, 0), ts(11, 0), ts(10, 0), ts(11, 0)));
    }

    #[test]
    fn find_conflicts_excludes_self() {
        let a = booked(ts(10, 0), ts(11, 0));
        let b = booked(ts(11, 0), ts(12, 0));
        let existing = vec![a.clone(), b.clone()];

        // moving `a` within its own window is fine
        let hits = find_conflicts(ts(10, 15), ts(10, 45), &existing, Some(a.reservation_id));
        assert!(hits.is_empty());

        // without the exclusion the same move conflicts with `a`
        let hits = find_conflicts(ts(10, 15), ts(10, 45), &existing, None);
        assert_eq!(hits, vec![a.reservation_id]);
    }

    #[test]
    fn find_conflicts_reports_every_hit() {
        let a = booked(ts(10, 0), ts(10, 30));
        let b = booked(ts(10, 30), ts(11, 0));
        let existing = vec![a.clone(), b.clone()];

        let hits = find_conflicts(ts(10, 15), ts(10, 45), &existing, None);
        assert_eq!(hits, vec![a.reservation_id, b.reservation_id]);
    }

    #[test]
    fn duration_from_menu_and_options() {
        assert_eq!(derive_duration_minutes(60, &[]).unwrap(), 60);
        assert_eq!(derive_duration_minutes(60, &[15, 30]).unwrap(), 105);
        // options may shorten, down to but not including zero
        assert_eq!(derive_duration_minutes(60, &[-30]).unwrap(), 30);
        assert!(derive_duration_minutes(60, &[-60]).is_err());
        assert!(derive_duration_minutes(30, &[-45]).is_err());
    }

    #[test]
    fn reschedule_preserves_duration() {
        let (start, end) = shift_preserving_duration(ts(10, 0), ts(10, 45), ts(14, 30));
        assert_eq!(start, ts(14, 30));
        assert_eq!(end, ts(15, 15));
        assert_eq!(end - start, Duration::minutes(45));
    }

    #[test]
    fn end_derivation() {
        assert_eq!(derive_end(ts(9, 30), 90), ts(11, 0));
    }

    #[test]
    fn snapping_floors_onto_grid() {
        assert_eq!(snap_to_slot(0, 15), 0);
        assert_eq!(snap_to_slot(7, 15), 0);
        assert_eq!(snap_to_slot(15, 15), 15);
        assert_eq!(snap_to_slot(629, 15), 615);
        // clamped
        assert_eq!(snap_to_slot(-20, 15), 0);
        assert_eq!(snap_to_slot(2000, 15), 1425);
    }

    #[test]
    fn opening_hours_bounds() {
        let open = 9 * 60;
        let close = 19 * 60;
        assert!(within_opening_hours(ts(9, 0), ts(10, 0), open, close).unwrap());
        // flush against closing is allowed (half-open)
        assert!(within_opening_hours(ts(18, 0), ts(19, 0), open, close).unwrap());
        assert!(!within_opening_hours(ts(8, 59), ts(10, 0), open, close).unwrap());
        assert!(!within_opening_hours(ts(18, 30), ts(19, 30), open, close).unwrap());
        assert!(within_opening_hours(ts(23, 0), ts(23, 59), 0, 1440).unwrap());
        assert!(matches!(
            within_opening_hours(ts(10, 0), ts(10, 0), open, close),
            Err(ScheduleError::EmptyInterval)
        ));
    }

    #[test]
    fn opening_hours_reject_oversized_durations() {
        let open = 9 * 60;
        let close = 19 * 60;
        // spans into the next day
        let next_day = ts(9, 0) + Duration::days(1);
        assert!(!within_opening_hours(ts(9, 0), next_day, open, close).unwrap());
        // large enough to wrap 32-bit minute math
        let huge = ts(9, 0) + Duration::minutes(1i64 << 31);
        assert!(!within_opening_hours(ts(9, 0), huge, open, close).unwrap());
        assert!(!within_opening_hours(ts(9, 0), huge, 0, MINUTES_PER_DAY).unwrap());
    }

    #[test]
    fn suggestions_skip_booked_slots() {
        let day_start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let existing = vec![booked(ts(9, 0), ts(10, 0)), booked(ts(10, 30), ts(11, 0))];

        let slots = suggest_free_slots(&existing, day_start, 9 * 60, 12 * 60, 30, 30, 3);
        assert_eq!(
            slots,
            vec![
                (ts(10, 0), ts(10, 30)),
                (ts(11, 0), ts(11, 30)),
                (ts(11, 30), ts(12, 0)),
            ]
        );
    }

    #[test]
    fn suggestions_respect_closing_time() {
        let day_start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        // 60-minute booking, day closes 10:00: only 09:00 fits
        let slots = suggest_free_slots(&[], day_start, 9 * 60, 10 * 60, 60, 15, 5);
        assert_eq!(slots, vec![(ts(9, 0), ts(10, 0))]);
    }

    #[test]
    fn suggestions_empty_when_day_is_full() {
        let day_start = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let existing = vec![booked(ts(9, 0), ts(19, 0))];
        let slots = suggest_free_slots(&existing, day_start, 9 * 60, 19 * 60, 30, 15, 5);
        assert!(slots.is_empty());
    }
}
