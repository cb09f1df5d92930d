use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;

use crate::plans::AllowedWindow;

/// Owner-local calendar date of `instant`.
pub fn local_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

pub fn local_time(instant: DateTime<Utc>, tz: Tz) -> NaiveTime {
    instant.with_timezone(&tz).time()
}

/// Resolves an owner-local wall-clock time to an instant. Ambiguous times take the
/// earlier instant; times skipped by a DST jump move forward to the first valid one.
pub fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    if let Some(instant) = tz.from_local_datetime(&naive).earliest() {
        return instant.with_timezone(&Utc);
    }
    for minutes in (15..=180).step_by(15) {
        let shifted = naive + Duration::minutes(minutes);
        if let Some(instant) = tz.from_local_datetime(&shifted).earliest() {
            return instant.with_timezone(&Utc);
        }
    }
    Utc.from_utc_datetime(&naive)
}

pub fn start_of_local_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    resolve_local(tz, date.and_time(NaiveTime::default()))
}

pub fn next_local_midnight(instant: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let tomorrow = local_date(instant, tz) + Duration::days(1);
    start_of_local_day(tomorrow, tz)
}

/// `[start, end)` of the owner-local day containing `instant`.
pub fn daily_window(instant: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let date = local_date(instant, tz);
    (
        start_of_local_day(date, tz),
        start_of_local_day(date + Duration::days(1), tz),
    )
}

/// `[start, end)` of the owner-local month containing `instant`.
pub fn monthly_window(instant: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    monthly_window_for(local_date(instant, tz), tz)
}

pub fn monthly_window_for(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let first = first_of_month(date);
    let next = first
        .checked_add_months(Months::new(1))
        .unwrap_or(first + Duration::days(31));
    (start_of_local_day(first, tz), start_of_local_day(next, tz))
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Moves `candidate` forward to the first instant inside `window` (owner-local).
/// Candidates already inside the window are returned unchanged.
pub fn clamp_into_window(
    candidate: DateTime<Utc>,
    window: Option<&AllowedWindow>,
    tz: Tz,
) -> DateTime<Utc> {
    let Some(window) = window else {
        return candidate;
    };
    let time = local_time(candidate, tz);
    if window.contains(time) {
        return candidate;
    }

    let date = local_date(candidate, tz);
    // Outside a normal window: either before today's opening or after closing.
    // Outside a wrapping window: always before today's opening.
    let opening_date = if !window.wraps_midnight() && time >= window.to {
        date + Duration::days(1)
    } else {
        date
    };
    resolve_local(tz, opening_date.and_time(window.from))
}

/// Opening of the allowed window on the owner-local day after `instant`, or that
/// day's midnight when the plan has no window.
pub fn next_day_window_start(
    instant: DateTime<Utc>,
    window: Option<&AllowedWindow>,
    tz: Tz,
) -> DateTime<Utc> {
    let tomorrow = local_date(instant, tz) + Duration::days(1);
    match window {
        Some(window) => resolve_local(tz, tomorrow.and_time(window.from)),
        None => start_of_local_day(tomorrow, tz),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn daily_windows_tile_without_gap() {
        let (start, end) = daily_window(utc(2024, 3, 10, 15, 0), Tz::UTC);
        assert_eq!(start, utc(2024, 3, 10, 0, 0));
        assert_eq!(end, utc(2024, 3, 11, 0, 0));
        let (next_start, _) = daily_window(end, Tz::UTC);
        assert_eq!(next_start, end);
    }

    #[test]
    fn monthly_window_handles_year_end() {
        let (start, end) = monthly_window(utc(2024, 12, 31, 23, 0), Tz::UTC);
        assert_eq!(start, utc(2024, 12, 1, 0, 0));
        assert_eq!(end, utc(2025, 1, 1, 0, 0));
    }

    #[test]
    fn daily_window_follows_owner_zone() {
        // 02:00 UTC on the 10th is still the 9th in New York.
        let (start, end) = daily_window(utc(2024, 1, 10, 2, 0), Tz::America__New_York);
        assert_eq!(start, utc(2024, 1, 9, 5, 0));
        assert_eq!(end, utc(2024, 1, 10, 5, 0));
    }

    #[test]
    fn dst_day_is_shorter() {
        let (start, end) = daily_window(utc(2024, 3, 10, 12, 0), Tz::America__New_York);
        assert_eq!(end - start, Duration::hours(23));
    }

    #[test]
    fn clamp_moves_early_candidate_to_opening() {
        let window = AllowedWindow::new(t(9, 0), t(18, 0));
        let clamped = clamp_into_window(utc(2024, 3, 10, 7, 30), Some(&window), Tz::UTC);
        assert_eq!(clamped, utc(2024, 3, 10, 9, 0));
    }

    #[test]
    fn clamp_moves_late_candidate_to_next_opening() {
        let window = AllowedWindow::new(t(9, 0), t(18, 0));
        let clamped = clamp_into_window(utc(2024, 3, 10, 18, 0), Some(&window), Tz::UTC);
        assert_eq!(clamped, utc(2024, 3, 11, 9, 0));
    }

    #[test]
    fn clamp_into_wrapping_window() {
        let window = AllowedWindow::new(t(22, 0), t(6, 0));
        let inside = utc(2024, 3, 10, 3, 0);
        assert_eq!(clamp_into_window(inside, Some(&window), Tz::UTC), inside);
        let clamped = clamp_into_window(utc(2024, 3, 10, 12, 0), Some(&window), Tz::UTC);
        assert_eq!(clamped, utc(2024, 3, 10, 22, 0));
    }

    #[test]
    fn next_day_start_without_window_is_midnight() {
        let next = next_day_window_start(utc(2024, 3, 10, 12, 0), None, Tz::UTC);
        assert_eq!(next, utc(2024, 3, 11, 0, 0));
    }
}
