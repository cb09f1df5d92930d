use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::plans::SyncPlan;
use crate::windows::{clamp_into_window, next_day_window_start};

use super::models::Schedule;

/// Next eligible run plus the reset marker that goes with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NextRun {
    pub at: DateTime<Utc>,
    pub runs_reset_at: Option<DateTime<Utc>>,
}

/// key: schedule-cadence -> interval, allowed window, daily cap rollover
///
/// `max(now, last_run_at + interval)` clamped forward into the plan's allowed window.
/// Once the daily cap is used up the next run moves to the opening of the following
/// day's window and `runs_today` is scheduled to reset at that same instant.
pub fn calculate_next_run_time(schedule: &Schedule, plan: &SyncPlan, now: DateTime<Utc>) -> NextRun {
    let tz = plan.timezone;
    let window = plan.allowed_window.as_ref();

    if schedule.effective_runs_today(now) >= schedule.max_runs_per_day {
        let boundary = next_day_window_start(now, window, tz);
        return NextRun {
            at: boundary,
            runs_reset_at: Some(boundary),
        };
    }

    let candidate = match schedule.last_run_at {
        Some(last_run_at) => now.max(last_run_at + schedule.interval()),
        None => now,
    };

    NextRun {
        at: clamp_into_window(candidate, window, tz),
        runs_reset_at: schedule.runs_reset_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::AllowedWindow;
    use crate::schedules::models::SyncType;
    use chrono::{Duration, NaiveTime, TimeZone};
    use chrono_tz::Tz;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, d, h, m, 0).unwrap()
    }

    fn business_hours() -> SyncPlan {
        let mut plan = SyncPlan::unlimited("pro");
        plan.allowed_window = Some(AllowedWindow::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        ));
        plan
    }

    #[test]
    fn interval_after_last_run_inside_window() {
        let mut schedule = Schedule::new(1, vec![3], SyncType::All, 60, 10, at(3, 8, 0));
        schedule.last_run_at = Some(at(3, 10, 0));
        schedule.runs_today = 1;
        let next = calculate_next_run_time(&schedule, &business_hours(), at(3, 10, 0));
        assert_eq!(next.at, at(3, 11, 0));
    }

    #[test]
    fn overdue_schedule_runs_now() {
        let mut schedule = Schedule::new(1, vec![3], SyncType::All, 60, 10, at(3, 8, 0));
        schedule.last_run_at = Some(at(3, 10, 0));
        let next = calculate_next_run_time(&schedule, &business_hours(), at(3, 14, 30));
        assert_eq!(next.at, at(3, 14, 30));
    }

    #[test]
    fn candidate_after_closing_moves_to_next_opening() {
        let mut schedule = Schedule::new(1, vec![3], SyncType::All, 60, 10, at(3, 8, 0));
        schedule.last_run_at = Some(at(3, 17, 30));
        let next = calculate_next_run_time(&schedule, &business_hours(), at(3, 17, 30));
        assert_eq!(next.at, at(4, 9, 0));
    }

    #[test]
    fn daily_cap_rolls_over_to_next_window() {
        let mut schedule = Schedule::new(1, vec![3], SyncType::All, 60, 4, at(3, 8, 0));
        schedule.last_run_at = Some(at(3, 12, 0));
        schedule.runs_today = 4;
        let next = calculate_next_run_time(&schedule, &business_hours(), at(3, 12, 0));
        assert_eq!(next.at, at(4, 9, 0));
        assert_eq!(next.runs_reset_at, Some(at(4, 9, 0)));
    }

    #[test]
    fn window_evaluated_in_owner_zone() {
        let mut plan = business_hours();
        plan.timezone = Tz::Europe__Berlin;
        let mut schedule = Schedule::new(1, vec![3], SyncType::All, 30, 10, at(3, 0, 0));
        // 16:45 UTC is 18:45 in Berlin (CEST): past closing.
        schedule.last_run_at = Some(at(3, 16, 15));
        let next = calculate_next_run_time(&schedule, &plan, at(3, 16, 15));
        assert_eq!(next.at, at(4, 7, 0));
    }

    #[test]
    fn next_run_is_strictly_after_recorded_run() {
        let schedule = Schedule::new(1, vec![3], SyncType::All, 15, 3, at(3, 9, 0));
        let mut now = at(3, 9, 0);
        let mut current = schedule;
        for _ in 0..5 {
            current = current.with_run_recorded(now, Tz::UTC);
            let next = calculate_next_run_time(&current, &business_hours(), now);
            assert!(next.at > now);
            assert!(current.runs_today <= current.max_runs_per_day);
            now = next.at.max(now + Duration::minutes(1));
        }
    }
}
