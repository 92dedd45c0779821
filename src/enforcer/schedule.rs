use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Weekday};

use crate::config::ScheduleConfig;

/// Pick the window string that applies on the given weekday
pub fn window_for(schedule: &ScheduleConfig, weekday: Weekday) -> &str {
    if is_weekend(weekday) {
        &schedule.weekend
    } else {
        &schedule.weekday
    }
}

fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

/// Check whether `now` falls inside the applicable allowed-hours window
///
/// Both window bounds are inclusive. A window string that fails to parse
/// allows access: a broken schedule must never lock everyone out.
pub fn is_within_schedule(schedule: &ScheduleConfig, now: DateTime<FixedOffset>) -> bool {
    let window = window_for(schedule, now.weekday());

    match parse_window(window) {
        Some((start, end)) => {
            let current = now.time();
            start <= current && current <= end
        }
        None => {
            tracing::warn!("Invalid schedule format '{}', allowing access", window);
            true
        }
    }
}

/// Parse a `"HH:MM-HH:MM"` window string
fn parse_window(window: &str) -> Option<(NaiveTime, NaiveTime)> {
    let (start_str, end_str) = window.split_once('-')?;
    let start = NaiveTime::parse_from_str(start_str.trim(), "%H:%M").ok()?;
    let end = NaiveTime::parse_from_str(end_str.trim(), "%H:%M").ok()?;
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule(weekday: &str, weekend: &str) -> ScheduleConfig {
        ScheduleConfig {
            weekday: weekday.to_string(),
            weekend: weekend.to_string(),
        }
    }

    /// Build a local timestamp; 2026-08-03 is a Monday, 2026-08-08 a Saturday.
    fn at(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 8, day, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_is_weekend() {
        assert!(!is_weekend(Weekday::Mon));
        assert!(!is_weekend(Weekday::Fri));
        assert!(is_weekend(Weekday::Sat));
        assert!(is_weekend(Weekday::Sun));
    }

    #[test]
    fn weekday_window_bounds_are_inclusive() {
        let sched = schedule("09:00-17:00", "10:00-20:00");

        assert!(!is_within_schedule(&sched, at(3, 8, 59)));
        assert!(is_within_schedule(&sched, at(3, 9, 0)));
        assert!(is_within_schedule(&sched, at(3, 12, 30)));
        assert!(is_within_schedule(&sched, at(3, 17, 0)));
        assert!(!is_within_schedule(&sched, at(3, 17, 1)));
    }

    #[test]
    fn saturday_uses_weekend_window() {
        let sched = schedule("15:00-20:00", "09:00-21:00");

        // 10:00 Saturday: inside weekend hours, outside weekday hours
        assert!(is_within_schedule(&sched, at(8, 10, 0)));
        // 22:00 Saturday: outside both
        assert!(!is_within_schedule(&sched, at(8, 22, 0)));
    }

    #[test]
    fn malformed_window_fails_open() {
        assert!(is_within_schedule(&schedule("invalid", "09:00-21:00"), at(3, 3, 0)));
        assert!(is_within_schedule(&schedule("9-17", "09:00-21:00"), at(3, 3, 0)));
        assert!(is_within_schedule(&schedule("", "09:00-21:00"), at(3, 3, 0)));
    }

    #[test]
    fn window_with_spaces_parses() {
        let sched = schedule("09:00 - 17:00", "10:00-20:00");
        assert!(is_within_schedule(&sched, at(3, 12, 0)));
        assert!(!is_within_schedule(&sched, at(3, 18, 0)));
    }

    #[test]
    fn full_day_window_always_allows() {
        let sched = schedule("00:00-23:59", "00:00-23:59");
        assert!(is_within_schedule(&sched, at(3, 0, 0)));
        assert!(is_within_schedule(&sched, at(3, 23, 59)));
    }
}
