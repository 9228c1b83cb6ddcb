//! Next-occurrence computation for recurring posts.
//!
//! All wall-clock fields of a schedule (`time`, `days_of_week`,
//! `day_of_month`) are interpreted in the configured time zone; the result
//! is converted back to UTC.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use threadline_database::models::{ScheduleConfig, SchedulePattern};

/// The next firing strictly after `after`, or `None` when the schedule is
/// exhausted (or not recurring).
pub fn next_occurrence(config: &ScheduleConfig, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let local_after = after.with_timezone(&tz);
    let time = config
        .time
        .unwrap_or_else(|| config.scheduled_at.with_timezone(&tz).time());

    match config.pattern {
        SchedulePattern::Once => None,
        SchedulePattern::Weekly => {
            let days = config.days_of_week.as_ref()?;
            if days.is_empty() {
                return None;
            }
            // Two weeks is enough to hit any weekday set.
            for offset in 0..=14u64 {
                let date = local_after.date_naive().checked_add_days(Days::new(offset))?;
                let weekday = date.weekday().num_days_from_sunday() as u8;
                if !days.contains(&weekday) {
                    continue;
                }
                if let Some(candidate) = resolve_local(date, time, tz) {
                    if candidate > after {
                        return Some(candidate);
                    }
                }
            }
            None
        }
        SchedulePattern::Monthly => {
            let day = config.day_of_month?;
            let base = local_after.date_naive();
            for add in 0..=24u32 {
                let (year, month) = add_months(base.year(), base.month(), add);
                // Months without the requested day are skipped.
                let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                    continue;
                };
                if let Some(candidate) = resolve_local(date, time, tz) {
                    if candidate > after {
                        return Some(candidate);
                    }
                }
            }
            None
        }
        SchedulePattern::DateRange => {
            for offset in 0..=1u64 {
                let date = local_after.date_naive().checked_add_days(Days::new(offset))?;
                if let Some(end) = config.end_date {
                    if date > end {
                        return None;
                    }
                }
                if let Some(candidate) = resolve_local(date, time, tz) {
                    if candidate > after {
                        return Some(candidate);
                    }
                }
            }
            None
        }
    }
}

/// Resolve a local wall-clock instant to UTC, tolerating DST gaps
fn resolve_local(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
    let local = date.and_time(time);
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&local).latest())
        .map(|dt| dt.with_timezone(&Utc))
}

fn add_months(year: i32, month: u32, add: u32) -> (i32, u32) {
    let zero_based = month - 1 + add;
    (year + (zero_based / 12) as i32, zero_based % 12 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Ho_Chi_Minh;

    fn at(tz: Tz, y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        tz.with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn weekly(days: Vec<u8>, hh: u32) -> ScheduleConfig {
        ScheduleConfig {
            pattern: SchedulePattern::Weekly,
            scheduled_at: Utc::now(),
            time: NaiveTime::from_hms_opt(hh, 0, 0),
            days_of_week: Some(days),
            day_of_month: None,
            end_date: None,
        }
    }

    #[test]
    fn test_weekly_monday_to_thursday() {
        // 2025-06-02 is a Monday; days {1, 4} are Monday and Thursday.
        let config = weekly(vec![1, 4], 9);
        let after = at(Ho_Chi_Minh, 2025, 6, 2, 9, 0);
        let next = next_occurrence(&config, after, Ho_Chi_Minh).unwrap();
        assert_eq!(next, at(Ho_Chi_Minh, 2025, 6, 5, 9, 0));
    }

    #[test]
    fn test_weekly_is_strictly_greater() {
        let config = weekly(vec![1], 9);
        let after = at(Ho_Chi_Minh, 2025, 6, 2, 9, 0);
        let next = next_occurrence(&config, after, Ho_Chi_Minh).unwrap();
        assert!(next > after);
        assert_eq!(next, at(Ho_Chi_Minh, 2025, 6, 9, 9, 0));
    }

    #[test]
    fn test_weekly_same_day_later_time() {
        let config = weekly(vec![1], 15);
        let after = at(Ho_Chi_Minh, 2025, 6, 2, 9, 0);
        let next = next_occurrence(&config, after, Ho_Chi_Minh).unwrap();
        assert_eq!(next, at(Ho_Chi_Minh, 2025, 6, 2, 15, 0));
    }

    #[test]
    fn test_weekly_empty_days_exhausts() {
        let config = weekly(vec![], 9);
        assert!(next_occurrence(&config, Utc::now(), Ho_Chi_Minh).is_none());
    }

    #[test]
    fn test_monthly_skips_short_months() {
        let config = ScheduleConfig {
            pattern: SchedulePattern::Monthly,
            scheduled_at: Utc::now(),
            time: NaiveTime::from_hms_opt(9, 0, 0),
            days_of_week: None,
            day_of_month: Some(31),
            end_date: None,
        };
        let after = at(Ho_Chi_Minh, 2025, 1, 31, 9, 0);
        let next = next_occurrence(&config, after, Ho_Chi_Minh).unwrap();
        // February has no 31st, so the next firing is March 31st.
        assert_eq!(next, at(Ho_Chi_Minh, 2025, 3, 31, 9, 0));
    }

    #[test]
    fn test_date_range_daily_until_end() {
        let config = ScheduleConfig {
            pattern: SchedulePattern::DateRange,
            scheduled_at: Utc::now(),
            time: NaiveTime::from_hms_opt(8, 30, 0),
            days_of_week: None,
            day_of_month: None,
            end_date: NaiveDate::from_ymd_opt(2025, 6, 3),
        };
        let after = at(Ho_Chi_Minh, 2025, 6, 2, 8, 30);
        let next = next_occurrence(&config, after, Ho_Chi_Minh).unwrap();
        assert_eq!(next, at(Ho_Chi_Minh, 2025, 6, 3, 8, 30));

        // Past the end date the schedule is exhausted.
        let after = at(Ho_Chi_Minh, 2025, 6, 3, 8, 30);
        assert!(next_occurrence(&config, after, Ho_Chi_Minh).is_none());
    }

    #[test]
    fn test_once_never_recurs() {
        let config = ScheduleConfig::once(Utc::now());
        assert!(next_occurrence(&config, Utc::now(), Ho_Chi_Minh).is_none());
    }

    #[test]
    fn test_add_months_wraps_year() {
        assert_eq!(add_months(2025, 11, 1), (2025, 12));
        assert_eq!(add_months(2025, 11, 2), (2026, 1));
        assert_eq!(add_months(2025, 1, 24), (2027, 1));
    }
}
