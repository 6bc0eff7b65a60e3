use std::collections::HashMap;

use chrono::{Days, NaiveDate};

use crate::error::LedgerError;
use crate::models::{ActivityCounts, DailyActivity, HeatmapDay};

pub const MAX_HEATMAP_DAYS: u32 = 366;
pub const WEEK_DAYS: u32 = 7;

/// Upsert-add semantics for one counter: a fresh row starts at
/// `max(delta, 0)`, an existing one at `max(old + delta, 0)`.
pub fn clamped_add(old: Option<i64>, delta: i64) -> i64 {
    (old.unwrap_or(0) + delta).max(0)
}

/// First day of a window of `days` days ending at `end` (inclusive),
/// saturating at the first representable date.
pub(crate) fn window_start(end: NaiveDate, days: u32) -> NaiveDate {
    end.checked_sub_days(Days::new(u64::from(days.max(1)) - 1))
        .unwrap_or(NaiveDate::MIN)
}

pub fn validate_days(days: u32) -> Result<(), LedgerError> {
    if days == 0 || days > MAX_HEATMAP_DAYS {
        return Err(LedgerError::validation(format!(
            "heatmap length must be between 1 and {MAX_HEATMAP_DAYS} days, got {days}"
        )));
    }
    Ok(())
}

/// Exactly `days` entries (capped at `MAX_HEATMAP_DAYS`), oldest first,
/// ending at `end`. Days with no row come back as all-zero counters; rows
/// outside the window are ignored.
pub fn fill_heatmap(rows: &[DailyActivity], end: NaiveDate, days: u32) -> Vec<HeatmapDay> {
    let days = days.min(MAX_HEATMAP_DAYS);
    let by_date: HashMap<NaiveDate, ActivityCounts> =
        rows.iter().map(|row| (row.date, row.counts)).collect();

    window_start(end, days)
        .iter_days()
        .take(days as usize)
        .map(|date| HeatmapDay {
            date,
            counts: by_date.get(&date).copied().unwrap_or_default(),
        })
        .collect()
}

/// Learning actions on one day, as charted on the dashboard.
pub fn activity_score(counts: &ActivityCounts) -> i64 {
    counts.problems_solved + counts.videos_watched
}

pub fn weekly_activity(rows: &[DailyActivity], today: NaiveDate) -> Vec<i64> {
    fill_heatmap(rows, today, WEEK_DAYS)
        .iter()
        .map(|day| activity_score(&day.counts))
        .collect()
}

pub fn busiest_day(days: &[HeatmapDay]) -> Option<&HeatmapDay> {
    days.iter()
        .filter(|day| activity_score(&day.counts) > 0)
        .max_by(|a, b| {
            activity_score(&a.counts)
                .cmp(&activity_score(&b.counts))
                .then(a.date.cmp(&b.date))
        })
}

pub fn totals(days: &[HeatmapDay]) -> ActivityCounts {
    days.iter().fold(ActivityCounts::default(), |acc, day| ActivityCounts {
        problems_solved: acc.problems_solved + day.counts.problems_solved,
        videos_watched: acc.videos_watched + day.counts.videos_watched,
        messages_sent: acc.messages_sent + day.counts.messages_sent,
        study_minutes: acc.study_minutes + day.counts.study_minutes,
    })
}
