use std::fmt::Write;

use chrono::NaiveDate;

use crate::activity::{busiest_day, totals};
use crate::models::{DashboardStats, HeatmapDay, UserKey};

pub fn build_report(
    user: &UserKey,
    today: NaiveDate,
    stats: &DashboardStats,
    heatmap: &[HeatmapDay],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Engagement Report");
    let _ = writeln!(output, "Generated for {} on {}", user, today);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(output, "- Problems solved: {}", stats.problems_solved);
    let _ = writeln!(
        output,
        "- Day streak: {} (longest {})",
        stats.day_streak, stats.longest_streak
    );
    let _ = writeln!(output, "- Hours studied: {:.1}", stats.hours_studied);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Last 7 Days");
    let week: Vec<String> = stats.weekly_activity.iter().map(i64::to_string).collect();
    let _ = writeln!(output, "Activity (oldest first): {}", week.join(" "));

    let _ = writeln!(output);
    let _ = writeln!(output, "## Heatmap ({} days)", heatmap.len());

    let sum = totals(heatmap);
    let active_days = heatmap.iter().filter(|day| !day.counts.is_zero()).count();
    let _ = writeln!(output, "- Active days: {}", active_days);
    let _ = writeln!(output, "- Problems solved: {}", sum.problems_solved);
    let _ = writeln!(output, "- Videos watched: {}", sum.videos_watched);
    let _ = writeln!(output, "- Messages sent: {}", sum.messages_sent);
    let _ = writeln!(output, "- Study minutes: {}", sum.study_minutes);

    match busiest_day(heatmap) {
        Some(day) => {
            let _ = writeln!(
                output,
                "- Best day: {} ({} problems, {} videos)",
                day.date, day.counts.problems_solved, day.counts.videos_watched
            );
        }
        None => {
            let _ = writeln!(output, "No learning activity recorded for this window.");
        }
    }

    output
}
