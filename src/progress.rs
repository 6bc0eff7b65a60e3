use chrono::NaiveDate;

use crate::models::{ProblemIntent, UserProgress};
use crate::streak::{StreakState, StreakTransition};

impl UserProgress {
    pub fn streak(&self) -> StreakState {
        StreakState {
            current: self.current_streak,
            longest: self.longest_streak,
            last_activity_date: self.last_activity_date,
        }
    }

    pub fn with_streak(mut self, streak: StreakState) -> Self {
        self.current_streak = streak.current;
        self.longest_streak = streak.longest;
        self.last_activity_date = streak.last_activity_date;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemChange {
    pub solved: bool,
    pub progress: UserProgress,
    /// Change to the day's `problems_solved`.
    pub problems_delta: i64,
    pub streak: Option<StreakTransition>,
}

impl ProblemChange {
    pub fn is_noop(&self) -> bool {
        self.problems_delta == 0
    }
}

/// Derives the new progress row for a solve/unsolve. Unsolving never
/// unwinds the streak: days already counted stay counted.
pub fn problem_change(
    progress: &UserProgress,
    was_solved: bool,
    intent: ProblemIntent,
    today: NaiveDate,
) -> ProblemChange {
    let solved = match intent {
        ProblemIntent::Toggle => !was_solved,
        ProblemIntent::Set(target) => target,
    };

    if solved == was_solved {
        return ProblemChange {
            solved,
            progress: progress.clone(),
            problems_delta: 0,
            streak: None,
        };
    }

    if solved {
        let (streak, transition) = progress.streak().advance(today);
        let mut next = progress.clone().with_streak(streak);
        next.total_problems_solved += 1;
        ProblemChange {
            solved,
            progress: next,
            problems_delta: 1,
            streak: Some(transition),
        }
    } else {
        let mut next = progress.clone();
        next.total_problems_solved = (next.total_problems_solved - 1).max(0);
        ProblemChange {
            solved,
            progress: next,
            problems_delta: -1,
            streak: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoChange {
    pub percentage: u8,
    pub completed: bool,
    pub newly_completed: bool,
}

/// Furthest progress wins; completion is sticky.
pub fn video_change(previous: Option<(u8, bool)>, percentage: u8, completes: bool) -> VideoChange {
    let (prev_pct, prev_done) = previous.unwrap_or((0, false));
    let completed = prev_done || completes;
    VideoChange {
        percentage: prev_pct.max(percentage),
        completed,
        newly_completed: completed && !prev_done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserKey;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn progress(total: i64, current: i64, last: Option<NaiveDate>) -> UserProgress {
        UserProgress {
            total_problems_solved: total,
            current_streak: current,
            longest_streak: current,
            last_activity_date: last,
            ..UserProgress::empty(UserKey::parse("avery@example.com").unwrap())
        }
    }

    #[test]
    fn toggle_on_then_off_keeps_the_streak() {
        let start = progress(4, 5, Some(day(10)));

        let on = problem_change(&start, false, ProblemIntent::Toggle, day(11));
        assert!(on.solved);
        assert_eq!(on.problems_delta, 1);
        assert_eq!(on.progress.total_problems_solved, 5);
        assert_eq!(on.progress.current_streak, 6);
        assert_eq!(on.streak, Some(StreakTransition::Extended));

        let off = problem_change(&on.progress, true, ProblemIntent::Toggle, day(11));
        assert!(!off.solved);
        assert_eq!(off.problems_delta, -1);
        assert_eq!(off.progress.total_problems_solved, 4);
        assert_eq!(off.progress.current_streak, 6);
        assert_eq!(off.progress.last_activity_date, Some(day(11)));
    }

    #[test]
    fn explicit_set_is_idempotent() {
        let start = progress(1, 1, Some(day(10)));
        let change = problem_change(&start, true, ProblemIntent::Set(true), day(11));
        assert!(change.is_noop());
        assert_eq!(change.progress, start);
    }

    #[test]
    fn unsolve_clamps_total_at_zero() {
        let start = progress(0, 0, None);
        let change = problem_change(&start, true, ProblemIntent::Set(false), day(3));
        assert_eq!(change.progress.total_problems_solved, 0);
    }

    #[test]
    fn video_completion_is_sticky_and_counted_once() {
        let first = video_change(None, 40, false);
        assert_eq!(first.percentage, 40);
        assert!(!first.completed);

        let done = video_change(Some((40, false)), 95, true);
        assert!(done.newly_completed);

        let again = video_change(Some((95, true)), 10, false);
        assert_eq!(again.percentage, 95);
        assert!(again.completed);
        assert!(!again.newly_completed);
    }
}
