use chrono::NaiveDate;
use serde::Serialize;

/// Consecutive-day counter for streak-eligible actions. Days are canonical
/// UTC calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StreakState {
    pub current: i64,
    pub longest: i64,
    pub last_activity_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakTransition {
    Started,
    Extended,
    Held,
    Reset,
    /// Event dated before the last counted day.
    Stale,
}

impl StreakState {
    pub fn transition(&self, today: NaiveDate) -> StreakTransition {
        match self.last_activity_date {
            None => StreakTransition::Started,
            Some(last) if last == today => StreakTransition::Held,
            Some(last) if last > today => StreakTransition::Stale,
            Some(last) if last.succ_opt() == Some(today) => StreakTransition::Extended,
            Some(_) => StreakTransition::Reset,
        }
    }

    pub fn advance(&self, today: NaiveDate) -> (StreakState, StreakTransition) {
        let transition = self.transition(today);
        let current = match transition {
            StreakTransition::Stale => return (*self, transition),
            StreakTransition::Extended => self.current + 1,
            StreakTransition::Held => self.current,
            StreakTransition::Started | StreakTransition::Reset => 1,
        };
        let next = StreakState {
            current,
            longest: self.longest.max(current),
            last_activity_date: Some(today),
        };
        (next, transition)
    }

    /// Streak as it should read on `today`: a streak whose last day is older
    /// than yesterday is already broken even though the stored value is only
    /// reset by the next action.
    pub fn effective_on(&self, today: NaiveDate) -> i64 {
        match self.last_activity_date {
            Some(last) if last == today || last.succ_opt() == Some(today) => self.current,
            _ => 0,
        }
    }
}
