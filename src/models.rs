use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;

pub type PostId = i64;

const MAX_USER_KEY_LEN: usize = 254;

/// Opaque, stable identity every ledger row is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserKey(String);

impl UserKey {
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let key = raw.trim();
        if key.is_empty() {
            return Err(LedgerError::validation("user key is empty"));
        }
        if key.len() > MAX_USER_KEY_LEN {
            return Err(LedgerError::validation(format!(
                "user key longer than {MAX_USER_KEY_LEN} bytes"
            )));
        }
        if key.chars().any(char::is_whitespace) {
            return Err(LedgerError::validation("user key contains whitespace"));
        }
        Ok(UserKey(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        UserKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Up,
    Down,
    #[default]
    None,
}

impl Vote {
    /// `none` is persisted as SQL `NULL`.
    pub fn as_stored(self) -> Option<&'static str> {
        match self {
            Vote::Up => Some("up"),
            Vote::Down => Some("down"),
            Vote::None => None,
        }
    }

    pub fn from_stored(value: Option<&str>) -> Result<Self, LedgerError> {
        match value {
            None => Ok(Vote::None),
            Some(raw) => raw.parse(),
        }
    }
}

impl FromStr for Vote {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Vote::Up),
            "down" => Ok(Vote::Down),
            "none" | "" => Ok(Vote::None),
            other => Err(LedgerError::validation(format!("unknown vote {other:?}"))),
        }
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Vote::Up => "up",
            Vote::Down => "down",
            Vote::None => "none",
        })
    }
}

/// Partial update of a `post_interactions` row. `None` leaves the stored
/// field untouched; `Some` overwrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InteractionPatch {
    pub vote: Option<Vote>,
    pub is_saved: Option<bool>,
}

impl InteractionPatch {
    pub fn vote(vote: Vote) -> Self {
        Self {
            vote: Some(vote),
            is_saved: None,
        }
    }

    pub fn saved(is_saved: bool) -> Self {
        Self {
            vote: None,
            is_saved: Some(is_saved),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vote.is_none() && self.is_saved.is_none()
    }

    /// Resolves the patch against the stored row.
    pub fn resolve(&self, current_vote: Vote, current_saved: bool) -> (Vote, bool) {
        (
            self.vote.unwrap_or(current_vote),
            self.is_saved.unwrap_or(current_saved),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCounter {
    ProblemsSolved,
    VideosWatched,
    MessagesSent,
    StudyMinutes,
}

impl ActivityCounter {
    pub const ALL: [ActivityCounter; 4] = [
        ActivityCounter::ProblemsSolved,
        ActivityCounter::VideosWatched,
        ActivityCounter::MessagesSent,
        ActivityCounter::StudyMinutes,
    ];

    pub fn column(self) -> &'static str {
        match self {
            ActivityCounter::ProblemsSolved => "problems_solved",
            ActivityCounter::VideosWatched => "videos_watched",
            ActivityCounter::MessagesSent => "messages_sent",
            ActivityCounter::StudyMinutes => "study_minutes",
        }
    }
}

impl FromStr for ActivityCounter {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivityCounter::ALL
            .into_iter()
            .find(|counter| counter.column() == s)
            .ok_or_else(|| LedgerError::validation(format!("unknown counter {s:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub problems_solved: i64,
    pub videos_watched: i64,
    pub messages_sent: i64,
    pub study_minutes: i64,
}

impl ActivityCounts {
    pub fn get(&self, counter: ActivityCounter) -> i64 {
        match counter {
            ActivityCounter::ProblemsSolved => self.problems_solved,
            ActivityCounter::VideosWatched => self.videos_watched,
            ActivityCounter::MessagesSent => self.messages_sent,
            ActivityCounter::StudyMinutes => self.study_minutes,
        }
    }

    pub fn get_mut(&mut self, counter: ActivityCounter) -> &mut i64 {
        match counter {
            ActivityCounter::ProblemsSolved => &mut self.problems_solved,
            ActivityCounter::VideosWatched => &mut self.videos_watched,
            ActivityCounter::MessagesSent => &mut self.messages_sent,
            ActivityCounter::StudyMinutes => &mut self.study_minutes,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == ActivityCounts::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyActivity {
    pub user: UserKey,
    pub date: NaiveDate,
    pub counts: ActivityCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProgress {
    pub user: UserKey,
    pub total_problems_solved: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_activity_date: Option<NaiveDate>,
    pub total_study_minutes: i64,
    /// Bumped on every write to the row.
    pub revision: i64,
}

impl UserProgress {
    pub fn empty(user: UserKey) -> Self {
        Self {
            user,
            total_problems_solved: 0,
            current_streak: 0,
            longest_streak: 0,
            last_activity_date: None,
            total_study_minutes: 0,
            revision: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PostTally {
    pub upvotes: i64,
    pub downvotes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostInteractionState {
    pub post_id: PostId,
    pub upvotes: i64,
    pub downvotes: i64,
    pub vote: Vote,
    pub is_saved: bool,
    /// Write counter of the `(user, post)` row; orders responses for it.
    pub revision: i64,
}

impl PostInteractionState {
    pub fn tally(&self) -> PostTally {
        PostTally {
            upvotes: self.upvotes,
            downvotes: self.downvotes,
        }
    }
}

/// What to do with a problem's solved flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemIntent {
    Toggle,
    Set(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemOutcome {
    pub solved: bool,
    pub problem_id: String,
    pub total_problems_solved: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    /// Write counter of the user's progress row.
    pub revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoOutcome {
    pub video_id: String,
    pub percentage: u8,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub problems_solved: i64,
    pub day_streak: i64,
    pub longest_streak: i64,
    pub hours_studied: f64,
    pub weekly_activity: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeatmapDay {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub counts: ActivityCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Vote { post_id: PostId, vote: Vote },
    Save { post_id: PostId, saved: bool },
    ToggleProblem { problem_id: String, topic_id: String },
    SetProblem { problem_id: String, topic_id: String, solved: bool },
    VideoProgress { video_id: String, topic_id: String, percentage: u8 },
    MessageSent,
    StudyMinutes { minutes: i64 },
}

/// "User X performed action A on target T at day D."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub id: Uuid,
    pub user: UserKey,
    pub action: Action,
    pub occurred_on: NaiveDate,
}

impl ActionEvent {
    pub fn new(user: UserKey, action: Action, occurred_on: NaiveDate) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            action,
            occurred_on,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActionOutcome {
    Post(PostInteractionState),
    Problem(ProblemOutcome),
    Video(VideoOutcome),
    Activity(ActivityCounts),
    Progress(UserProgress),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_key_rejects_malformed_input() {
        assert!(UserKey::parse("").is_err());
        assert!(UserKey::parse("   ").is_err());
        assert!(UserKey::parse("a b@example.com").is_err());
        assert!(UserKey::parse(&"x".repeat(255)).is_err());
        assert_eq!(
            UserKey::parse(" avery@example.com ").unwrap().as_str(),
            "avery@example.com"
        );
    }

    #[test]
    fn vote_storage_mapping() {
        assert_eq!(Vote::None.as_stored(), None);
        assert_eq!(Vote::from_stored(None).unwrap(), Vote::None);
        assert_eq!(Vote::from_stored(Some("up")).unwrap(), Vote::Up);
        assert!(Vote::from_stored(Some("sideways")).is_err());
        assert_eq!("DOWN".parse::<Vote>().unwrap(), Vote::Down);
    }

    #[test]
    fn patch_distinguishes_omitted_from_false() {
        let patch = InteractionPatch::vote(Vote::Up);
        assert_eq!(patch.resolve(Vote::Down, true), (Vote::Up, true));

        let patch = InteractionPatch::saved(false);
        assert_eq!(patch.resolve(Vote::Down, true), (Vote::Down, false));

        assert!(InteractionPatch::default().is_empty());
    }

    #[test]
    fn counter_names_round_trip_through_columns() {
        for counter in ActivityCounter::ALL {
            assert_eq!(counter.column().parse::<ActivityCounter>().unwrap(), counter);
        }
        assert!("likes".parse::<ActivityCounter>().is_err());
    }

    #[test]
    fn action_event_deserializes_tagged_action() {
        let raw = r#"{
            "id": "3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2",
            "user": "avery@example.com",
            "action": {"kind": "vote", "post_id": 7, "vote": "down"},
            "occurred_on": "2024-01-10"
        }"#;
        let event: ActionEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event.action,
            Action::Vote {
                post_id: 7,
                vote: Vote::Down
            }
        );
        assert_eq!(event.occurred_on, NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());

        let bad = raw.replace("avery@example.com", "");
        assert!(serde_json::from_str::<ActionEvent>(&bad).is_err());
    }
}
