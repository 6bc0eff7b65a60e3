use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{Duration as Days, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::activity::{fill_heatmap, validate_days, weekly_activity, window_start, WEEK_DAYS};
use crate::config::Config;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    Action, ActionEvent, ActionOutcome, ActivityCounter, DailyActivity, DashboardStats,
    HeatmapDay, InteractionPatch, PostId, PostInteractionState, PostTally, ProblemIntent,
    ProblemOutcome, UserKey, UserProgress, VideoOutcome, Vote,
};
use crate::store::LedgerStore;

const MAX_TARGET_ID_LEN: usize = 128;
const MAX_MINUTES_PER_ENTRY: i64 = 24 * 60;

/// Source of the canonical (UTC) calendar day.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

#[derive(Debug)]
pub struct FixedClock(Mutex<NaiveDate>);

impl FixedClock {
    pub fn new(today: NaiveDate) -> Self {
        Self(Mutex::new(today))
    }

    pub fn set(&self, today: NaiveDate) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = today;
    }

    pub fn advance_days(&self, days: i64) {
        let mut today = self.0.lock().unwrap_or_else(|p| p.into_inner());
        *today += Days::days(days);
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerSettings {
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub video_completion_percent: u8,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(25),
            video_completion_percent: 90,
        }
    }
}

impl From<&Config> for LedgerSettings {
    fn from(config: &Config) -> Self {
        Self {
            retry_attempts: config.retry_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            video_completion_percent: config.video_completion_percent,
        }
    }
}

/// Turns action events into derived ledger state.
pub struct Ledger<S, C = SystemClock> {
    store: S,
    clock: C,
    settings: LedgerSettings,
}

impl<S: LedgerStore> Ledger<S, SystemClock> {
    pub fn new(store: S, settings: LedgerSettings) -> Self {
        Self::with_clock(store, SystemClock, settings)
    }
}

impl<S: LedgerStore, C: Clock> Ledger<S, C> {
    pub fn with_clock(store: S, clock: C, settings: LedgerSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub async fn submit_vote(
        &self,
        user: &UserKey,
        post_id: PostId,
        vote: Vote,
    ) -> LedgerResult<PostInteractionState> {
        self.interact(user, post_id, InteractionPatch::vote(vote)).await
    }

    pub async fn set_saved(
        &self,
        user: &UserKey,
        post_id: PostId,
        saved: bool,
    ) -> LedgerResult<PostInteractionState> {
        self.interact(user, post_id, InteractionPatch::saved(saved)).await
    }

    pub async fn toggle_problem(
        &self,
        user: &UserKey,
        problem_id: &str,
        topic_id: &str,
    ) -> LedgerResult<ProblemOutcome> {
        self.problem(user, problem_id, topic_id, ProblemIntent::Toggle, self.today())
            .await
    }

    /// Idempotent form of `toggle_problem`: retries cannot flip the flag back.
    pub async fn set_problem_solved(
        &self,
        user: &UserKey,
        problem_id: &str,
        topic_id: &str,
        solved: bool,
    ) -> LedgerResult<ProblemOutcome> {
        self.problem(user, problem_id, topic_id, ProblemIntent::Set(solved), self.today())
            .await
    }

    pub async fn mark_video_progress(
        &self,
        user: &UserKey,
        video_id: &str,
        topic_id: &str,
        percentage: u8,
    ) -> LedgerResult<VideoOutcome> {
        self.video(user, video_id, topic_id, percentage, self.today())
            .await
    }

    pub async fn record_message_sent(&self, user: &UserKey) -> LedgerResult<DailyActivity> {
        self.bump(user, self.today(), ActivityCounter::MessagesSent, 1)
            .await
    }

    pub async fn log_study_minutes(
        &self,
        user: &UserKey,
        minutes: i64,
    ) -> LedgerResult<UserProgress> {
        self.study(user, minutes, self.today()).await
    }

    /// Upsert-add on one daily counter; the stored value never drops below 0.
    pub async fn bump(
        &self,
        user: &UserKey,
        date: NaiveDate,
        counter: ActivityCounter,
        delta: i64,
    ) -> LedgerResult<DailyActivity> {
        self.with_retry("bump", move || {
            self.store.bump_activity(user, date, counter, delta)
        })
        .await
    }

    pub async fn post_tally(&self, post_id: PostId) -> LedgerResult<PostTally> {
        validate_post(post_id)?;
        self.store.post_tally(post_id).await
    }

    pub async fn get_dashboard_stats(&self, user: &UserKey) -> LedgerResult<DashboardStats> {
        let today = self.today();
        let progress = self
            .store
            .user_progress(user)
            .await?
            .unwrap_or_else(|| UserProgress::empty(user.clone()));
        let rows = self
            .store
            .activity_range(user, window_start(today, WEEK_DAYS), today)
            .await?;

        Ok(DashboardStats {
            problems_solved: progress.total_problems_solved,
            day_streak: progress.streak().effective_on(today),
            longest_streak: progress.longest_streak,
            hours_studied: minutes_to_hours(progress.total_study_minutes),
            weekly_activity: weekly_activity(&rows, today),
        })
    }

    /// Exactly `days` entries ending today, oldest first, zero-filled.
    pub async fn get_heatmap(&self, user: &UserKey, days: u32) -> LedgerResult<Vec<HeatmapDay>> {
        validate_days(days)?;
        let today = self.today();
        let rows = self
            .store
            .activity_range(user, window_start(today, days), today)
            .await?;
        Ok(fill_heatmap(&rows, today, days))
    }

    /// Applies an event on the day it carries rather than today.
    pub async fn apply_event(&self, event: &ActionEvent) -> LedgerResult<ActionOutcome> {
        debug!(event_id = %event.id, user = %event.user, action = ?event.action, "applying event");
        let user = &event.user;
        let day = event.occurred_on;

        let outcome = match &event.action {
            Action::Vote { post_id, vote } => ActionOutcome::Post(
                self.interact(user, *post_id, InteractionPatch::vote(*vote))
                    .await?,
            ),
            Action::Save { post_id, saved } => ActionOutcome::Post(
                self.interact(user, *post_id, InteractionPatch::saved(*saved))
                    .await?,
            ),
            Action::ToggleProblem {
                problem_id,
                topic_id,
            } => ActionOutcome::Problem(
                self.problem(user, problem_id, topic_id, ProblemIntent::Toggle, day)
                    .await?,
            ),
            Action::SetProblem {
                problem_id,
                topic_id,
                solved,
            } => ActionOutcome::Problem(
                self.problem(user, problem_id, topic_id, ProblemIntent::Set(*solved), day)
                    .await?,
            ),
            Action::VideoProgress {
                video_id,
                topic_id,
                percentage,
            } => ActionOutcome::Video(
                self.video(user, video_id, topic_id, *percentage, day)
                    .await?,
            ),
            Action::MessageSent => ActionOutcome::Activity(
                self.bump(user, day, ActivityCounter::MessagesSent, 1)
                    .await?
                    .counts,
            ),
            Action::StudyMinutes { minutes } => {
                ActionOutcome::Progress(self.study(user, *minutes, day).await?)
            }
        };

        Ok(outcome)
    }

    pub async fn repair_post_tallies(&self) -> LedgerResult<u64> {
        let repaired = self
            .with_retry("repair", || self.store.repair_post_tallies())
            .await?;
        if repaired > 0 {
            warn!(repaired, "post tallies had drifted from interaction rows");
        } else {
            info!("post tallies consistent with interaction rows");
        }
        Ok(repaired)
    }

    async fn interact(
        &self,
        user: &UserKey,
        post_id: PostId,
        patch: InteractionPatch,
    ) -> LedgerResult<PostInteractionState> {
        validate_post(post_id)?;
        if patch.is_empty() {
            return Err(LedgerError::validation("interaction patch changes nothing"));
        }

        let state = self
            .with_retry("interaction", move || {
                self.store.apply_interaction(user, post_id, patch)
            })
            .await?;
        debug!(%user, post_id, vote = %state.vote, upvotes = state.upvotes, downvotes = state.downvotes, "interaction applied");
        Ok(state)
    }

    async fn problem(
        &self,
        user: &UserKey,
        problem_id: &str,
        topic_id: &str,
        intent: ProblemIntent,
        day: NaiveDate,
    ) -> LedgerResult<ProblemOutcome> {
        let problem_id = validate_target("problem id", problem_id)?;
        let topic_id = validate_target("topic id", topic_id)?;

        let outcome = self
            .with_retry("problem", move || {
                self.store.set_problem(user, problem_id, topic_id, intent, day)
            })
            .await?;
        debug!(%user, problem_id, solved = outcome.solved, streak = outcome.current_streak, "problem applied");
        Ok(outcome)
    }

    async fn video(
        &self,
        user: &UserKey,
        video_id: &str,
        topic_id: &str,
        percentage: u8,
        day: NaiveDate,
    ) -> LedgerResult<VideoOutcome> {
        let video_id = validate_target("video id", video_id)?;
        let topic_id = validate_target("topic id", topic_id)?;
        if percentage > 100 {
            return Err(LedgerError::validation(format!(
                "percentage must be at most 100, got {percentage}"
            )));
        }
        let completes = percentage >= self.settings.video_completion_percent;

        self.with_retry("video", move || {
            self.store
                .record_video_progress(user, video_id, topic_id, percentage, completes, day)
        })
        .await
    }

    async fn study(
        &self,
        user: &UserKey,
        minutes: i64,
        day: NaiveDate,
    ) -> LedgerResult<UserProgress> {
        if minutes <= 0 || minutes > MAX_MINUTES_PER_ENTRY {
            return Err(LedgerError::validation(format!(
                "study minutes must be between 1 and {MAX_MINUTES_PER_ENTRY}, got {minutes}"
            )));
        }
        self.with_retry("study", move || self.store.add_study_minutes(user, minutes, day))
            .await
    }

    /// Retries contention a bounded number of times; anything else, or the
    /// last contention error, goes straight back to the caller.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut attempt_fn: F) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let attempts = self.settings.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(op, attempt, error = %err, "retrying after contention");
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn validate_post(post_id: PostId) -> LedgerResult<()> {
    if post_id <= 0 {
        return Err(LedgerError::validation(format!("invalid post id {post_id}")));
    }
    Ok(())
}

fn validate_target<'a>(what: &str, raw: &'a str) -> LedgerResult<&'a str> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(LedgerError::validation(format!("{what} is missing")));
    }
    if id.len() > MAX_TARGET_ID_LEN {
        return Err(LedgerError::validation(format!(
            "{what} longer than {MAX_TARGET_ID_LEN} bytes"
        )));
    }
    Ok(id)
}

fn minutes_to_hours(minutes: i64) -> f64 {
    (minutes as f64 / 6.0).round() / 10.0
}
