use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::LedgerResult;
use crate::models::{
    ActivityCounter, DailyActivity, InteractionPatch, PostId, PostInteractionState, PostTally,
    ProblemIntent, ProblemOutcome, UserKey, UserProgress, VideoOutcome,
};

/// Durable ledger state. Every mutating method is one atomic read-modify-write
/// serialized on its key: `(user, post)` for interactions, `user` for
/// progress, `(user, video)` for video progress. Nothing is visible unless the
/// whole method commits.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Patches the interaction row and moves the post's counters by the vote
    /// delta in the same transaction.
    async fn apply_interaction(
        &self,
        user: &UserKey,
        post_id: PostId,
        patch: InteractionPatch,
    ) -> LedgerResult<PostInteractionState>;

    /// Solves/unsolves a problem. Solving advances the streak and bumps the
    /// day's `problems_solved`; unsolving only decrements the totals.
    async fn set_problem(
        &self,
        user: &UserKey,
        problem_id: &str,
        topic_id: &str,
        intent: ProblemIntent,
        today: NaiveDate,
    ) -> LedgerResult<ProblemOutcome>;

    /// Records the furthest reported progress; bumps `videos_watched` on the
    /// first transition to completed.
    async fn record_video_progress(
        &self,
        user: &UserKey,
        video_id: &str,
        topic_id: &str,
        percentage: u8,
        completes: bool,
        today: NaiveDate,
    ) -> LedgerResult<VideoOutcome>;

    async fn bump_activity(
        &self,
        user: &UserKey,
        date: NaiveDate,
        counter: ActivityCounter,
        delta: i64,
    ) -> LedgerResult<DailyActivity>;

    /// Adds to `total_study_minutes` and the day's `study_minutes` together.
    async fn add_study_minutes(
        &self,
        user: &UserKey,
        minutes: i64,
        today: NaiveDate,
    ) -> LedgerResult<UserProgress>;

    async fn user_progress(&self, user: &UserKey) -> LedgerResult<Option<UserProgress>>;

    /// Rows with `from <= date <= to`, in date order.
    async fn activity_range(
        &self,
        user: &UserKey,
        from: NaiveDate,
        to: NaiveDate,
    ) -> LedgerResult<Vec<DailyActivity>>;

    async fn post_tally(&self, post_id: PostId) -> LedgerResult<PostTally>;

    async fn upsert_post(&self, post_id: PostId, title: &str) -> LedgerResult<()>;

    /// Recomputes every post's counters from its interaction rows. Returns
    /// the number of posts whose stored counters had drifted.
    async fn repair_post_tallies(&self) -> LedgerResult<u64>;
}
