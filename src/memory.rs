use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::activity::clamped_add;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    ActivityCounter, ActivityCounts, DailyActivity, InteractionPatch, PostId,
    PostInteractionState, PostTally, ProblemIntent, ProblemOutcome, UserKey, UserProgress, Vote,
    VideoOutcome,
};
use crate::progress::{problem_change, video_change};
use crate::store::LedgerStore;
use crate::vote::{tally_from_votes, VoteDelta};

#[derive(Debug, Clone, Copy, Default)]
struct Interaction {
    vote: Vote,
    is_saved: bool,
    revision: i64,
}

#[derive(Debug, Default)]
struct Tables {
    posts: HashMap<PostId, (String, PostTally)>,
    interactions: HashMap<(UserKey, PostId), Interaction>,
    progress: HashMap<UserKey, UserProgress>,
    solved: HashMap<(UserKey, String), (String, NaiveDate)>,
    activity: BTreeMap<(UserKey, NaiveDate), ActivityCounts>,
    videos: HashMap<(UserKey, String), (String, u8, bool)>,
}

impl Tables {
    fn day_counts(&self, user: &UserKey, date: NaiveDate) -> Option<ActivityCounts> {
        self.activity.get(&(user.clone(), date)).copied()
    }
}

/// In-process store. Each method works on copies of the rows it touches and
/// writes them back only at the end, so an injected failure leaves nothing
/// behind.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    contention: AtomicU32,
    failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` mutations fail with a contention error before reading.
    pub fn inject_contention(&self, n: u32) {
        self.contention.store(n, Ordering::SeqCst);
    }

    /// The next `n` mutations fail just before commit.
    pub fn inject_commit_failures(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn interaction(&self, user: &UserKey, post_id: PostId) -> Option<(Vote, bool)> {
        self.lock()
            .ok()?
            .interactions
            .get(&(user.clone(), post_id))
            .map(|row| (row.vote, row.is_saved))
    }

    pub fn is_solved(&self, user: &UserKey, problem_id: &str) -> bool {
        self.lock()
            .map(|t| t.solved.contains_key(&(user.clone(), problem_id.to_string())))
            .unwrap_or(false)
    }

    /// Overwrites a post's stored counters without touching interactions.
    pub fn set_tally(&self, post_id: PostId, tally: PostTally) {
        if let Ok(mut tables) = self.lock() {
            if let Some(post) = tables.posts.get_mut(&post_id) {
                post.1 = tally;
            }
        }
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| LedgerError::Internal("memory store mutex poisoned".into()))
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn begin(&self, key: &str) -> LedgerResult<MutexGuard<'_, Tables>> {
        if Self::take(&self.contention) {
            return Err(LedgerError::Contention(key.to_string()));
        }
        self.lock()
    }

    fn precommit(&self) -> LedgerResult<()> {
        if Self::take(&self.failures) {
            return Err(LedgerError::Internal("injected failure before commit".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn apply_interaction(
        &self,
        user: &UserKey,
        post_id: PostId,
        patch: InteractionPatch,
    ) -> LedgerResult<PostInteractionState> {
        let mut tables = self.begin(&format!("{user}/{post_id}"))?;
        let tally = tables
            .posts
            .get(&post_id)
            .map(|(_, tally)| *tally)
            .ok_or_else(|| LedgerError::not_found("post", post_id))?;

        let key = (user.clone(), post_id);
        let old = tables.interactions.get(&key).copied().unwrap_or_default();
        let (vote, is_saved) = patch.resolve(old.vote, old.is_saved);
        let tally = VoteDelta::between(old.vote, vote).apply(tally);
        let revision = old.revision + 1;

        self.precommit()?;
        tables.interactions.insert(
            key,
            Interaction {
                vote,
                is_saved,
                revision,
            },
        );
        if let Some(post) = tables.posts.get_mut(&post_id) {
            post.1 = tally;
        }

        Ok(PostInteractionState {
            post_id,
            upvotes: tally.upvotes,
            downvotes: tally.downvotes,
            vote,
            is_saved,
            revision,
        })
    }

    async fn set_problem(
        &self,
        user: &UserKey,
        problem_id: &str,
        topic_id: &str,
        intent: ProblemIntent,
        today: NaiveDate,
    ) -> LedgerResult<ProblemOutcome> {
        let mut tables = self.begin(user.as_str())?;
        let progress = tables
            .progress
            .get(user)
            .cloned()
            .unwrap_or_else(|| UserProgress::empty(user.clone()));
        let solved_key = (user.clone(), problem_id.to_string());
        let was_solved = tables.solved.contains_key(&solved_key);

        let mut change = problem_change(&progress, was_solved, intent, today);
        if !change.is_noop() {
            change.progress.revision += 1;
        }
        let day = tables.day_counts(user, today);

        self.precommit()?;
        if !change.is_noop() {
            if change.solved {
                tables
                    .solved
                    .insert(solved_key, (topic_id.to_string(), today));
            } else {
                tables.solved.remove(&solved_key);
            }
            let mut counts = day.unwrap_or_default();
            counts.problems_solved =
                clamped_add(day.map(|c| c.problems_solved), change.problems_delta);
            tables.activity.insert((user.clone(), today), counts);
        }
        tables.progress.insert(user.clone(), change.progress.clone());

        Ok(ProblemOutcome {
            solved: change.solved,
            problem_id: problem_id.to_string(),
            total_problems_solved: change.progress.total_problems_solved,
            current_streak: change.progress.current_streak,
            longest_streak: change.progress.longest_streak,
            revision: change.progress.revision,
        })
    }

    async fn record_video_progress(
        &self,
        user: &UserKey,
        video_id: &str,
        topic_id: &str,
        percentage: u8,
        completes: bool,
        today: NaiveDate,
    ) -> LedgerResult<VideoOutcome> {
        let mut tables = self.begin(&format!("{user}/{video_id}"))?;
        let key = (user.clone(), video_id.to_string());
        let previous = tables.videos.get(&key).map(|(_, pct, done)| (*pct, *done));
        let change = video_change(previous, percentage, completes);
        let day = tables.day_counts(user, today);

        self.precommit()?;
        tables.videos.insert(
            key,
            (topic_id.to_string(), change.percentage, change.completed),
        );
        if change.newly_completed {
            let mut counts = day.unwrap_or_default();
            counts.videos_watched = clamped_add(day.map(|c| c.videos_watched), 1);
            tables.activity.insert((user.clone(), today), counts);
        }

        Ok(VideoOutcome {
            video_id: video_id.to_string(),
            percentage: change.percentage,
            completed: change.completed,
        })
    }

    async fn bump_activity(
        &self,
        user: &UserKey,
        date: NaiveDate,
        counter: ActivityCounter,
        delta: i64,
    ) -> LedgerResult<DailyActivity> {
        let mut tables = self.begin(user.as_str())?;
        let day = tables.day_counts(user, date);
        let mut counts = day.unwrap_or_default();
        *counts.get_mut(counter) = clamped_add(day.map(|c| c.get(counter)), delta);

        self.precommit()?;
        tables.activity.insert((user.clone(), date), counts);

        Ok(DailyActivity {
            user: user.clone(),
            date,
            counts,
        })
    }

    async fn add_study_minutes(
        &self,
        user: &UserKey,
        minutes: i64,
        today: NaiveDate,
    ) -> LedgerResult<UserProgress> {
        let mut tables = self.begin(user.as_str())?;
        let mut progress = tables
            .progress
            .get(user)
            .cloned()
            .unwrap_or_else(|| UserProgress::empty(user.clone()));
        progress.total_study_minutes = clamped_add(Some(progress.total_study_minutes), minutes);
        progress.revision += 1;
        let day = tables.day_counts(user, today);
        let mut counts = day.unwrap_or_default();
        counts.study_minutes = clamped_add(day.map(|c| c.study_minutes), minutes);

        self.precommit()?;
        tables.activity.insert((user.clone(), today), counts);
        tables.progress.insert(user.clone(), progress.clone());
        Ok(progress)
    }

    async fn user_progress(&self, user: &UserKey) -> LedgerResult<Option<UserProgress>> {
        Ok(self.lock()?.progress.get(user).cloned())
    }

    async fn activity_range(
        &self,
        user: &UserKey,
        from: NaiveDate,
        to: NaiveDate,
    ) -> LedgerResult<Vec<DailyActivity>> {
        if from > to {
            return Ok(Vec::new());
        }
        let tables = self.lock()?;
        Ok(tables
            .activity
            .range((user.clone(), from)..=(user.clone(), to))
            .map(|((user, date), counts)| DailyActivity {
                user: user.clone(),
                date: *date,
                counts: *counts,
            })
            .collect())
    }

    async fn post_tally(&self, post_id: PostId) -> LedgerResult<PostTally> {
        self.lock()?
            .posts
            .get(&post_id)
            .map(|(_, tally)| *tally)
            .ok_or_else(|| LedgerError::not_found("post", post_id))
    }

    async fn upsert_post(&self, post_id: PostId, title: &str) -> LedgerResult<()> {
        let mut tables = self.lock()?;
        tables
            .posts
            .entry(post_id)
            .and_modify(|post| post.0 = title.to_string())
            .or_insert_with(|| (title.to_string(), PostTally::default()));
        Ok(())
    }

    async fn repair_post_tallies(&self) -> LedgerResult<u64> {
        let mut tables = self.begin("posts")?;
        let mut rebuilt: HashMap<PostId, Vec<Vote>> = HashMap::new();
        for ((_, post_id), row) in &tables.interactions {
            rebuilt.entry(*post_id).or_default().push(row.vote);
        }

        let mut repaired = 0;
        for (post_id, (_, tally)) in tables.posts.iter_mut() {
            let expected = tally_from_votes(rebuilt.remove(post_id).unwrap_or_default());
            if *tally != expected {
                *tally = expected;
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}
