use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    ActivityCounter, ActivityCounts, DailyActivity, InteractionPatch, PostId,
    PostInteractionState, PostTally, ProblemIntent, ProblemOutcome, UserKey, UserProgress, Vote,
    VideoOutcome,
};
use crate::progress::{problem_change, video_change};
use crate::store::LedgerStore;
use crate::vote::VoteDelta;

pub async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Loads sample posts. Their tallies come from real interaction rows cast by
/// sample voters, so a repair sweep finds nothing to fix. Safe to rerun.
pub async fn seed<S: LedgerStore + ?Sized>(store: &S) -> LedgerResult<()> {
    let posts = vec![
        (1_i64, "Two pointers cheat sheet", 10_usize, 2_usize),
        (2, "How I prepared for system design rounds", 4, 0),
        (3, "Remote internship openings this week", 0, 1),
    ];

    for (id, title, upvotes, downvotes) in posts {
        store.upsert_post(id, title).await?;
        let votes = std::iter::repeat(Vote::Up)
            .take(upvotes)
            .chain(std::iter::repeat(Vote::Down).take(downvotes));
        for (n, vote) in votes.enumerate() {
            let voter = UserKey::parse(&format!("seed-voter-{:02}@example.com", n + 1))?;
            store
                .apply_interaction(&voter, id, InteractionPatch::vote(vote))
                .await?;
        }
        debug!(post_id = id, upvotes, downvotes, "seeded post");
    }

    Ok(())
}

/// Tags driver errors with the key being mutated so contention is reported
/// against it.
trait OnKey<T> {
    fn on_key(self, key: &str) -> LedgerResult<T>;
}

impl<T> OnKey<T> for Result<T, sqlx::Error> {
    fn on_key(self, key: &str) -> LedgerResult<T> {
        self.map_err(|err| LedgerError::from_sqlx(err, key))
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PgStore {
    pub fn new(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }

    async fn begin(&self, key: &str) -> LedgerResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.on_key(key)?;
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout_ms))
            .execute(&mut *tx)
            .await
            .on_key(key)?;
        Ok(tx)
    }

    /// Creates the progress row if needed and locks it for the rest of the
    /// transaction.
    async fn lock_progress(conn: &mut PgConnection, user: &UserKey) -> LedgerResult<UserProgress> {
        sqlx::query(
            r#"
            INSERT INTO engagement_ledger.user_progress (user_key)
            VALUES ($1)
            ON CONFLICT (user_key) DO NOTHING
            "#,
        )
        .bind(user.as_str())
        .execute(&mut *conn)
        .await
        .on_key(user.as_str())?;

        let row = sqlx::query(
            r#"
            SELECT user_key, total_problems_solved, current_streak, longest_streak,
                   last_activity_date, total_study_minutes, revision
            FROM engagement_ledger.user_progress
            WHERE user_key = $1
            FOR UPDATE
            "#,
        )
        .bind(user.as_str())
        .fetch_one(&mut *conn)
        .await
        .on_key(user.as_str())?;

        progress_from_row(&row)
    }
}

async fn bump_in_tx(
    conn: &mut PgConnection,
    user: &UserKey,
    date: NaiveDate,
    counter: ActivityCounter,
    delta: i64,
) -> LedgerResult<ActivityCounts> {
    let column = counter.column();
    let sql = format!(
        r#"
        INSERT INTO engagement_ledger.user_activity AS ua (user_key, activity_date, {column})
        VALUES ($1, $2, GREATEST($3, 0))
        ON CONFLICT (user_key, activity_date) DO UPDATE
        SET {column} = GREATEST(0, ua.{column} + $3)
        RETURNING problems_solved, videos_watched, messages_sent, study_minutes
        "#
    );

    let row = sqlx::query(&sql)
        .bind(user.as_str())
        .bind(date)
        .bind(delta)
        .fetch_one(&mut *conn)
        .await
        .on_key(user.as_str())?;

    Ok(counts_from_row(&row))
}

fn counts_from_row(row: &PgRow) -> ActivityCounts {
    ActivityCounts {
        problems_solved: row.get("problems_solved"),
        videos_watched: row.get("videos_watched"),
        messages_sent: row.get("messages_sent"),
        study_minutes: row.get("study_minutes"),
    }
}

fn progress_from_row(row: &PgRow) -> LedgerResult<UserProgress> {
    let user: String = row.get("user_key");
    Ok(UserProgress {
        user: UserKey::parse(&user)?,
        total_problems_solved: row.get("total_problems_solved"),
        current_streak: row.get("current_streak"),
        longest_streak: row.get("longest_streak"),
        last_activity_date: row.get("last_activity_date"),
        total_study_minutes: row.get("total_study_minutes"),
        revision: row.get("revision"),
    })
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn apply_interaction(
        &self,
        user: &UserKey,
        post_id: PostId,
        patch: InteractionPatch,
    ) -> LedgerResult<PostInteractionState> {
        let key = format!("{user}/{post_id}");
        let mut tx = self.begin(&key).await?;

        let exists = sqlx::query("SELECT 1 FROM engagement_ledger.posts WHERE id = $1")
            .bind(post_id)
            .fetch_optional(&mut *tx)
            .await
            .on_key(&key)?;
        if exists.is_none() {
            return Err(LedgerError::not_found("post", post_id));
        }

        sqlx::query(
            r#"
            INSERT INTO engagement_ledger.post_interactions (user_key, post_id)
            VALUES ($1, $2)
            ON CONFLICT (user_key, post_id) DO NOTHING
            "#,
        )
        .bind(user.as_str())
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .on_key(&key)?;

        let row = sqlx::query(
            r#"
            SELECT vote_type, is_saved
            FROM engagement_ledger.post_interactions
            WHERE user_key = $1 AND post_id = $2
            FOR UPDATE
            "#,
        )
        .bind(user.as_str())
        .bind(post_id)
        .fetch_one(&mut *tx)
        .await
        .on_key(&key)?;

        let stored: Option<String> = row.get("vote_type");
        let old_vote = Vote::from_stored(stored.as_deref())?;
        let (vote, is_saved) = patch.resolve(old_vote, row.get("is_saved"));
        let delta = VoteDelta::between(old_vote, vote);

        let revision: i64 = sqlx::query(
            r#"
            UPDATE engagement_ledger.post_interactions
            SET vote_type = $3, is_saved = $4, revision = revision + 1, updated_at = NOW()
            WHERE user_key = $1 AND post_id = $2
            RETURNING revision
            "#,
        )
        .bind(user.as_str())
        .bind(post_id)
        .bind(vote.as_stored())
        .bind(is_saved)
        .fetch_one(&mut *tx)
        .await
        .on_key(&key)?
        .get("revision");

        let fetched = if delta.is_zero() {
            sqlx::query("SELECT upvotes, downvotes FROM engagement_ledger.posts WHERE id = $1")
                .bind(post_id)
                .fetch_one(&mut *tx)
                .await
        } else {
            sqlx::query(
                r#"
                UPDATE engagement_ledger.posts
                SET upvotes = GREATEST(0, upvotes + $2),
                    downvotes = GREATEST(0, downvotes + $3)
                WHERE id = $1
                RETURNING upvotes, downvotes
                "#,
            )
            .bind(post_id)
            .bind(delta.upvotes)
            .bind(delta.downvotes)
            .fetch_one(&mut *tx)
            .await
        };
        let tally_row = fetched.on_key(&key)?;

        tx.commit().await.on_key(&key)?;
        debug!(%user, post_id, %old_vote, %vote, ?delta, "interaction committed");

        Ok(PostInteractionState {
            post_id,
            upvotes: tally_row.get("upvotes"),
            downvotes: tally_row.get("downvotes"),
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
        let key = user.as_str();
        let mut tx = self.begin(key).await?;
        let progress = Self::lock_progress(&mut tx, user).await?;

        let was_solved = sqlx::query(
            "SELECT 1 FROM engagement_ledger.solved_problems WHERE user_key = $1 AND problem_id = $2",
        )
        .bind(key)
        .bind(problem_id)
        .fetch_optional(&mut *tx)
        .await
        .on_key(key)?
        .is_some();

        let change = problem_change(&progress, was_solved, intent, today);
        let mut revision = progress.revision;

        if !change.is_noop() {
            if change.solved {
                sqlx::query(
                    r#"
                    INSERT INTO engagement_ledger.solved_problems (user_key, problem_id, topic_id)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (user_key, problem_id) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(problem_id)
                .bind(topic_id)
                .execute(&mut *tx)
                .await
                .on_key(key)?;
            } else {
                sqlx::query(
                    "DELETE FROM engagement_ledger.solved_problems WHERE user_key = $1 AND problem_id = $2",
                )
                .bind(key)
                .bind(problem_id)
                .execute(&mut *tx)
                .await
                .on_key(key)?;
            }

            revision = sqlx::query(
                r#"
                UPDATE engagement_ledger.user_progress
                SET total_problems_solved = $2,
                    current_streak = $3,
                    longest_streak = $4,
                    last_activity_date = $5,
                    revision = revision + 1,
                    updated_at = NOW()
                WHERE user_key = $1
                RETURNING revision
                "#,
            )
            .bind(key)
            .bind(change.progress.total_problems_solved)
            .bind(change.progress.current_streak)
            .bind(change.progress.longest_streak)
            .bind(change.progress.last_activity_date)
            .fetch_one(&mut *tx)
            .await
            .on_key(key)?
            .get("revision");

            bump_in_tx(
                &mut tx,
                user,
                today,
                ActivityCounter::ProblemsSolved,
                change.problems_delta,
            )
            .await?;
        }

        tx.commit().await.on_key(key)?;
        debug!(%user, problem_id, solved = change.solved, streak = ?change.streak, "problem committed");

        Ok(ProblemOutcome {
            solved: change.solved,
            problem_id: problem_id.to_string(),
            total_problems_solved: change.progress.total_problems_solved,
            current_streak: change.progress.current_streak,
            longest_streak: change.progress.longest_streak,
            revision,
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
        let key = format!("{user}/{video_id}");
        let mut tx = self.begin(&key).await?;

        sqlx::query(
            r#"
            INSERT INTO engagement_ledger.video_progress (user_key, video_id, topic_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_key, video_id) DO NOTHING
            "#,
        )
        .bind(user.as_str())
        .bind(video_id)
        .bind(topic_id)
        .execute(&mut *tx)
        .await
        .on_key(&key)?;

        let row = sqlx::query(
            r#"
            SELECT percentage, completed
            FROM engagement_ledger.video_progress
            WHERE user_key = $1 AND video_id = $2
            FOR UPDATE
            "#,
        )
        .bind(user.as_str())
        .bind(video_id)
        .fetch_one(&mut *tx)
        .await
        .on_key(&key)?;

        let stored: i16 = row.get("percentage");
        let previous = (u8::try_from(stored).unwrap_or(100), row.get("completed"));
        let change = video_change(Some(previous), percentage, completes);

        sqlx::query(
            r#"
            UPDATE engagement_ledger.video_progress
            SET percentage = $3, completed = $4, topic_id = $5, updated_at = NOW()
            WHERE user_key = $1 AND video_id = $2
            "#,
        )
        .bind(user.as_str())
        .bind(video_id)
        .bind(i16::from(change.percentage))
        .bind(change.completed)
        .bind(topic_id)
        .execute(&mut *tx)
        .await
        .on_key(&key)?;

        if change.newly_completed {
            bump_in_tx(&mut tx, user, today, ActivityCounter::VideosWatched, 1).await?;
        }

        tx.commit().await.on_key(&key)?;
        debug!(%user, video_id, percentage = change.percentage, completed = change.completed, "video progress committed");

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
        let mut tx = self.begin(user.as_str()).await?;
        let counts = bump_in_tx(&mut tx, user, date, counter, delta).await?;
        tx.commit().await.on_key(user.as_str())?;

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
        let key = user.as_str();
        let mut tx = self.begin(key).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO engagement_ledger.user_progress AS up (user_key, total_study_minutes, revision)
            VALUES ($1, GREATEST($2, 0), 1)
            ON CONFLICT (user_key) DO UPDATE
            SET total_study_minutes = GREATEST(0, up.total_study_minutes + $2),
                revision = up.revision + 1,
                updated_at = NOW()
            RETURNING user_key, total_problems_solved, current_streak, longest_streak,
                      last_activity_date, total_study_minutes, revision
            "#,
        )
        .bind(key)
        .bind(minutes)
        .fetch_one(&mut *tx)
        .await
        .on_key(key)?;
        let progress = progress_from_row(&row)?;

        bump_in_tx(&mut tx, user, today, ActivityCounter::StudyMinutes, minutes).await?;
        tx.commit().await.on_key(key)?;
        Ok(progress)
    }

    async fn user_progress(&self, user: &UserKey) -> LedgerResult<Option<UserProgress>> {
        let row = sqlx::query(
            r#"
            SELECT user_key, total_problems_solved, current_streak, longest_streak,
                   last_activity_date, total_study_minutes, revision
            FROM engagement_ledger.user_progress
            WHERE user_key = $1
            "#,
        )
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(progress_from_row).transpose()
    }

    async fn activity_range(
        &self,
        user: &UserKey,
        from: NaiveDate,
        to: NaiveDate,
    ) -> LedgerResult<Vec<DailyActivity>> {
        let rows = sqlx::query(
            r#"
            SELECT activity_date, problems_solved, videos_watched, messages_sent, study_minutes
            FROM engagement_ledger.user_activity
            WHERE user_key = $1 AND activity_date BETWEEN $2 AND $3
            ORDER BY activity_date
            "#,
        )
        .bind(user.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut days = Vec::new();
        for row in rows {
            days.push(DailyActivity {
                user: user.clone(),
                date: row.get("activity_date"),
                counts: counts_from_row(&row),
            });
        }

        Ok(days)
    }

    async fn post_tally(&self, post_id: PostId) -> LedgerResult<PostTally> {
        let row = sqlx::query("SELECT upvotes, downvotes FROM engagement_ledger.posts WHERE id = $1")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::not_found("post", post_id))?;

        Ok(PostTally {
            upvotes: row.get("upvotes"),
            downvotes: row.get("downvotes"),
        })
    }

    async fn upsert_post(&self, post_id: PostId, title: &str) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO engagement_ledger.posts (id, title)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title
            "#,
        )
        .bind(post_id)
        .bind(title)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn repair_post_tallies(&self) -> LedgerResult<u64> {
        let key = "posts";
        let mut tx = self.begin(key).await?;

        // Blocks vote writers for the duration of the sweep.
        sqlx::query("LOCK TABLE engagement_ledger.post_interactions IN SHARE MODE")
            .execute(&mut *tx)
            .await
            .on_key(key)?;

        let result = sqlx::query(
            r#"
            WITH actual AS (
                SELECT p.id,
                       COUNT(i.post_id) FILTER (WHERE i.vote_type = 'up') AS up,
                       COUNT(i.post_id) FILTER (WHERE i.vote_type = 'down') AS down
                FROM engagement_ledger.posts p
                LEFT JOIN engagement_ledger.post_interactions i ON i.post_id = p.id
                GROUP BY p.id
            )
            UPDATE engagement_ledger.posts p
            SET upvotes = a.up, downvotes = a.down
            FROM actual a
            WHERE p.id = a.id AND (p.upvotes <> a.up OR p.downvotes <> a.down)
            "#,
        )
        .execute(&mut *tx)
        .await
        .on_key(key)?;

        tx.commit().await.on_key(key)?;
        info!(repaired = result.rows_affected(), "post tallies reconciled");
        Ok(result.rows_affected())
    }
}
