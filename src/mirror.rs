//! Client-side optimistic mirrors of ledger state.
//!
//! A mirror shows the predicted effect of an action as soon as it is taken,
//! then settles it against the server: confirm overwrites with server state,
//! reject drops the prediction. The shown value is always the newest
//! authoritative state with the still-pending predictions replayed on top.
//!
//! Server states are ordered by the revision the server stamps on them, not
//! by the order requests were sent or answered. Pending intents are absolute
//! (set this vote, set this flag), so replaying one the server has already
//! applied changes nothing.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{Clock, Ledger};
use crate::models::{
    InteractionPatch, PostId, PostInteractionState, PostTally, ProblemIntent, ProblemOutcome,
    UserKey, Vote,
};
use crate::store::LedgerStore;
use crate::vote::VoteDelta;

pub type ActionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Predicted,
    Confirmed,
    RolledBack,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MirrorError {
    #[error("unknown action {0}")]
    UnknownAction(ActionId),
    #[error("action {0} already settled")]
    AlreadySettled(ActionId),
}

/// A locally mirrored value and the client-side transition rule for it.
pub trait Predict: Copy + Default {
    type Intent: Copy + std::fmt::Debug;

    fn predict(self, intent: Self::Intent) -> Self;

    /// Server write counter this value was read at. Predictions keep the
    /// revision they started from.
    fn revision(&self) -> i64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostView {
    pub upvotes: i64,
    pub downvotes: i64,
    pub vote: Vote,
    pub is_saved: bool,
    pub revision: i64,
}

impl From<&PostInteractionState> for PostView {
    fn from(state: &PostInteractionState) -> Self {
        Self {
            upvotes: state.upvotes,
            downvotes: state.downvotes,
            vote: state.vote,
            is_saved: state.is_saved,
            revision: state.revision,
        }
    }
}

impl Predict for PostView {
    type Intent = InteractionPatch;

    /// Same delta rule the server applies.
    fn predict(self, patch: InteractionPatch) -> Self {
        let (vote, is_saved) = patch.resolve(self.vote, self.is_saved);
        let tally = VoteDelta::between(self.vote, vote).apply(PostTally {
            upvotes: self.upvotes,
            downvotes: self.downvotes,
        });
        Self {
            upvotes: tally.upvotes,
            downvotes: tally.downvotes,
            vote,
            is_saved,
            revision: self.revision,
        }
    }

    fn revision(&self) -> i64 {
        self.revision
    }
}

/// Only the solved flag is predicted; streak numbers depend on server-side
/// dates across devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProblemView {
    pub solved: bool,
    pub revision: i64,
}

impl From<&ProblemOutcome> for ProblemView {
    fn from(outcome: &ProblemOutcome) -> Self {
        Self {
            solved: outcome.solved,
            revision: outcome.revision,
        }
    }
}

impl Predict for ProblemView {
    type Intent = ProblemIntent;

    fn predict(self, intent: ProblemIntent) -> Self {
        let solved = match intent {
            ProblemIntent::Toggle => !self.solved,
            ProblemIntent::Set(solved) => solved,
        };
        Self { solved, ..self }
    }

    fn revision(&self) -> i64 {
        self.revision
    }
}

/// Old authoritative state + server response + pending intents -> shown state.
/// A response older than `base` does not replace it.
pub fn reconcile<V: Predict>(base: V, server: Option<V>, pending: &[V::Intent]) -> V {
    let authoritative = match server {
        Some(server) if server.revision() >= base.revision() => server,
        _ => base,
    };
    pending
        .iter()
        .fold(authoritative, |view, intent| view.predict(*intent))
}

#[derive(Debug, Clone)]
struct Tracked<K, V: Predict> {
    key: K,
    seq: u64,
    intent: V::Intent,
    snapshot: V,
    state: ActionState,
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry<V> {
    base: V,
    view: V,
}

#[derive(Debug)]
pub struct Mirror<K, V: Predict> {
    entries: HashMap<K, Entry<V>>,
    actions: HashMap<ActionId, Tracked<K, V>>,
    next_seq: u64,
}

pub type PostMirror = Mirror<PostId, PostView>;
pub type ProblemMirror = Mirror<String, ProblemView>;

impl<K: Eq + Hash + Clone, V: Predict> Default for Mirror<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            actions: HashMap::new(),
            next_seq: 1,
        }
    }
}

impl<K: Eq + Hash + Clone, V: Predict> Mirror<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a server-known value, e.g. from an initial fetch.
    pub fn seed(&mut self, key: K, value: V) {
        let pending = self.pending_intents(&key);
        let entry = self.entries.entry(key).or_default();
        entry.base = value;
        entry.view = reconcile(value, None, &pending);
    }

    pub fn view(&self, key: &K) -> V {
        self.entries.get(key).map(|e| e.view).unwrap_or_default()
    }

    pub fn state(&self, id: ActionId) -> Option<ActionState> {
        self.actions.get(&id).map(|a| a.state)
    }

    /// Value shown just before the action was predicted.
    pub fn snapshot(&self, id: ActionId) -> Option<V> {
        self.actions.get(&id).map(|a| a.snapshot)
    }

    /// Actions still in the log, settled or not.
    pub fn tracked_count(&self) -> usize {
        self.actions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.actions
            .values()
            .filter(|a| a.state == ActionState::Predicted)
            .count()
    }

    pub fn predict(&mut self, key: K, intent: V::Intent) -> (ActionId, V) {
        let id = Uuid::new_v4();
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = self.entries.entry(key.clone()).or_default();
        let snapshot = entry.view;
        entry.view = snapshot.predict(intent);
        let view = entry.view;

        self.actions.insert(
            id,
            Tracked {
                key,
                seq,
                intent,
                snapshot,
                state: ActionState::Predicted,
            },
        );
        (id, view)
    }

    /// The server state becomes the base unless one with a newer revision
    /// has already been accepted for the key, whatever order the responses
    /// arrive in.
    pub fn confirm(&mut self, id: ActionId, server: V) -> Result<V, MirrorError> {
        let key = self.settle(id, ActionState::Confirmed)?;
        let pending = self.pending_intents(&key);

        let entry = self.entries.entry(key).or_default();
        entry.base = reconcile(entry.base, Some(server), &[]);
        entry.view = reconcile(entry.base, None, &pending);
        Ok(entry.view)
    }

    pub fn reject(&mut self, id: ActionId) -> Result<V, MirrorError> {
        let key = self.settle(id, ActionState::RolledBack)?;
        let pending = self.pending_intents(&key);
        let entry = self.entries.entry(key).or_default();
        entry.view = reconcile(entry.base, None, &pending);
        Ok(entry.view)
    }

    /// Drops settled actions from the log. Settled actions are only kept for
    /// `state` and `snapshot` lookups; reconciliation never reads them.
    pub fn prune(&mut self) {
        self.actions.retain(|_, a| a.state == ActionState::Predicted);
    }

    fn settle(&mut self, id: ActionId, state: ActionState) -> Result<K, MirrorError> {
        let action = self
            .actions
            .get_mut(&id)
            .ok_or(MirrorError::UnknownAction(id))?;
        if action.state != ActionState::Predicted {
            return Err(MirrorError::AlreadySettled(id));
        }
        action.state = state;
        Ok(action.key.clone())
    }

    fn pending_intents(&self, key: &K) -> Vec<V::Intent> {
        let mut pending: Vec<&Tracked<K, V>> = self
            .actions
            .values()
            .filter(|a| a.state == ActionState::Predicted && &a.key == key)
            .collect();
        pending.sort_by_key(|a| a.seq);
        pending.into_iter().map(|a| a.intent).collect()
    }
}

/// Authoritative endpoints the mirrors talk to.
#[async_trait]
pub trait LedgerApi: Send + Sync {
    async fn apply_interaction(
        &self,
        user: &UserKey,
        post_id: PostId,
        patch: InteractionPatch,
    ) -> LedgerResult<PostInteractionState>;

    async fn set_problem_solved(
        &self,
        user: &UserKey,
        problem_id: &str,
        topic_id: &str,
        solved: bool,
    ) -> LedgerResult<ProblemOutcome>;
}

#[async_trait]
impl<S: LedgerStore, C: Clock> LedgerApi for Ledger<S, C> {
    async fn apply_interaction(
        &self,
        user: &UserKey,
        post_id: PostId,
        patch: InteractionPatch,
    ) -> LedgerResult<PostInteractionState> {
        match (patch.vote, patch.is_saved) {
            (Some(vote), None) => self.submit_vote(user, post_id, vote).await,
            (None, Some(saved)) => self.set_saved(user, post_id, saved).await,
            _ => Err(LedgerError::validation(
                "send vote and save changes as separate actions",
            )),
        }
    }

    async fn set_problem_solved(
        &self,
        user: &UserKey,
        problem_id: &str,
        topic_id: &str,
        solved: bool,
    ) -> LedgerResult<ProblemOutcome> {
        Ledger::set_problem_solved(self, user, problem_id, topic_id, solved).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

fn settled(err: MirrorError) -> LedgerError {
    LedgerError::Internal(err.to_string())
}

/// Predicts, submits, settles, then drops settled actions from the log. The
/// mirror lock is never held across the request.
pub async fn submit_interaction<A: LedgerApi + ?Sized>(
    mirror: &Mutex<PostMirror>,
    api: &A,
    user: &UserKey,
    post_id: PostId,
    patch: InteractionPatch,
) -> LedgerResult<PostView> {
    let (id, _) = lock(mirror).predict(post_id, patch);
    let result = api.apply_interaction(user, post_id, patch).await;

    let mut mirror = lock(mirror);
    let settled_view = match result {
        Ok(state) => mirror.confirm(id, PostView::from(&state)).map_err(settled),
        Err(err) => mirror.reject(id).map_err(settled).and(Err(err)),
    };
    mirror.prune();
    settled_view
}

/// Flips the shown flag and records and sends the flipped value, so neither
/// a retried request nor a replayed prediction can flip it back.
pub async fn toggle_problem<A: LedgerApi + ?Sized>(
    mirror: &Mutex<ProblemMirror>,
    api: &A,
    user: &UserKey,
    problem_id: &str,
    topic_id: &str,
) -> LedgerResult<ProblemView> {
    let (id, predicted) = {
        let mut mirror = lock(mirror);
        let key = problem_id.to_string();
        let target = !mirror.view(&key).solved;
        mirror.predict(key, ProblemIntent::Set(target))
    };
    let result = api
        .set_problem_solved(user, problem_id, topic_id, predicted.solved)
        .await;

    let mut mirror = lock(mirror);
    let settled_view = match result {
        Ok(outcome) => mirror.confirm(id, ProblemView::from(&outcome)).map_err(settled),
        Err(err) => mirror.reject(id).map_err(settled).and(Err(err)),
    };
    mirror.prune();
    settled_view
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(upvotes: i64, downvotes: i64, vote: Vote) -> PostView {
        at(0, upvotes, downvotes, vote)
    }

    fn at(revision: i64, upvotes: i64, downvotes: i64, vote: Vote) -> PostView {
        PostView {
            upvotes,
            downvotes,
            vote,
            is_saved: false,
            revision,
        }
    }

    #[test]
    fn prediction_uses_the_server_delta_rule() {
        let start = post(10, 2, Vote::None);
        let up = start.predict(InteractionPatch::vote(Vote::Up));
        assert_eq!(up, post(11, 2, Vote::Up));
        let down = up.predict(InteractionPatch::vote(Vote::Down));
        assert_eq!(down, post(10, 3, Vote::Down));
        assert_eq!(down.predict(InteractionPatch::vote(Vote::Down)), down);
    }

    #[test]
    fn confirm_overwrites_with_server_state() {
        let mut mirror = PostMirror::new();
        mirror.seed(7, post(10, 2, Vote::None));

        let (id, predicted) = mirror.predict(7, InteractionPatch::vote(Vote::Up));
        assert_eq!(predicted, post(11, 2, Vote::Up));
        assert_eq!(mirror.state(id), Some(ActionState::Predicted));

        // Someone else voted in the meantime.
        let view = mirror.confirm(id, post(12, 2, Vote::Up)).unwrap();
        assert_eq!(view, post(12, 2, Vote::Up));
        assert_eq!(mirror.state(id), Some(ActionState::Confirmed));
        assert_eq!(mirror.confirm(id, post(1, 1, Vote::Up)), Err(MirrorError::AlreadySettled(id)));
    }

    #[test]
    fn reject_restores_the_snapshot() {
        let mut mirror = PostMirror::new();
        mirror.seed(7, post(10, 2, Vote::Down));

        let (id, _) = mirror.predict(7, InteractionPatch::vote(Vote::Up));
        let view = mirror.reject(id).unwrap();

        assert_eq!(view, post(10, 2, Vote::Down));
        assert_eq!(mirror.snapshot(id), Some(view));
        assert_eq!(mirror.state(id), Some(ActionState::RolledBack));
    }

    #[test]
    fn reject_keeps_later_pending_predictions() {
        let mut mirror = PostMirror::new();
        mirror.seed(7, post(10, 2, Vote::None));

        let (first, _) = mirror.predict(7, InteractionPatch::vote(Vote::Up));
        let (_second, _) = mirror.predict(7, InteractionPatch::saved(true));

        let view = mirror.reject(first).unwrap();
        assert_eq!(
            view,
            PostView {
                is_saved: true,
                ..post(10, 2, Vote::None)
            }
        );
        assert_eq!(mirror.pending_count(), 1);
    }

    #[test]
    fn late_response_with_older_revision_does_not_regress_base() {
        let mut mirror = PostMirror::new();
        mirror.seed(7, post(0, 0, Vote::None));

        let (first, _) = mirror.predict(7, InteractionPatch::vote(Vote::Up));
        let (second, _) = mirror.predict(7, InteractionPatch::vote(Vote::Down));

        // Applied in send order, answered in reverse.
        mirror.confirm(second, at(2, 0, 1, Vote::Down)).unwrap();
        let view = mirror.confirm(first, at(1, 1, 0, Vote::Up)).unwrap();
        assert_eq!(view, at(2, 0, 1, Vote::Down));

        mirror.prune();
        assert_eq!(mirror.state(first), None);
        assert_eq!(mirror.tracked_count(), 0);
    }

    #[test]
    fn server_apply_order_wins_over_send_order() {
        let mut mirror = PostMirror::new();
        mirror.seed(7, post(0, 0, Vote::None));

        let (first, _) = mirror.predict(7, InteractionPatch::vote(Vote::Up));
        let (second, _) = mirror.predict(7, InteractionPatch::vote(Vote::Down));

        // The server applied the second request before the first.
        let view = mirror.confirm(second, at(1, 0, 1, Vote::Down)).unwrap();
        assert_eq!(view, at(1, 1, 0, Vote::Up));
        let view = mirror.confirm(first, at(2, 1, 0, Vote::Up)).unwrap();
        assert_eq!(view, at(2, 1, 0, Vote::Up));
        assert_eq!(mirror.pending_count(), 0);
    }

    #[test]
    fn unknown_actions_are_reported() {
        let mut mirror = ProblemMirror::new();
        let id = Uuid::new_v4();
        assert_eq!(mirror.reject(id), Err(MirrorError::UnknownAction(id)));
    }

    #[test]
    fn reconcile_is_pure() {
        let base = ProblemView {
            solved: false,
            revision: 3,
        };
        assert_eq!(reconcile(base, None, &[]), base);

        let newer = ProblemView {
            solved: true,
            revision: 4,
        };
        assert_eq!(
            reconcile(base, Some(newer), &[ProblemIntent::Set(false)]),
            ProblemView {
                solved: false,
                revision: 4
            }
        );

        let older = ProblemView {
            solved: true,
            revision: 2,
        };
        assert_eq!(reconcile(base, Some(older), &[]), base);
    }
}
