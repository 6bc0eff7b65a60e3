use serde::Serialize;

use crate::models::{PostTally, Vote};

/// Signed change applied to a post's counters when one user's vote moves
/// from one state to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VoteDelta {
    pub upvotes: i64,
    pub downvotes: i64,
}

impl VoteDelta {
    pub fn between(old: Vote, requested: Vote) -> Self {
        Self {
            upvotes: contribution(requested).upvotes - contribution(old).upvotes,
            downvotes: contribution(requested).downvotes - contribution(old).downvotes,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.upvotes == 0 && self.downvotes == 0
    }

    /// Applies the delta; counters never go below zero.
    pub fn apply(&self, tally: PostTally) -> PostTally {
        PostTally {
            upvotes: (tally.upvotes + self.upvotes).max(0),
            downvotes: (tally.downvotes + self.downvotes).max(0),
        }
    }
}

/// What a single vote contributes to the aggregate.
pub fn contribution(vote: Vote) -> PostTally {
    match vote {
        Vote::Up => PostTally {
            upvotes: 1,
            downvotes: 0,
        },
        Vote::Down => PostTally {
            upvotes: 0,
            downvotes: 1,
        },
        Vote::None => PostTally::default(),
    }
}

/// Rebuilds a tally from the current vote of every interaction row.
pub fn tally_from_votes<I>(votes: I) -> PostTally
where
    I: IntoIterator<Item = Vote>,
{
    votes
        .into_iter()
        .map(contribution)
        .fold(PostTally::default(), |acc, c| PostTally {
            upvotes: acc.upvotes + c.upvotes,
            downvotes: acc.downvotes + c.downvotes,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Vote; 3] = [Vote::Up, Vote::Down, Vote::None];

    #[test]
    fn same_state_is_a_no_op() {
        for vote in ALL {
            assert!(VoteDelta::between(vote, vote).is_zero());
        }
    }

    #[test]
    fn switching_sides_moves_both_counters_at_once() {
        let delta = VoteDelta::between(Vote::Up, Vote::Down);
        assert_eq!(
            delta,
            VoteDelta {
                upvotes: -1,
                downvotes: 1
            }
        );

        let tally = PostTally {
            upvotes: 11,
            downvotes: 2,
        };
        assert_eq!(
            delta.apply(tally),
            PostTally {
                upvotes: 10,
                downvotes: 3
            }
        );
    }

    #[test]
    fn any_sequence_leaves_only_the_last_vote() {
        let base = PostTally {
            upvotes: 10,
            downvotes: 2,
        };
        let sequences: [&[Vote]; 4] = [
            &[Vote::Up, Vote::Up, Vote::Down],
            &[Vote::Down, Vote::None, Vote::Up, Vote::Up],
            &[Vote::None, Vote::None],
            &[Vote::Up, Vote::Down, Vote::Up, Vote::None, Vote::Down],
        ];

        for sequence in sequences {
            let mut tally = base;
            let mut current = Vote::None;
            for &requested in sequence {
                tally = VoteDelta::between(current, requested).apply(tally);
                current = requested;
            }
            let expected = contribution(current);
            assert_eq!(tally.upvotes - base.upvotes, expected.upvotes);
            assert_eq!(tally.downvotes - base.downvotes, expected.downvotes);
        }
    }

    #[test]
    fn apply_clamps_at_zero() {
        let delta = VoteDelta::between(Vote::Up, Vote::None);
        assert_eq!(delta.apply(PostTally::default()), PostTally::default());
    }

    #[test]
    fn tally_is_reconstructable_from_votes() {
        let tally = tally_from_votes([Vote::Up, Vote::Up, Vote::Down, Vote::None]);
        assert_eq!(
            tally,
            PostTally {
                upvotes: 2,
                downvotes: 1
            }
        );
    }
}
