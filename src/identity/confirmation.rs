// src/identity/confirmation.rs
//
// When does a registry match become the track's identity? Either on the
// first match, or after N matches by majority. Fresh registrations are
// never subject to a vote: the id only exists for this track.

use super::IdentityId;
use crate::types::ConfirmationConfig;

pub trait ConfirmationPolicy: Send + Sync {
    /// Record one matched candidate in the track's ballot. Returns the id
    /// to commit once the policy is satisfied; the ballot is then cleared.
    fn confirm(&self, ballot: &mut Vec<IdentityId>, candidate: IdentityId) -> Option<IdentityId>;

    fn name(&self) -> &'static str;
}

pub fn policy_from_config(config: &ConfirmationConfig) -> Box<dyn ConfirmationPolicy> {
    match config {
        ConfirmationConfig::Immediate => Box::new(ImmediateCommit),
        ConfirmationConfig::MajorityVote { votes } => Box::new(MajorityVote::new(*votes)),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateCommit;

impl ConfirmationPolicy for ImmediateCommit {
    fn confirm(&self, ballot: &mut Vec<IdentityId>, candidate: IdentityId) -> Option<IdentityId> {
        ballot.clear();
        Some(candidate)
    }

    fn name(&self) -> &'static str {
        "immediate"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MajorityVote {
    votes: usize,
}

impl MajorityVote {
    pub fn new(votes: usize) -> Self {
        Self {
            votes: votes.max(1),
        }
    }
}

impl ConfirmationPolicy for MajorityVote {
    fn confirm(&self, ballot: &mut Vec<IdentityId>, candidate: IdentityId) -> Option<IdentityId> {
        ballot.push(candidate);
        if ballot.len() < self.votes {
            return None;
        }

        // Most frequent; earliest first vote wins a tie.
        let mut tally: Vec<(&IdentityId, usize)> = Vec::new();
        for id in ballot.iter() {
            match tally.iter_mut().find(|(seen, _)| *seen == id) {
                Some((_, count)) => *count += 1,
                None => tally.push((id, 1)),
            }
        }
        let mut winner: Option<(&IdentityId, usize)> = None;
        for (id, count) in tally {
            if winner.map_or(true, |(_, best)| count > best) {
                winner = Some((id, count));
            }
        }
        let committed = winner.map(|(id, _)| id.clone());
        ballot.clear();
        committed
    }

    fn name(&self) -> &'static str {
        "majority_vote"
    }
}
