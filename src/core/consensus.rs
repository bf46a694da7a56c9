//! Majority-of-K smoothing of per-window labels.
//!
//! A single classification is noisy, so a label is only accepted once two of
//! the last K candidates agree. When all K disagree the two oldest candidates
//! are discarded and voting continues with the rest.

use serde::{Deserialize, Serialize};

/// Outcome of submitting a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision<L> {
    /// Fewer than K candidates so far.
    Pending,
    /// Two candidates matched; the set has been reset.
    Accepted(L),
    /// All K candidates differed; the oldest ones were dropped.
    Rejected,
}

/// Collects candidate labels and decides by majority vote.
#[derive(Debug, Clone)]
pub struct ConsensusSmoother<L> {
    votes_required: usize,
    candidates: Vec<L>,
}

impl<L: Clone + PartialEq> ConsensusSmoother<L> {
    /// Create a smoother deciding over `votes_required` candidates (K ≥ 2).
    pub fn new(votes_required: usize) -> Self {
        let votes_required = votes_required.max(2);
        Self {
            votes_required,
            candidates: Vec::with_capacity(votes_required),
        }
    }

    /// Add one candidate and decide once K are present.
    pub fn submit(&mut self, label: L) -> Decision<L> {
        self.candidates.push(label);
        if self.candidates.len() < self.votes_required {
            return Decision::Pending;
        }

        if let Some(label) = self.first_matching_pair() {
            self.candidates.clear();
            return Decision::Accepted(label);
        }

        // Keep at least the most recent candidate.
        let dropped = 2.min(self.votes_required - 1);
        self.candidates.drain(..dropped);
        Decision::Rejected
    }

    /// Label of the first equal pair in index order (0,1), (0,2), (1,2), …
    fn first_matching_pair(&self) -> Option<L> {
        let n = self.candidates.len();
        (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .find(|&(i, j)| self.candidates[i] == self.candidates[j])
            .map(|(i, _)| self.candidates[i].clone())
    }

    /// Candidates waiting for a decision, oldest first.
    pub fn candidates(&self) -> &[L] {
        &self.candidates
    }

    pub fn votes_required(&self) -> usize {
        self.votes_required
    }

    /// Forget all candidates.
    pub fn reset(&mut self) {
        self.candidates.clear();
    }
}
