//! Deterministic ranking of screened proposals.

use std::cmp::Ordering;

use super::proposal::Proposal;
use crate::plugin::{PluginId, PluginIdentity};

/// A proposal that survived screening.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Registry id; lower ids registered first.
    pub id: PluginId,
    /// Proposing plugin.
    pub plugin: PluginIdentity,
    /// Screened proposal.
    pub proposal: Proposal,
}

/// Orders candidates best first: priority descending, then confidence descending,
/// then registration order.
#[must_use]
pub fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.proposal
        .priority
        .cmp(&a.proposal.priority)
        .then_with(|| b.proposal.confidence.total_cmp(&a.proposal.confidence))
        .then_with(|| a.id.cmp(&b.id))
}

/// Splits candidates into the winner and the outranked rest.
#[must_use]
pub fn select_winner(mut candidates: Vec<Candidate>) -> Option<(Candidate, Vec<Candidate>)> {
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(rank);
    let winner = candidates.remove(0);
    Some((winner, candidates))
}
