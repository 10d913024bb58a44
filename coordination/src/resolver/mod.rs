//! Proposal Evaluator & Conflict Resolver
//!
//! Turns one session's proposals into an accept/reject partition:
//!
//! 1. Proposals under the confidence floor are rejected `BelowThreshold`
//!    and never enter the graph.
//! 2. The survivors form a [`ConflictGraph`] (edge = resource overlap).
//! 3. Each survivor is valued `confidence * weight(resources)`.
//! 4. A greedy pass over value-descending order (ties: earlier creation,
//!    then lower id) accepts a proposal only if it overlaps no accepted one;
//!    otherwise it is rejected `ConflictLoss` naming the winner.
//!
//! The output depends only on the proposal set, never on input order.

pub mod graph;
pub mod policy;

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::state::{AcceptedProposal, Proposal, Rejection, RejectionReason};

pub use graph::ConflictGraph;
pub use policy::{ResourceWeightPolicy, UniformWeight};

/// Resolver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Proposals with confidence strictly below this are rejected up front
    pub confidence_floor: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.7,
        }
    }
}

/// Accepted and rejected proposals for one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// In acceptance order (value descending)
    pub accepted: Vec<AcceptedProposal>,
    /// Threshold rejections first (by id), then conflict losses in rank order
    pub rejected: Vec<Rejection>,
}

/// Deterministic greedy conflict resolver
#[derive(Clone)]
pub struct ConflictResolver {
    config: ResolverConfig,
    policy: Arc<dyn ResourceWeightPolicy>,
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig, policy: Arc<dyn ResourceWeightPolicy>) -> Self {
        Self { config, policy }
    }

    /// Resolver with uniform resource weights
    pub fn with_uniform_weight(config: ResolverConfig) -> Self {
        Self::new(config, Arc::new(UniformWeight))
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Value used for ranking; non-finite or negative weights count as zero
    pub fn value(&self, proposal: &Proposal) -> f64 {
        let weight = self.policy.weight(&proposal.resources);
        let weight = if weight.is_finite() && weight > 0.0 {
            weight
        } else {
            0.0
        };
        proposal.confidence * weight
    }

    /// Partition proposals into accepted and rejected
    ///
    /// Duplicate proposal ids are collapsed to one entry: the record that
    /// sorts first by [`same_id_order`].
    pub fn resolve(&self, proposals: &[Proposal]) -> Resolution {
        let mut unique: Vec<&Proposal> = proposals.iter().collect();
        unique.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| same_id_order(a, b)));
        unique.dedup_by(|dropped, kept| {
            if dropped.id != kept.id {
                return false;
            }
            if dropped != kept {
                warn!(
                    proposal_id = %kept.id,
                    kept_worker = %kept.worker_id,
                    dropped_worker = %dropped.worker_id,
                    "Conflicting proposals share an id, keeping one"
                );
            }
            true
        });

        let floor = self.config.confidence_floor;
        let mut rejected = Vec::new();
        let mut candidates = Vec::with_capacity(unique.len());

        for proposal in unique {
            if proposal.confidence < floor {
                debug!(
                    proposal_id = %proposal.id,
                    confidence = proposal.confidence,
                    floor,
                    "Proposal below confidence floor"
                );
                rejected.push(rejection(
                    proposal,
                    RejectionReason::BelowThreshold {
                        confidence: proposal.confidence,
                        floor,
                    },
                ));
            } else {
                candidates.push((proposal, self.value(proposal)));
            }
        }

        let graph = ConflictGraph::build(candidates.iter().map(|(p, _)| *p));

        candidates.sort_by(|(a, va), (b, vb)| rank(a, *va, b, *vb));

        let mut accepted: Vec<AcceptedProposal> = Vec::new();

        for (proposal, value) in candidates {
            // Earliest accepted neighbour is the highest-ranked winner
            let winner = accepted
                .iter()
                .find(|a| graph.conflicts(&a.proposal_id, &proposal.id))
                .map(|a| a.proposal_id.clone());

            match winner {
                Some(winner) => {
                    debug!(
                        proposal_id = %proposal.id,
                        winner = %winner,
                        "Proposal lost conflict"
                    );
                    rejected.push(rejection(
                        proposal,
                        RejectionReason::ConflictLoss { winner },
                    ));
                }
                None => {
                    accepted.push(AcceptedProposal {
                        proposal_id: proposal.id.clone(),
                        worker_id: proposal.worker_id.clone(),
                        task_id: proposal.task_id.clone(),
                        value,
                    });
                }
            }
        }

        debug!(
            accepted = accepted.len(),
            rejected = rejected.len(),
            conflicts = graph.edge_count(),
            "Proposals resolved"
        );
        Resolution { accepted, rejected }
    }
}

/// Value descending, then earlier creation, then lower id
fn rank(a: &Proposal, va: f64, b: &Proposal, vb: f64) -> Ordering {
    vb.total_cmp(&va)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Total order over the contents of proposals sharing an id
fn same_id_order(a: &Proposal, b: &Proposal) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.worker_id.cmp(&b.worker_id))
        .then_with(|| a.task_id.cmp(&b.task_id))
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.resources.iter().cmp(b.resources.iter()))
        .then_with(|| a.payload.cmp(&b.payload))
        .then_with(|| a.description.cmp(&b.description))
}

fn rejection(proposal: &Proposal, reason: RejectionReason) -> Rejection {
    Rejection {
        proposal_id: proposal.id.clone(),
        worker_id: proposal.worker_id.clone(),
        task_id: proposal.task_id.clone(),
        reason,
    }
}

/// Rejection for a proposal that arrived after its session was decided
pub fn late_rejection(proposal: &Proposal) -> Rejection {
    rejection(proposal, RejectionReason::SessionClosed)
}

/// Find two accepted proposals whose resources overlap, if any
pub fn find_overlap<'a>(
    accepted: &[AcceptedProposal],
    proposals: &'a [Proposal],
) -> Option<(&'a Proposal, &'a Proposal)> {
    let chosen: Vec<&Proposal> = accepted
        .iter()
        .filter_map(|a| proposals.iter().find(|p| p.id == a.proposal_id))
        .collect();
    for (i, a) in chosen.iter().enumerate() {
        for b in &chosen[i + 1..] {
            if a.resources.intersects(&b.resources) {
                return Some((*a, *b));
            }
        }
    }
    None
}
