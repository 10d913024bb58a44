//! Per-worker performance statistics
//!
//! Each session outcome scores `accepted / submitted`. Sessions where the
//! worker submitted nothing, or where an accepted change failed to apply,
//! score the configured minimum. The rolling score is a recency-weighted
//! mean over the last `window` outcomes: the newest weighs `window`, the
//! oldest weighs 1.

use serde::{Deserialize, Serialize};

use crate::state::{Capability, Outcome, Worker, WorkerId};

/// Score of a single session outcome
pub fn outcome_score(outcome: &Outcome, min_score: f64) -> f64 {
    if outcome.success_signal == Some(false) {
        return min_score;
    }
    match outcome.acceptance_ratio() {
        Some(ratio) => ratio.max(min_score),
        None => min_score,
    }
}

/// Recency-weighted mean over the last `window` outcomes (oldest first)
///
/// Returns `None` when there is nothing to score.
pub fn rolling_score(outcomes: &[Outcome], window: usize, min_score: f64) -> Option<f64> {
    let window = window.max(1);
    let recent = &outcomes[outcomes.len().saturating_sub(window)..];
    if recent.is_empty() {
        return None;
    }

    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for (i, outcome) in recent.iter().enumerate() {
        let weight = (i + 1) as f64;
        weighted += weight * outcome_score(outcome, min_score);
        total_weight += weight;
    }
    Some(weighted / total_weight)
}

/// What the evolution policy sees about one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    pub capability: Capability,
    pub generation: u32,
    /// Sessions with a recorded outcome, all time
    pub sessions_observed: usize,
    /// Totals inside the scoring window
    pub submitted: u32,
    pub accepted: u32,
    pub successes: u32,
    pub failures: u32,
    /// Current rolling score; the stored score when there is no history
    pub rolling_score: f64,
    /// Rolling score as it stood after each of the last `window` sessions,
    /// oldest first
    pub score_history: Vec<f64>,
}

impl WorkerStats {
    /// Build stats from a worker's outcomes, oldest first
    pub fn from_outcomes(worker: &Worker, outcomes: &[Outcome], window: usize, min_score: f64) -> Self {
        let window = window.max(1);
        let recent = &outcomes[outcomes.len().saturating_sub(window)..];

        let score_history = (outcomes.len().saturating_sub(window) + 1..=outcomes.len())
            .filter_map(|end| rolling_score(&outcomes[..end], window, min_score))
            .collect();

        Self {
            worker_id: worker.id.clone(),
            capability: worker.capability,
            generation: worker.generation,
            sessions_observed: outcomes.len(),
            submitted: recent.iter().map(|o| o.submitted).sum(),
            accepted: recent.iter().map(|o| o.accepted).sum(),
            successes: recent
                .iter()
                .filter(|o| o.success_signal == Some(true))
                .count() as u32,
            failures: recent
                .iter()
                .filter(|o| o.success_signal == Some(false))
                .count() as u32,
            rolling_score: rolling_score(outcomes, window, min_score).unwrap_or(worker.score),
            score_history,
        }
    }

    /// How many of the most recent sessions ended with the score below `threshold`
    pub fn sessions_below(&self, threshold: f64) -> usize {
        self.score_history
            .iter()
            .rev()
            .take_while(|score| **score < threshold)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(submitted: u32, accepted: u32) -> Outcome {
        Outcome::new("w".into(), "s".into(), submitted, accepted)
    }

    #[test]
    fn test_outcome_score() {
        assert_eq!(outcome_score(&outcome(4, 3), 0.0), 0.75);
        assert_eq!(outcome_score(&outcome(0, 0), 0.1), 0.1);

        let mut failed = outcome(1, 1);
        failed.success_signal = Some(false);
        assert_eq!(outcome_score(&failed, 0.05), 0.05);
    }

    #[test]
    fn test_rolling_score_weights_recent_sessions() {
        // Old success, recent failure
        let declining = vec![outcome(1, 1), outcome(1, 0)];
        // Old failure, recent success
        let improving = vec![outcome(1, 0), outcome(1, 1)];

        let down = rolling_score(&declining, 5, 0.0).unwrap();
        let up = rolling_score(&improving, 5, 0.0).unwrap();
        assert!((down - 1.0 / 3.0).abs() < 1e-9);
        assert!((up - 2.0 / 3.0).abs() < 1e-9);
        assert!(rolling_score(&[], 5, 0.0).is_none());
    }

    #[test]
    fn test_window_drops_old_outcomes() {
        let mut outcomes = vec![outcome(1, 0); 3];
        outcomes.extend(vec![outcome(1, 1); 2]);
        assert_eq!(rolling_score(&outcomes, 2, 0.0), Some(1.0));
    }

    #[test]
    fn test_inactive_worker_scores_minimum() {
        let worker = Worker::new(Capability::Doc);
        let idle = vec![outcome(0, 0); 3];
        let stats = WorkerStats::from_outcomes(&worker, &idle, 3, 0.0);

        assert_eq!(stats.rolling_score, 0.0);
        assert_eq!(stats.sessions_below(0.3), 3);
    }

    #[test]
    fn test_new_worker_keeps_stored_score() {
        let worker = Worker::new(Capability::Code);
        let stats = WorkerStats::from_outcomes(&worker, &[], 5, 0.0);
        assert_eq!(stats.rolling_score, 1.0);
        assert!(stats.score_history.is_empty());
        assert_eq!(stats.sessions_below(0.3), 0);
    }

    #[test]
    fn test_sessions_below_counts_trailing_run() {
        let worker = Worker::new(Capability::Code);
        let outcomes = vec![outcome(1, 1), outcome(1, 1), outcome(2, 0), outcome(2, 0), outcome(2, 0)];
        let stats = WorkerStats::from_outcomes(&worker, &outcomes, 2, 0.0);

        // Window of 2: scores after each of the last two sessions are 0.0
        assert_eq!(stats.score_history.len(), 2);
        assert_eq!(stats.sessions_below(0.3), 2);
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.sessions_observed, 5);
    }
}
