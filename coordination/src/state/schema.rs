//! Column family definitions for the RocksDB backend
//!
//! Each column family provides logical separation of record kinds
//! while sharing the same RocksDB instance.

/// Column family for sessions
pub const CF_SESSIONS: &str = "sessions";

/// Column family for worker records
pub const CF_WORKERS: &str = "workers";

/// Column family for proposals, keyed by session then proposal
pub const CF_PROPOSALS: &str = "proposals";

/// Proposal id to session id index
pub const CF_PROPOSAL_INDEX: &str = "proposal_index";

/// Column family for decision records
pub const CF_DECISIONS: &str = "decisions";

/// Column family for per-worker session outcomes
pub const CF_OUTCOMES: &str = "outcomes";

/// Column family for worker lineage
pub const CF_LINEAGE: &str = "lineage";

/// Column family for evolution pass records
pub const CF_EVOLUTIONS: &str = "evolutions";

/// All column family names
pub const ALL_CFS: &[&str] = &[
    CF_SESSIONS,
    CF_WORKERS,
    CF_PROPOSALS,
    CF_PROPOSAL_INDEX,
    CF_DECISIONS,
    CF_OUTCOMES,
    CF_LINEAGE,
    CF_EVOLUTIONS,
];

/// Key prefixes for compound keys
pub mod keys {
    pub fn session(session_id: &str) -> String {
        format!("sess:{}", session_id)
    }

    pub fn worker(worker_id: &str) -> String {
        format!("worker:{}", worker_id)
    }

    /// Proposal key, grouped by session for prefix scans
    pub fn proposal(session_id: &str, proposal_id: &str) -> String {
        format!("prop:{}:{}", session_id, proposal_id)
    }

    pub fn proposal_prefix(session_id: &str) -> String {
        format!("prop:{}:", session_id)
    }

    pub fn proposal_index(proposal_id: &str) -> String {
        format!("pidx:{}", proposal_id)
    }

    pub fn decision(session_id: &str) -> String {
        format!("dec:{}", session_id)
    }

    /// Outcome key (session + worker)
    pub fn outcome(session_id: &str, worker_id: &str) -> String {
        format!("out:{}:{}", session_id, worker_id)
    }

    pub fn outcome_prefix(session_id: &str) -> String {
        format!("out:{}:", session_id)
    }

    pub fn lineage(worker_id: &str) -> String {
        format!("lin:{}", worker_id)
    }

    /// Evolution key, zero-padded so passes sort in order
    pub fn evolution(pass: u64, record_id: &str) -> String {
        format!("evo:{:020}:{}", pass, record_id)
    }
}
