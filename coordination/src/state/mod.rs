//! Durable state for session coordination
//!
//! This module defines the persisted records and the persistence gateway:
//! - Sessions with their tasks, transition log and post-close outcome log
//! - Workers and their lineage
//! - Proposals and the Decision Record produced for each session
//! - Per-worker Outcomes consumed by the evolution engine
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local maps, used by tests and simulation
//! - `RocksStore` (feature `heavy-state`): RocksDB column families with
//!   bincode-encoded values
//!
//! # Usage
//!
//! ```ignore
//! use cycle_coordination::state::{MemoryStore, Persistence, Session, TaskSpec, Capability};
//!
//! let store = MemoryStore::new();
//! let session = Session::new(&[TaskSpec::new(Capability::Code, "src/lib.rs")]);
//! store.save_session(&session).await?;
//! ```

pub mod memory;
#[cfg(feature = "heavy-state")]
pub mod rocks;
#[cfg(feature = "heavy-state")]
pub mod schema;
pub mod store;
pub mod types;

pub use memory::MemoryStore;
#[cfg(feature = "heavy-state")]
pub use rocks::{RocksStore, SharedRocksStore};
pub use store::{Persistence, SharedPersistence, StoreError, StoreResult};
pub use types::{
    new_id, AcceptedProposal, Capability, DecisionRecord, EvolutionBatch, EvolutionRecord,
    LineageRecord, Outcome, Proposal, ProposalId, Rejection, RejectionReason, ResourceId,
    ResourceSet, Retirement, Session, SessionId, SessionLogEntry, SessionStatus, Task, TaskId,
    TaskSpec, TaskStatus, TransitionRecord, Worker, WorkerId, WorkerStatus,
};
