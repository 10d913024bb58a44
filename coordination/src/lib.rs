//! Cycle Coordination Library
//!
//! The orchestration core for a swarm of improvement workers. Each cycle
//! is one session: the coordinator hands tasks to workers, gathers their
//! proposals under a shared deadline, keeps a maximal non-conflicting set,
//! and records the decision. Between sessions the evolution engine retires
//! persistently poor workers and spawns their replacements.
//!
//! # Components
//!
//! - [`session`]: session lifecycle, assignment, collection and resolution
//! - [`channel`]: bounded per-worker inboxes with at-least-once delivery
//! - [`registry`]: the live worker population and task reservations
//! - [`resolver`]: confidence floor and conflict-graph resolution
//! - [`evolution`]: scoring, retirement and replacement of workers
//! - [`state`]: persisted records and the persistence gateway
//! - [`events`]: broadcast notifications for observers and the scheduler
//!
//! # Usage
//!
//! ```bash
//! # Run ten scripted cycles with three workers per capability
//! cycle-coordination simulate --sessions 10 --workers-per-capability 3
//!
//! # Same, with a config file and RocksDB-backed state
//! cycle-coordination --config coordinator.toml simulate --sessions 10
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod channel;
pub mod config;
pub mod events;
pub mod evolution;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod state;
pub mod telemetry;

pub use channel::{
    ChannelConfig, ChannelError, Envelope, MessageChannel, SharedMessageChannel,
    SubmissionReceiver, TaskAssignment, WorkerHandle, WorkerMessage,
};
pub use config::{ConfigError, CoordinatorConfig, PersistenceConfig, StorageBackend};
pub use events::{CoordinationEvent, EventBus, EventFilter, SharedEventBus};
pub use evolution::{
    EvolutionConfig, EvolutionEngine, EvolutionError, EvolutionPolicy, EvolutionReport,
    EvolutionScheduler, ThresholdEvolutionPolicy, WorkerSpec, WorkerStats,
};
pub use registry::{RegistryError, WorkerRegistry};
pub use resolver::{ConflictResolver, Resolution, ResolverConfig, ResourceWeightPolicy};
pub use retry::{with_retry, RetryPolicy};
pub use session::{
    AbortHandle, ActiveSession, CoordinatorError, CoordinatorMetrics, CoordinatorResult,
    SessionConfig, SessionCoordinator,
};
pub use state::{
    Capability, DecisionRecord, MemoryStore, Outcome, Persistence, Proposal, Rejection,
    RejectionReason, ResourceSet, Session, SessionStatus, SharedPersistence, StoreError, TaskSpec,
    TaskStatus, Worker, WorkerStatus,
};
