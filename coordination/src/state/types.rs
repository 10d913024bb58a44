//! Core records for session coordination
//!
//! These types are persisted through the [`Persistence`](super::Persistence)
//! gateway and represent the durable state of improvement cycles: sessions,
//! workers, proposals, decisions, outcomes and evolution history.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for sessions
pub type SessionId = String;

/// Unique identifier for workers
pub type WorkerId = String;

/// Unique identifier for tasks within a session
pub type TaskId = String;

/// Unique identifier for proposals
pub type ProposalId = String;

/// Opaque identifier of a file, section or config key a proposal touches
pub type ResourceId = String;

/// Allocate a fresh random identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// Workers
// =============================================================================

/// Closed set of worker specialisations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Code,
    Test,
    Doc,
    Prompt,
    Config,
}

impl Capability {
    /// All capabilities in declaration order
    pub fn all() -> &'static [Capability] {
        &[
            Capability::Code,
            Capability::Test,
            Capability::Doc,
            Capability::Prompt,
            Capability::Config,
        ]
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Code => write!(f, "code"),
            Capability::Test => write!(f, "test"),
            Capability::Doc => write!(f, "doc"),
            Capability::Prompt => write!(f, "prompt"),
            Capability::Config => write!(f, "config"),
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "code" => Ok(Capability::Code),
            "test" => Ok(Capability::Test),
            "doc" | "documentation" => Ok(Capability::Doc),
            "prompt" => Ok(Capability::Prompt),
            "config" => Ok(Capability::Config),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Eligible for new task assignments
    Active,
    /// Finishing in-flight work, excluded from assignment
    Retiring,
    /// Retained for audit, never reactivated
    Archived,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Active => write!(f, "active"),
            WorkerStatus::Retiring => write!(f, "retiring"),
            WorkerStatus::Archived => write!(f, "archived"),
        }
    }
}

/// A worker in the managed population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique worker identifier
    pub id: WorkerId,

    /// Specialisation used for task matching
    pub capability: Capability,

    /// Lifecycle status
    pub status: WorkerStatus,

    /// Rolling performance score in [0, 1]
    pub score: f64,

    /// Generation number, incremented for every spawned replacement
    pub generation: u32,

    /// Worker this one was spawned to replace, if any
    pub parent_id: Option<WorkerId>,

    /// Opaque configuration supplied by the evolution policy
    #[serde(default)]
    pub traits: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,

    /// Set once the worker leaves `Active`
    pub retired_at: Option<DateTime<Utc>>,

    /// Why the worker was retired
    pub retirement_reason: Option<String>,
}

impl Worker {
    /// Create a first-generation active worker
    pub fn new(capability: Capability) -> Self {
        Self {
            id: new_id(),
            capability,
            status: WorkerStatus::Active,
            score: 1.0,
            generation: 0,
            parent_id: None,
            traits: BTreeMap::new(),
            created_at: Utc::now(),
            retired_at: None,
            retirement_reason: None,
        }
    }

    /// Use a caller-chosen identifier
    pub fn with_id(mut self, id: impl Into<WorkerId>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach policy-provided configuration
    pub fn with_traits(mut self, traits: BTreeMap<String, String>) -> Self {
        self.traits = traits;
        self
    }

    /// Create the successor of `parent`, one generation later
    pub fn descendant_of(parent: &Worker, capability: Capability) -> Self {
        let mut worker = Self::new(capability);
        worker.generation = parent.generation + 1;
        worker.parent_id = Some(parent.id.clone());
        worker
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkerStatus::Active
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// What a session asks for: one capability applied to one scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub capability: Capability,
    /// Target resource path or scope description
    pub scope: String,
}

impl TaskSpec {
    pub fn new(capability: Capability, scope: impl Into<String>) -> Self {
        Self {
            capability,
            scope: scope.into(),
        }
    }
}

/// Status of a task within its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet dispatched
    Pending,
    /// Sent to a worker, awaiting a proposal
    Dispatched,
    /// A proposal was received
    Fulfilled,
    /// The shared deadline lapsed first
    TimedOut,
    /// Withdrawn because the session was aborted
    Cancelled,
    /// No eligible worker could take it
    Unassigned,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Dispatched)
    }
}

/// A unit of work dispatched to one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    pub capability: Capability,
    pub scope: String,
    pub assigned_worker: Option<WorkerId>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(session_id: SessionId, spec: &TaskSpec) -> Self {
        Self {
            id: new_id(),
            session_id,
            capability: spec.capability,
            scope: spec.scope.clone(),
            assigned_worker: None,
            assigned_at: None,
            deadline: None,
            status: TaskStatus::Pending,
        }
    }
}

// =============================================================================
// Proposals
// =============================================================================

/// The set of resources a proposal would modify
///
/// Only used for overlap computation. Ordered so that serialized records and
/// iteration are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSet(BTreeSet<ResourceId>);

impl ResourceSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, resource: impl Into<ResourceId>) -> bool {
        self.0.insert(resource.into())
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.0.contains(resource)
    }

    /// Whether any resource appears in both sets
    pub fn intersects(&self, other: &ResourceSet) -> bool {
        let (small, large) = if self.0.len() <= other.0.len() {
            (&self.0, &other.0)
        } else {
            (&other.0, &self.0)
        };
        small.iter().any(|r| large.contains(r))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<ResourceId>> FromIterator<S> for ResourceSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A candidate change produced by a worker for one task
///
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub worker_id: WorkerId,
    pub session_id: SessionId,
    pub task_id: TaskId,

    /// Resources this proposal would modify
    pub resources: ResourceSet,

    /// Opaque diff-applicable content
    pub payload: Vec<u8>,

    /// Self-reported confidence in [0, 1]
    pub confidence: f64,

    pub created_at: DateTime<Utc>,

    /// Free-form summary and reasoning from the worker
    #[serde(default)]
    pub description: String,
}

impl Proposal {
    /// Create a proposal; confidence is clamped to [0, 1]
    pub fn new(
        worker_id: impl Into<WorkerId>,
        session_id: impl Into<SessionId>,
        task_id: impl Into<TaskId>,
        resources: ResourceSet,
        payload: Vec<u8>,
        confidence: f64,
    ) -> Self {
        Self {
            id: new_id(),
            worker_id: worker_id.into(),
            session_id: session_id.into(),
            task_id: task_id.into(),
            resources,
            payload,
            confidence: clamp_unit(confidence),
            created_at: Utc::now(),
            description: String::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<ProposalId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// Why a proposal was not accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Overlapped a higher-valued accepted proposal
    ConflictLoss { winner: ProposalId },
    /// Confidence fell under the configured floor
    BelowThreshold { confidence: f64, floor: f64 },
    /// Arrived after the session was decided or aborted
    SessionClosed,
}

impl RejectionReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectionReason::ConflictLoss { .. } => "conflict_loss",
            RejectionReason::BelowThreshold { .. } => "below_threshold",
            RejectionReason::SessionClosed => "session_closed",
        }
    }
}

/// A rejected proposal with its reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub proposal_id: ProposalId,
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    pub reason: RejectionReason,
}

/// An accepted proposal with the value it was ranked by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedProposal {
    pub proposal_id: ProposalId,
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    pub value: f64,
}

/// The resolved accept/reject partition for one session
///
/// Produced exactly once per session and never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub session_id: SessionId,
    pub accepted: Vec<AcceptedProposal>,
    pub rejected: Vec<Rejection>,
    /// Tasks whose worker missed the shared deadline
    pub timed_out: Vec<TaskId>,
    /// Tasks no eligible worker could take
    pub unassigned: Vec<TaskId>,
    /// When set, the accepted set is advisory and must not be applied
    pub dry_run: bool,
    pub decided_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn is_accepted(&self, proposal_id: &str) -> bool {
        self.accepted.iter().any(|a| a.proposal_id == proposal_id)
    }

    pub fn rejection_for(&self, proposal_id: &str) -> Option<&Rejection> {
        self.rejected.iter().find(|r| r.proposal_id == proposal_id)
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Assigning,
    Collecting,
    Resolving,
    Closed,
    Aborted,
}

impl SessionStatus {
    /// Whether no further transitions are allowed
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Aborted)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Created => write!(f, "Created"),
            SessionStatus::Assigning => write!(f, "Assigning"),
            SessionStatus::Collecting => write!(f, "Collecting"),
            SessionStatus::Resolving => write!(f, "Resolving"),
            SessionStatus::Closed => write!(f, "Closed"),
            SessionStatus::Aborted => write!(f, "Aborted"),
        }
    }
}

/// A single recorded session state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub at: DateTime<Utc>,
    /// Milliseconds since the session was created
    pub elapsed_ms: u64,
    pub reason: Option<String>,
}

/// Append-only entries recorded against a session after it was decided
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLogEntry {
    /// A proposal arrived after the session closed
    LateProposalRejected {
        proposal_id: ProposalId,
        worker_id: WorkerId,
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    /// An accepted proposal was applied and reported back
    SuccessSignal {
        proposal_id: ProposalId,
        success: bool,
        at: DateTime<Utc>,
    },
}

/// One improvement cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,

    /// Tasks in creation order
    pub tasks: Vec<Task>,

    /// Shared collection deadline, set when tasks are dispatched
    pub deadline: Option<DateTime<Utc>>,

    /// Present once the session is `Closed`
    pub decision: Option<DecisionRecord>,

    pub transitions: Vec<TransitionRecord>,

    /// Outcome log appended after close
    pub log: Vec<SessionLogEntry>,

    pub closed_at: Option<DateTime<Utc>>,

    pub abort_reason: Option<String>,
}

impl Session {
    /// Create a session with one pending task per spec
    pub fn new(specs: &[TaskSpec]) -> Self {
        let id = new_id();
        let tasks = specs.iter().map(|s| Task::new(id.clone(), s)).collect();
        Self {
            id,
            created_at: Utc::now(),
            status: SessionStatus::Created,
            tasks,
            deadline: None,
            decision: None,
            transitions: Vec::new(),
            log: Vec::new(),
            closed_at: None,
            abort_reason: None,
        }
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }
}

// =============================================================================
// Outcomes and evolution history
// =============================================================================

/// Per-worker, per-session performance record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub worker_id: WorkerId,
    pub session_id: SessionId,
    pub submitted: u32,
    pub accepted: u32,
    /// Post-hoc application result, when reported
    pub success_signal: Option<bool>,
    pub recorded_at: DateTime<Utc>,
}

impl Outcome {
    pub fn new(worker_id: WorkerId, session_id: SessionId, submitted: u32, accepted: u32) -> Self {
        Self {
            worker_id,
            session_id,
            submitted,
            accepted,
            success_signal: None,
            recorded_at: Utc::now(),
        }
    }

    /// Acceptance ratio, `None` when nothing was submitted
    pub fn acceptance_ratio(&self) -> Option<f64> {
        if self.submitted == 0 {
            None
        } else {
            Some(f64::from(self.accepted) / f64::from(self.submitted))
        }
    }
}

/// Traceability link from a spawned worker to the one it replaced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub worker_id: WorkerId,
    pub parent_id: Option<WorkerId>,
    pub capability: Capability,
    pub generation: u32,
    pub created_at: DateTime<Utc>,
}

impl LineageRecord {
    pub fn for_worker(worker: &Worker) -> Self {
        Self {
            worker_id: worker.id.clone(),
            parent_id: worker.parent_id.clone(),
            capability: worker.capability,
            generation: worker.generation,
            created_at: worker.created_at,
        }
    }
}

/// A retirement decided by an evolution pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retirement {
    pub worker_id: WorkerId,
    pub reason: String,
    pub final_score: f64,
}

/// Audit record of one evolution pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionRecord {
    pub id: String,
    pub pass: u64,
    pub retirements: Vec<Retirement>,
    pub spawned: Vec<LineageRecord>,
    pub score_updates: BTreeMap<WorkerId, f64>,
    pub created_at: DateTime<Utc>,
}

/// Everything one evolution pass writes, committed as a single transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionBatch {
    pub record: EvolutionRecord,
    /// Updated and newly created worker records
    pub workers: Vec<Worker>,
}

impl EvolutionBatch {
    pub fn is_empty(&self) -> bool {
        self.record.retirements.is_empty()
            && self.record.spawned.is_empty()
            && self.record.score_updates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_set_intersection() {
        let a: ResourceSet = ["src/a.py", "src/b.py"].into_iter().collect();
        let b: ResourceSet = ["src/b.py"].into_iter().collect();
        let c: ResourceSet = ["docs/readme.md"].into_iter().collect();

        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
        assert!(!ResourceSet::new().intersects(&a));
    }

    #[test]
    fn test_proposal_confidence_clamped() {
        let high = Proposal::new("w", "s", "t", ResourceSet::new(), vec![], 1.7);
        let low = Proposal::new("w", "s", "t", ResourceSet::new(), vec![], -0.2);
        let nan = Proposal::new("w", "s", "t", ResourceSet::new(), vec![], f64::NAN);

        assert_eq!(high.confidence, 1.0);
        assert_eq!(low.confidence, 0.0);
        assert_eq!(nan.confidence, 0.0);
    }

    #[test]
    fn test_descendant_increments_generation() {
        let parent = Worker::new(Capability::Code);
        let child = Worker::descendant_of(&parent, Capability::Code);

        assert_eq!(child.generation, parent.generation + 1);
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert!(child.is_active());
        assert_ne!(child.id, parent.id);
    }

    #[test]
    fn test_capability_parse_and_display() {
        for cap in Capability::all() {
            let parsed: Capability = cap.to_string().parse().unwrap();
            assert_eq!(parsed, *cap);
        }
        assert_eq!("documentation".parse::<Capability>(), Ok(Capability::Doc));
        assert!("painting".parse::<Capability>().is_err());
    }

    #[test]
    fn test_session_tasks_follow_specs() {
        let specs = vec![
            TaskSpec::new(Capability::Code, "src/lib.rs"),
            TaskSpec::new(Capability::Test, "tests/"),
        ];
        let session = Session::new(&specs);

        assert_eq!(session.status, SessionStatus::Created);
        assert_eq!(session.tasks.len(), 2);
        assert!(session.tasks.iter().all(|t| t.session_id == session.id));
        assert_eq!(session.tasks[1].capability, Capability::Test);
        assert_eq!(session.tasks_with_status(TaskStatus::Pending).len(), 2);
    }

    #[test]
    fn test_outcome_acceptance_ratio() {
        let idle = Outcome::new("w".into(), "s".into(), 0, 0);
        let busy = Outcome::new("w".into(), "s".into(), 4, 1);

        assert_eq!(idle.acceptance_ratio(), None);
        assert_eq!(busy.acceptance_ratio(), Some(0.25));
    }

    #[test]
    fn test_serde_tags() {
        let reason = RejectionReason::ConflictLoss {
            winner: "p-1".into(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["conflict_loss"]["winner"], "p-1");

        let status = serde_json::to_string(&SessionStatus::Resolving).unwrap();
        assert_eq!(status, "\"resolving\"");
    }
}
