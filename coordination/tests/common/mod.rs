//! Shared fixtures for the coordination integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cycle_coordination::channel::{MessageChannel, SharedMessageChannel, WorkerHandle, WorkerMessage};
use cycle_coordination::config::CoordinatorConfig;
use cycle_coordination::events::{EventBus, SharedEventBus};
use cycle_coordination::registry::WorkerRegistry;
use cycle_coordination::session::SessionCoordinator;
use cycle_coordination::state::{
    Capability, DecisionRecord, EvolutionBatch, EvolutionRecord, LineageRecord, MemoryStore,
    Outcome, Persistence, Proposal, ResourceSet, Session, SessionStatus, SharedPersistence, StoreError,
    StoreResult, TaskSpec, Worker,
};

pub struct Harness {
    pub coordinator: SessionCoordinator,
    pub registry: Arc<WorkerRegistry>,
    pub channel: SharedMessageChannel,
    pub events: SharedEventBus,
    pub store: SharedPersistence,
}

impl Harness {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: CoordinatorConfig, store: SharedPersistence) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let (channel, submissions) = MessageChannel::new(config.channel.clone());
        let channel = channel.shared();
        let events = EventBus::new().shared();
        let coordinator = SessionCoordinator::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&channel),
            submissions,
            Arc::clone(&store),
            Arc::clone(&events),
        );
        Self {
            coordinator,
            registry,
            channel,
            events,
            store,
        }
    }

    pub async fn enroll(&self, id: &str, capability: Capability) -> WorkerHandle {
        self.coordinator
            .enroll_worker(Worker::new(capability).with_id(id))
            .await
            .unwrap()
    }
}

pub fn config_with_deadline(ms: u64) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.session.task_deadline_ms = ms;
    config
}

pub fn resources(names: &[&str]) -> ResourceSet {
    names.iter().copied().collect()
}

pub fn tasks(capability: Capability, n: usize) -> Vec<TaskSpec> {
    (0..n)
        .map(|i| TaskSpec::new(capability, format!("src/{capability}/{i}.rs")))
        .collect()
}

/// Scripted worker behavior
#[derive(Clone)]
pub struct Script {
    pub resources: ResourceSet,
    pub confidence: f64,
    /// Wait this long before answering
    pub delay: Option<Duration>,
}

impl Script {
    pub fn answer(names: &[&str], confidence: f64) -> Self {
        Self {
            resources: resources(names),
            confidence,
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Run a scripted worker until its inbox closes
pub fn spawn_worker(mut handle: WorkerHandle, script: Script) {
    tokio::spawn(async move {
        while let Some(envelope) = handle.recv().await {
            handle.ack(envelope.seq);
            let WorkerMessage::AssignTask(task) = envelope.message else {
                continue;
            };
            if let Some(delay) = script.delay {
                tokio::time::sleep(delay).await;
            }
            let proposal = Proposal::new(
                handle.worker_id(),
                task.session_id,
                task.task_id,
                script.resources.clone(),
                b"patch".to_vec(),
                script.confidence,
            );
            if handle.submit(proposal).await.is_err() {
                break;
            }
        }
    });
}

/// Keep a worker connected without ever answering
pub fn spawn_silent_worker(mut handle: WorkerHandle) {
    tokio::spawn(async move {
        while let Some(envelope) = handle.recv().await {
            handle.ack(envelope.seq);
        }
    });
}

/// Memory store whose first decision writes, or first writes of a
/// `Closed` session, report `Unavailable`
pub struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
    close_failures: AtomicUsize,
    pub decision_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_decisions(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
            close_failures: AtomicUsize::new(0),
            decision_writes: AtomicUsize::new(0),
        }
    }

    pub fn failing_close(failures: usize) -> Self {
        Self {
            close_failures: AtomicUsize::new(failures),
            ..Self::failing_decisions(0)
        }
    }
}

#[async_trait]
impl Persistence for FlakyStore {
    async fn save_session(&self, session: &Session) -> StoreResult<()> {
        if session.status == SessionStatus::Closed {
            let remaining = self.close_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.close_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("session table offline".into()));
            }
        }
        self.inner.save_session(session).await
    }
    async fn load_session(&self, session_id: &str) -> StoreResult<Session> {
        self.inner.load_session(session_id).await
    }
    async fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        self.inner.list_sessions().await
    }
    async fn save_worker(&self, worker: &Worker) -> StoreResult<()> {
        self.inner.save_worker(worker).await
    }
    async fn load_worker(&self, worker_id: &str) -> StoreResult<Worker> {
        self.inner.load_worker(worker_id).await
    }
    async fn list_workers(&self) -> StoreResult<Vec<Worker>> {
        self.inner.list_workers().await
    }
    async fn save_proposal(&self, proposal: &Proposal) -> StoreResult<()> {
        self.inner.save_proposal(proposal).await
    }
    async fn load_proposal(&self, proposal_id: &str) -> StoreResult<Proposal> {
        self.inner.load_proposal(proposal_id).await
    }
    async fn proposals_for_session(&self, session_id: &str) -> StoreResult<Vec<Proposal>> {
        self.inner.proposals_for_session(session_id).await
    }
    async fn save_decision(&self, decision: &DecisionRecord) -> StoreResult<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("decision table offline".into()));
        }
        self.decision_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.save_decision(decision).await
    }
    async fn load_decision(&self, session_id: &str) -> StoreResult<DecisionRecord> {
        self.inner.load_decision(session_id).await
    }
    async fn save_outcome(&self, outcome: &Outcome) -> StoreResult<()> {
        self.inner.save_outcome(outcome).await
    }
    async fn outcomes_for_session(&self, session_id: &str) -> StoreResult<Vec<Outcome>> {
        self.inner.outcomes_for_session(session_id).await
    }
    async fn outcomes_for_worker(&self, worker_id: &str) -> StoreResult<Vec<Outcome>> {
        self.inner.outcomes_for_worker(worker_id).await
    }
    async fn commit_evolution(&self, batch: &EvolutionBatch) -> StoreResult<()> {
        self.inner.commit_evolution(batch).await
    }
    async fn load_lineage(&self, worker_id: &str) -> StoreResult<LineageRecord> {
        self.inner.load_lineage(worker_id).await
    }
    async fn list_evolutions(&self) -> StoreResult<Vec<EvolutionRecord>> {
        self.inner.list_evolutions().await
    }
}
