//! Session Coordinator
//!
//! Drives one session at a time through assignment, collection and
//! resolution. The coordinator itself holds only shared collaborators; the
//! state of the open session lives in the [`ActiveSession`] its caller owns,
//! so exclusive access to a session is a `&mut` borrow and no session lock is
//! ever held across a persistence call.
//!
//! ```text
//! create_session ──▶ assign ──▶ collect ──▶ resolve
//!      │               │           │           │
//!   persist        fan-out      fan-in      decide, persist
//!   Created        (parallel)   (one shared  proposals, outcomes,
//!                               deadline)    decision, then Closed
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::state_machine::SessionStateMachine;
use super::{CoordinatorError, CoordinatorMetrics, CoordinatorResult, SessionConfig};
use crate::channel::{
    SharedMessageChannel, SubmissionReceiver, TaskAssignment, WorkerHandle, WorkerMessage,
};
use crate::config::CoordinatorConfig;
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::registry::WorkerRegistry;
use crate::resolver::{find_overlap, late_rejection, ConflictResolver, ResourceWeightPolicy};
use crate::retry::{with_retry, RetryPolicy};
use crate::state::{
    Capability, DecisionRecord, Outcome, Proposal, Rejection, Session, SessionId,
    SessionLogEntry, SessionStatus, SharedPersistence, StoreError, StoreResult, TaskId,
    TaskSpec, TaskStatus, Worker, WorkerId, WorkerStatus,
};

/// Requests cancellation of a session from outside its owner
///
/// The owner observes the request at its next step; `collect` wakes up for
/// it immediately.
#[derive(Clone)]
pub struct AbortHandle {
    session_id: SessionId,
    sender: Arc<watch::Sender<Option<String>>>,
}

impl AbortHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(session_id = %self.session_id, reason = %reason, "Session abort requested");
        self.sender.send_replace(Some(reason));
    }

    pub fn is_requested(&self) -> bool {
        self.sender.borrow().is_some()
    }
}

/// The open session, owned by whoever drives it
pub struct ActiveSession {
    session: Session,
    machine: SessionStateMachine,
    /// Accepted into collection, in arrival order
    proposals: Vec<Proposal>,
    /// Computed decision, kept across failed persistence attempts
    decision: Option<DecisionRecord>,
    /// Decision Record and outcomes are durable; only closing remains
    decision_written: bool,
    deadline: Option<Instant>,
    abort: AbortHandle,
    abort_rx: watch::Receiver<Option<String>>,
    /// Liveness token for the coordinator's open-session slot
    _owner: Arc<()>,
}

impl ActiveSession {
    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn status(&self) -> SessionStatus {
        self.machine.current()
    }

    /// In-memory session record; matches the persisted one at each boundary
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn proposals(&self) -> &[Proposal] {
        &self.proposals
    }

    pub fn decision(&self) -> Option<&DecisionRecord> {
        self.decision.as_ref()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}

/// Result of the dispatch step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentSummary {
    /// (task, worker) pairs that reached the worker's inbox
    pub dispatched: Vec<(TaskId, WorkerId)>,
    pub unassigned: Vec<TaskId>,
}

/// Result of the collection step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectSummary {
    pub received: usize,
    pub timed_out: Vec<TaskId>,
    pub duplicates: usize,
    /// Submissions for other sessions seen while collecting
    pub late: usize,
}

struct OpenSlot {
    session_id: SessionId,
    owner: Weak<()>,
}

/// Coordinates sessions over the registry, channel and persistence gateway
pub struct SessionCoordinator {
    config: SessionConfig,
    retry: RetryPolicy,
    registry: Arc<WorkerRegistry>,
    channel: SharedMessageChannel,
    store: SharedPersistence,
    resolver: ConflictResolver,
    events: SharedEventBus,
    submissions: tokio::sync::Mutex<SubmissionReceiver>,
    open: Mutex<Option<OpenSlot>>,
    /// Submissions received outside collection, waiting to be routed
    pending: Mutex<Vec<Proposal>>,
    metrics: Mutex<CoordinatorMetrics>,
}

fn lock<T>(mutex: &Mutex<T>) -> CoordinatorResult<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| CoordinatorError::LockPoisoned)
}

impl SessionCoordinator {
    pub fn new(
        config: &CoordinatorConfig,
        registry: Arc<WorkerRegistry>,
        channel: SharedMessageChannel,
        submissions: SubmissionReceiver,
        store: SharedPersistence,
        events: SharedEventBus,
    ) -> Self {
        Self {
            config: config.session.clone(),
            retry: config.persistence.retry.clone(),
            registry,
            channel,
            store,
            resolver: ConflictResolver::with_uniform_weight(config.resolver.clone()),
            events,
            submissions: tokio::sync::Mutex::new(submissions),
            open: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
            metrics: Mutex::new(CoordinatorMetrics::default()),
        }
    }

    /// Replace the uniform resource weighting
    pub fn with_weight_policy(mut self, policy: Arc<dyn ResourceWeightPolicy>) -> Self {
        self.resolver = ConflictResolver::new(self.resolver.config().clone(), policy);
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> CoordinatorMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Identifier of the open session, if one is live
    pub fn open_session(&self) -> CoordinatorResult<Option<SessionId>> {
        Ok(lock(&self.open)?
            .as_ref()
            .filter(|slot| slot.owner.strong_count() > 0)
            .map(|slot| slot.session_id.clone()))
    }

    fn bump(&self, f: impl FnOnce(&mut CoordinatorMetrics)) {
        f(&mut self.metrics.lock().unwrap_or_else(PoisonError::into_inner));
    }

    async fn persist<T, F, Fut>(&self, op_name: &str, op: F) -> CoordinatorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        with_retry(&self.retry, op_name, op)
            .await
            .map_err(CoordinatorError::from)
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Register a worker, persist it and open its mailbox
    pub async fn enroll_worker(&self, worker: Worker) -> CoordinatorResult<WorkerHandle> {
        self.registry.register(worker.clone())?;
        if let Err(e) = self
            .persist("save_worker", || self.store.save_worker(&worker))
            .await
        {
            self.registry.deregister(&worker.id)?;
            return Err(e);
        }

        let handle = self.channel.connect(&worker.id).await;
        self.events.publish(CoordinationEvent::WorkerRegistered {
            worker_id: worker.id.clone(),
            capability: worker.capability,
            generation: worker.generation,
            timestamp: Utc::now(),
        });
        Ok(handle)
    }

    /// Take a worker out of rotation outside an evolution pass
    pub async fn retire_worker(&self, worker_id: &str, reason: &str) -> CoordinatorResult<Worker> {
        let worker = self.registry.begin_retirement(worker_id, reason)?;
        self.events.publish(CoordinationEvent::WorkerRetiring {
            worker_id: worker.id.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        if worker.status == WorkerStatus::Archived {
            self.events.publish(CoordinationEvent::WorkerArchived {
                worker_id: worker.id.clone(),
                timestamp: Utc::now(),
            });
        }
        self.persist("save_worker", || self.store.save_worker(&worker))
            .await?;
        Ok(worker)
    }

    /// Persist workers archived as a side effect of releasing their last task
    async fn persist_archived(&self, archived: Vec<Worker>) {
        for worker in archived {
            self.events.publish(CoordinationEvent::WorkerArchived {
                worker_id: worker.id.clone(),
                timestamp: Utc::now(),
            });
            if let Err(e) = self
                .persist("save_worker", || self.store.save_worker(&worker))
                .await
            {
                error!(worker_id = %worker.id, error = %e, "Archived worker status not persisted");
            }
        }
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Allocate and persist a session, leaving it in `Assigning`
    pub async fn create_session(&self, specs: &[TaskSpec]) -> CoordinatorResult<ActiveSession> {
        if specs.is_empty() {
            return Err(CoordinatorError::InvalidRequest(
                "a session needs at least one task".into(),
            ));
        }

        let session = Session::new(specs);
        let owner = Arc::new(());
        {
            let mut open = lock(&self.open)?;
            if let Some(slot) = open.as_ref() {
                if slot.owner.strong_count() > 0 {
                    return Err(CoordinatorError::SessionAlreadyOpen(slot.session_id.clone()));
                }
                warn!(
                    session_id = %slot.session_id,
                    "Previous session was dropped by its owner without closing"
                );
            }
            self.check_capacity(specs)?;
            *open = Some(OpenSlot {
                session_id: session.id.clone(),
                owner: Arc::downgrade(&owner),
            });
        }

        if let Err(e) = self
            .persist("save_session", || self.store.save_session(&session))
            .await
        {
            self.release_slot(&session.id);
            return Err(e);
        }

        let (sender, abort_rx) = watch::channel(None);
        let mut active = ActiveSession {
            abort: AbortHandle {
                session_id: session.id.clone(),
                sender: Arc::new(sender),
            },
            session,
            machine: SessionStateMachine::new(),
            proposals: Vec::new(),
            decision: None,
            decision_written: false,
            deadline: None,
            abort_rx,
            _owner: owner,
        };

        info!(
            session_id = %active.session.id,
            tasks = active.session.tasks.len(),
            "Session created"
        );
        self.events.publish(CoordinationEvent::SessionCreated {
            session_id: active.session.id.clone(),
            task_count: active.session.tasks.len(),
            timestamp: active.session.created_at,
        });
        self.bump(|m| m.sessions_created += 1);

        self.transition(&mut active, SessionStatus::Assigning, None)?;
        Ok(active)
    }

    fn check_capacity(&self, specs: &[TaskSpec]) -> CoordinatorResult<()> {
        let requested: BTreeSet<Capability> = specs.iter().map(|s| s.capability).collect();
        let counts = self.registry.active_counts()?;
        let missing: Vec<String> = requested
            .iter()
            .filter(|cap| counts.get(*cap).copied().unwrap_or(0) == 0)
            .map(|cap| cap.to_string())
            .collect();

        let refuse = if self.config.require_full_capacity {
            !missing.is_empty()
        } else {
            missing.len() == requested.len()
        };
        if refuse {
            return Err(CoordinatorError::CapacityExceeded(missing.join(", ")));
        }
        if !missing.is_empty() {
            warn!(capabilities = %missing.join(", "), "Some capabilities have no active worker");
        }
        Ok(())
    }

    /// Dispatch every task to a worker and move to `Collecting`
    ///
    /// Tasks without an eligible worker, or whose dispatch fails, are marked
    /// `Unassigned`; that never fails the session.
    pub async fn assign(&self, active: &mut ActiveSession) -> CoordinatorResult<AssignmentSummary> {
        Self::expect_status(active, SessionStatus::Assigning)?;
        self.observe_abort(active).await?;

        let deadline = Utc::now()
            + chrono::Duration::milliseconds(self.config.task_deadline_ms as i64);
        active.deadline = Some(Instant::now() + self.config.task_deadline());
        active.session.deadline = Some(deadline);
        let session_id = active.session.id.clone();

        let mut summary = AssignmentSummary::default();
        let mut dispatches = Vec::new();

        for task in active.session.tasks.iter_mut() {
            match self.registry.select_for_task(task.capability, &task.id)? {
                Some(worker) => {
                    task.assigned_worker = Some(worker.id.clone());
                    task.assigned_at = Some(Utc::now());
                    task.deadline = Some(deadline);
                    task.status = TaskStatus::Dispatched;
                    dispatches.push((
                        worker.id,
                        TaskAssignment {
                            task_id: task.id.clone(),
                            session_id: session_id.clone(),
                            capability: task.capability,
                            scope: task.scope.clone(),
                            deadline,
                        },
                    ));
                }
                None => {
                    task.status = TaskStatus::Unassigned;
                    warn!(
                        session_id = %session_id,
                        task_id = %task.id,
                        capability = %task.capability,
                        "No eligible worker, task unassigned"
                    );
                    summary.unassigned.push(task.id.clone());
                    self.events.publish(CoordinationEvent::TaskUnassigned {
                        session_id: session_id.clone(),
                        task_id: task.id.clone(),
                        capability: task.capability,
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        // Fan-out: all sends in flight together
        let sends = dispatches.into_iter().map(|(worker_id, assignment)| async move {
            let task_id = assignment.task_id.clone();
            let result = self
                .channel
                .publish(&worker_id, WorkerMessage::AssignTask(assignment))
                .await;
            (worker_id, task_id, result)
        });

        let mut archived = Vec::new();
        for (worker_id, task_id, result) in join_all(sends).await {
            match result {
                Ok(seq) => {
                    debug!(
                        session_id = %session_id,
                        task_id = %task_id,
                        worker_id = %worker_id,
                        seq,
                        "Task dispatched"
                    );
                    self.events.publish(CoordinationEvent::TaskDispatched {
                        session_id: session_id.clone(),
                        task_id: task_id.clone(),
                        worker_id: worker_id.clone(),
                        timestamp: Utc::now(),
                    });
                    summary.dispatched.push((task_id, worker_id));
                }
                Err(e) => {
                    warn!(
                        session_id = %session_id,
                        task_id = %task_id,
                        worker_id = %worker_id,
                        error = %e,
                        "Dispatch failed, task unassigned"
                    );
                    archived.extend(self.registry.complete_task(&worker_id, &task_id)?);
                    if let Some(task) = active.session.task_mut(&task_id) {
                        task.status = TaskStatus::Unassigned;
                        self.events.publish(CoordinationEvent::TaskUnassigned {
                            session_id: session_id.clone(),
                            task_id: task_id.clone(),
                            capability: task.capability,
                            timestamp: Utc::now(),
                        });
                    }
                    summary.unassigned.push(task_id);
                }
            }
        }

        let (dispatched, unassigned) = (summary.dispatched.len(), summary.unassigned.len());
        self.bump(|m| {
            m.tasks_dispatched += dispatched as u64;
            m.tasks_unassigned += unassigned as u64;
        });
        info!(session_id = %session_id, dispatched, unassigned, "Tasks assigned");

        self.transition(active, SessionStatus::Collecting, None)?;
        self.persist_archived(archived).await;
        Ok(summary)
    }

    /// Wait for every dispatched task under the shared deadline
    ///
    /// Tasks still outstanding when the deadline lapses become `TimedOut`
    /// and get a best-effort cancellation. An abort request ends the wait
    /// early and aborts the session.
    pub async fn collect(&self, active: &mut ActiveSession) -> CoordinatorResult<CollectSummary> {
        Self::expect_status(active, SessionStatus::Collecting)?;
        self.observe_abort(active).await?;

        let deadline = active.deadline.unwrap_or_else(Instant::now);
        let mut outstanding: HashSet<TaskId> = active
            .session
            .tasks_with_status(TaskStatus::Dispatched)
            .into_iter()
            .collect();
        let mut summary = CollectSummary::default();
        let mut late = Vec::new();
        let mut archived = Vec::new();

        // Submissions for this session that arrived before collection began
        let early: Vec<Proposal> = {
            let mut pending = lock(&self.pending)?;
            let (mine, rest): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|p| p.session_id == active.session.id);
            *pending = rest;
            mine
        };
        for proposal in early {
            self.accept_submission(active, proposal, &mut outstanding, &mut summary, &mut archived)?;
        }

        let mut abort_rx = active.abort_rx.clone();
        let mut abort_live = true;
        let mut aborted = None;
        {
            let mut submissions = self.submissions.lock().await;
            while !outstanding.is_empty() {
                tokio::select! {
                    biased;
                    changed = abort_rx.changed(), if abort_live => {
                        if changed.is_err() {
                            abort_live = false;
                            continue;
                        }
                        let requested = abort_rx.borrow_and_update().clone();
                        if let Some(reason) = requested {
                            aborted = Some(reason);
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                    received = submissions.recv() => match received {
                        Some(proposal) if proposal.session_id == active.session.id => {
                            self.accept_submission(
                                active,
                                proposal,
                                &mut outstanding,
                                &mut summary,
                                &mut archived,
                            )?;
                        }
                        Some(proposal) => late.push(proposal),
                        None => {
                            warn!(session_id = %active.session.id, "Submission queue closed");
                            break;
                        }
                    },
                }
            }
        }

        summary.late = late.len();
        self.persist_archived(archived).await;

        if let Some(reason) = aborted {
            self.abort(active, &reason).await?;
            self.route_late(late).await?;
            return Err(CoordinatorError::Aborted {
                session_id: active.session.id.clone(),
                reason,
            });
        }

        let session_id = active.session.id.clone();
        let mut cancels = Vec::new();
        let mut archived = Vec::new();
        for task in active
            .session
            .tasks
            .iter_mut()
            .filter(|t| outstanding.contains(&t.id))
        {
            task.status = TaskStatus::TimedOut;
            let Some(worker_id) = task.assigned_worker.clone() else {
                continue;
            };
            info!(
                session_id = %session_id,
                task_id = %task.id,
                worker_id = %worker_id,
                "Task timed out"
            );
            self.events.publish(CoordinationEvent::TaskTimedOut {
                session_id: session_id.clone(),
                task_id: task.id.clone(),
                worker_id: worker_id.clone(),
                timestamp: Utc::now(),
            });
            archived.extend(self.registry.complete_task(&worker_id, &task.id)?);
            summary.timed_out.push(task.id.clone());
            cancels.push((worker_id, task.id.clone()));
        }

        let timed_out = summary.timed_out.len() as u64;
        self.bump(|m| m.tasks_timed_out += timed_out);
        info!(
            session_id = %session_id,
            received = summary.received,
            timed_out,
            duplicates = summary.duplicates,
            "Collection finished"
        );

        self.transition(active, SessionStatus::Resolving, None)?;
        self.send_cancellations(&session_id, cancels, "deadline elapsed")
            .await;
        self.persist_archived(archived).await;
        self.route_late(late).await?;
        Ok(summary)
    }

    fn accept_submission(
        &self,
        active: &mut ActiveSession,
        proposal: Proposal,
        outstanding: &mut HashSet<TaskId>,
        summary: &mut CollectSummary,
        archived: &mut Vec<Worker>,
    ) -> CoordinatorResult<()> {
        let Some(task) = active.session.task_mut(&proposal.task_id) else {
            warn!(
                session_id = %proposal.session_id,
                task_id = %proposal.task_id,
                "Proposal for unknown task dropped"
            );
            return Ok(());
        };
        if task.assigned_worker.as_deref() != Some(proposal.worker_id.as_str()) {
            warn!(
                task_id = %proposal.task_id,
                worker_id = %proposal.worker_id,
                "Proposal from a worker not assigned to the task dropped"
            );
            return Ok(());
        }
        if self.registry.get(&proposal.worker_id)?.is_none() {
            // Task stays outstanding and times out at the deadline
            warn!(
                task_id = %proposal.task_id,
                worker_id = %proposal.worker_id,
                "Proposal from a deregistered worker dropped"
            );
            return Ok(());
        }
        if !outstanding.remove(&proposal.task_id) {
            // Redelivered assignment answered twice
            debug!(task_id = %proposal.task_id, proposal_id = %proposal.id, "Duplicate submission ignored");
            summary.duplicates += 1;
            self.bump(|m| m.duplicate_submissions += 1);
            return Ok(());
        }

        task.status = TaskStatus::Fulfilled;
        archived.extend(
            self.registry
                .complete_task(&proposal.worker_id, &proposal.task_id)?,
        );
        debug!(
            session_id = %proposal.session_id,
            task_id = %proposal.task_id,
            proposal_id = %proposal.id,
            confidence = proposal.confidence,
            "Proposal received"
        );
        self.events.publish(CoordinationEvent::ProposalReceived {
            session_id: proposal.session_id.clone(),
            task_id: proposal.task_id.clone(),
            proposal_id: proposal.id.clone(),
            worker_id: proposal.worker_id.clone(),
            confidence: proposal.confidence,
            timestamp: Utc::now(),
        });
        self.bump(|m| m.proposals_received += 1);
        summary.received += 1;
        active.proposals.push(proposal);
        Ok(())
    }

    /// Produce, persist and return the session's Decision Record
    ///
    /// The decision is computed once. If persistence fails the session stays
    /// `Resolving` and a later call retries with the same record; on a closed
    /// session this returns the recorded decision unchanged.
    pub async fn resolve(&self, active: &mut ActiveSession) -> CoordinatorResult<DecisionRecord> {
        if active.status() == SessionStatus::Closed {
            return active.decision.clone().ok_or_else(|| {
                CoordinatorError::InvariantViolation(format!(
                    "session {} closed without a decision",
                    active.session.id
                ))
            });
        }
        Self::expect_status(active, SessionStatus::Resolving)?;
        if !active.decision_written {
            self.observe_abort(active).await?;
        }

        let decision = match active.decision.clone() {
            Some(decision) => decision,
            None => {
                let resolution = self.resolver.resolve(&active.proposals);
                if let Some((a, b)) = find_overlap(&resolution.accepted, &active.proposals) {
                    let reason = format!("accepted proposals {} and {} overlap", a.id, b.id);
                    error!(session_id = %active.session.id, reason = %reason, "Resolution invariant violated");
                    self.abort(active, &reason).await?;
                    return Err(CoordinatorError::InvariantViolation(reason));
                }

                let decision = DecisionRecord {
                    session_id: active.session.id.clone(),
                    accepted: resolution.accepted,
                    rejected: resolution.rejected,
                    timed_out: active.session.tasks_with_status(TaskStatus::TimedOut),
                    unassigned: active.session.tasks_with_status(TaskStatus::Unassigned),
                    dry_run: self.config.dry_run,
                    decided_at: Utc::now(),
                };
                active.decision = Some(decision.clone());
                decision
            }
        };

        if !active.decision_written {
            if let Err(e) = self.write_decision(active, &decision).await {
                warn!(
                    session_id = %active.session.id,
                    error = %e,
                    "Decision not persisted, session stays Resolving"
                );
                return Err(e);
            }
            active.decision_written = true;
        }

        let mut machine = active.machine.clone();
        let record = machine.advance(SessionStatus::Closed, None)?.clone();
        let mut closed = active.session.clone();
        closed.status = SessionStatus::Closed;
        closed.decision = Some(decision.clone());
        closed.closed_at = Some(record.at);
        closed.transitions.push(record.clone());

        if let Err(e) = self
            .persist("save_session", || self.store.save_session(&closed))
            .await
        {
            warn!(
                session_id = %active.session.id,
                error = %e,
                "Closed session not persisted, session stays Resolving"
            );
            return Err(e);
        }
        active.machine = machine;
        active.session = closed;

        let session_id = active.session.id.clone();
        info!(
            session_id = %session_id,
            accepted = decision.accepted.len(),
            rejected = decision.rejected.len(),
            timed_out = decision.timed_out.len(),
            dry_run = decision.dry_run,
            "Session closed"
        );
        self.events.publish(CoordinationEvent::SessionTransitioned {
            session_id: session_id.clone(),
            from: record.from,
            to: record.to,
            timestamp: record.at,
        });
        self.events.publish(CoordinationEvent::DecisionRecorded {
            session_id: session_id.clone(),
            accepted: decision.accepted.len(),
            rejected: decision.rejected.len(),
            timed_out: decision.timed_out.len(),
            timestamp: decision.decided_at,
        });
        let (accepted, rejected) = (decision.accepted.len(), decision.rejected.len());
        self.bump(|m| {
            m.sessions_closed += 1;
            m.proposals_accepted += accepted as u64;
            m.proposals_rejected += rejected as u64;
        });

        self.release_slot(&session_id);
        let stragglers = self.take_pending(&session_id)?;
        self.route_late(stragglers).await?;
        Ok(decision)
    }

    /// Proposals, outcomes and the decision, in that order
    ///
    /// Every write is idempotent, so a retried `resolve` repeats them safely.
    async fn write_decision(
        &self,
        active: &ActiveSession,
        decision: &DecisionRecord,
    ) -> CoordinatorResult<()> {
        for proposal in &active.proposals {
            self.persist("save_proposal", || self.store.save_proposal(proposal))
                .await?;
        }
        for outcome in session_outcomes(&active.session, &active.proposals, decision) {
            self.persist("save_outcome", || self.store.save_outcome(&outcome))
                .await?;
        }
        self.persist("save_decision", || self.store.save_decision(decision))
            .await
    }

    /// Force the session to `Aborted`
    ///
    /// Outstanding tasks are cancelled and their workers told so, best
    /// effort. No Decision Record is produced. Calling this again on an
    /// aborted session only retries persisting it. Once the Decision Record
    /// is durable the session can only close, so abort is refused.
    pub async fn abort(&self, active: &mut ActiveSession, reason: &str) -> CoordinatorResult<()> {
        if active.decision_written {
            warn!(
                session_id = %active.session.id,
                reason,
                "Abort refused, decision already persisted"
            );
            return Err(CoordinatorError::DecisionPersisted(active.session.id.clone()));
        }
        match active.status() {
            SessionStatus::Aborted => {
                let snapshot = active.session.clone();
                return self
                    .persist("save_session", || self.store.save_session(&snapshot))
                    .await;
            }
            SessionStatus::Closed => {
                return Err(super::IllegalTransition {
                    from: SessionStatus::Closed,
                    to: SessionStatus::Aborted,
                }
                .into())
            }
            _ => {}
        }

        let session_id = active.session.id.clone();
        let mut cancels = Vec::new();
        let mut archived = Vec::new();
        for task in active
            .session
            .tasks
            .iter_mut()
            .filter(|t| !t.status.is_terminal())
        {
            let dispatched_to = match task.status {
                TaskStatus::Dispatched => task.assigned_worker.clone(),
                _ => None,
            };
            task.status = TaskStatus::Cancelled;
            if let Some(worker_id) = dispatched_to {
                archived.extend(self.registry.complete_task(&worker_id, &task.id)?);
                cancels.push((worker_id, task.id.clone()));
            }
        }

        self.transition(active, SessionStatus::Aborted, Some(reason))?;
        active.session.abort_reason = Some(reason.to_string());
        active.session.closed_at = Some(Utc::now());
        active.abort.sender.send_replace(Some(reason.to_string()));

        warn!(session_id = %session_id, reason, cancelled = cancels.len(), "Session aborted");
        self.events.publish(CoordinationEvent::SessionAborted {
            session_id: session_id.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        self.bump(|m| m.sessions_aborted += 1);
        self.release_slot(&session_id);

        self.send_cancellations(&session_id, cancels, reason).await;
        self.persist_archived(archived).await;

        let snapshot = active.session.clone();
        self.persist("save_session", || self.store.save_session(&snapshot))
            .await?;
        let stragglers = self.take_pending(&session_id)?;
        self.route_late(stragglers).await?;
        Ok(())
    }

    // =========================================================================
    // After close
    // =========================================================================

    /// Route submissions that arrived outside collection
    ///
    /// Proposals for a decided or aborted session are rejected
    /// `SessionClosed` and appended to that session's log. Proposals for the
    /// open session are held for its collection step.
    pub async fn drain_late_submissions(&self) -> CoordinatorResult<Vec<Rejection>> {
        let mut batch = std::mem::take(&mut *lock(&self.pending)?);
        match self.submissions.try_lock() {
            Ok(mut submissions) => {
                while let Ok(proposal) = submissions.try_recv() {
                    batch.push(proposal);
                }
            }
            Err(_) => debug!("Collection in progress, draining held submissions only"),
        }
        self.route_late(batch).await
    }

    /// Record whether an accepted proposal applied successfully
    ///
    /// Any failure marks the worker's session outcome failed.
    pub async fn record_success_signal(
        &self,
        session_id: &str,
        proposal_id: &str,
        success: bool,
    ) -> CoordinatorResult<Outcome> {
        let decision = match self
            .persist("load_decision", || self.store.load_decision(session_id))
            .await
        {
            Err(CoordinatorError::Store(StoreError::NotFound(_))) => {
                return Err(CoordinatorError::SessionNotFound(session_id.to_string()))
            }
            other => other?,
        };
        let accepted = decision
            .accepted
            .iter()
            .find(|a| a.proposal_id == proposal_id)
            .ok_or_else(|| {
                CoordinatorError::InvalidRequest(format!(
                    "proposal {proposal_id} was not accepted in session {session_id}"
                ))
            })?;

        let outcomes = self
            .persist("outcomes_for_session", || {
                self.store.outcomes_for_session(session_id)
            })
            .await?;
        let mut outcome = outcomes
            .into_iter()
            .find(|o| o.worker_id == accepted.worker_id)
            .ok_or_else(|| {
                CoordinatorError::InvariantViolation(format!(
                    "no outcome for worker {} in session {session_id}",
                    accepted.worker_id
                ))
            })?;
        outcome.success_signal = Some(outcome.success_signal.unwrap_or(true) && success);
        self.persist("save_outcome", || self.store.save_outcome(&outcome))
            .await?;

        let mut session = self
            .persist("load_session", || self.store.load_session(session_id))
            .await?;
        session.log.push(SessionLogEntry::SuccessSignal {
            proposal_id: proposal_id.to_string(),
            success,
            at: Utc::now(),
        });
        self.persist("save_session", || self.store.save_session(&session))
            .await?;

        info!(session_id, proposal_id, worker_id = %outcome.worker_id, success, "Success signal recorded");
        Ok(outcome)
    }

    async fn route_late(&self, proposals: Vec<Proposal>) -> CoordinatorResult<Vec<Rejection>> {
        let mut rejections = Vec::new();
        let mut retry_later = Vec::new();
        let open = self.open_session()?;

        for proposal in proposals {
            if open.as_deref() == Some(proposal.session_id.as_str()) {
                retry_later.push(proposal);
                continue;
            }
            match self.reject_late(&proposal).await {
                Ok(Some(rejection)) => rejections.push(rejection),
                Ok(None) => {}
                Err(e @ CoordinatorError::PersistenceUnavailable(_)) => {
                    warn!(proposal_id = %proposal.id, error = %e, "Late proposal held for the next drain");
                    retry_later.push(proposal);
                }
                Err(e) => return Err(e),
            }
        }

        if !retry_later.is_empty() {
            lock(&self.pending)?.extend(retry_later);
        }
        Ok(rejections)
    }

    async fn reject_late(&self, proposal: &Proposal) -> CoordinatorResult<Option<Rejection>> {
        let mut session = match self
            .persist("load_session", || self.store.load_session(&proposal.session_id))
            .await
        {
            Ok(session) => session,
            Err(CoordinatorError::Store(StoreError::NotFound(_))) => {
                warn!(
                    session_id = %proposal.session_id,
                    proposal_id = %proposal.id,
                    "Proposal for unknown session dropped"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !session.status.is_terminal() {
            warn!(
                session_id = %proposal.session_id,
                proposal_id = %proposal.id,
                status = %session.status,
                "Proposal for an abandoned session dropped"
            );
            return Ok(None);
        }

        let rejection = late_rejection(proposal);
        let now = Utc::now();
        session.log.push(SessionLogEntry::LateProposalRejected {
            proposal_id: proposal.id.clone(),
            worker_id: proposal.worker_id.clone(),
            task_id: proposal.task_id.clone(),
            at: now,
        });
        self.persist("save_proposal", || self.store.save_proposal(proposal))
            .await?;
        self.persist("save_session", || self.store.save_session(&session))
            .await?;

        info!(
            session_id = %proposal.session_id,
            proposal_id = %proposal.id,
            worker_id = %proposal.worker_id,
            "Late proposal rejected"
        );
        self.events.publish(CoordinationEvent::LateProposalRejected {
            session_id: proposal.session_id.clone(),
            proposal_id: proposal.id.clone(),
            worker_id: proposal.worker_id.clone(),
            reason: rejection.reason.clone(),
            timestamp: now,
        });
        self.bump(|m| m.late_rejections += 1);
        Ok(Some(rejection))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn transition(
        &self,
        active: &mut ActiveSession,
        to: SessionStatus,
        reason: Option<&str>,
    ) -> CoordinatorResult<()> {
        let record = active.machine.advance(to, reason)?.clone();
        active.session.status = to;
        active.session.transitions.push(record.clone());

        info!(
            session_id = %active.session.id,
            from = %record.from,
            to = %record.to,
            elapsed_ms = record.elapsed_ms,
            "Session transitioned"
        );
        self.events.publish(CoordinationEvent::SessionTransitioned {
            session_id: active.session.id.clone(),
            from: record.from,
            to: record.to,
            timestamp: record.at,
        });
        Ok(())
    }

    fn expect_status(active: &ActiveSession, expected: SessionStatus) -> CoordinatorResult<()> {
        match active.status() {
            actual if actual == expected => Ok(()),
            SessionStatus::Aborted => Err(CoordinatorError::Aborted {
                session_id: active.session.id.clone(),
                reason: active.session.abort_reason.clone().unwrap_or_default(),
            }),
            actual => Err(CoordinatorError::InvalidState { expected, actual }),
        }
    }

    /// Honour a pending abort request before the next step
    async fn observe_abort(&self, active: &mut ActiveSession) -> CoordinatorResult<()> {
        let requested = active.abort_rx.borrow().clone();
        match requested {
            Some(reason) => {
                self.abort(active, &reason).await?;
                Err(CoordinatorError::Aborted {
                    session_id: active.session.id.clone(),
                    reason,
                })
            }
            None => Ok(()),
        }
    }

    async fn send_cancellations(
        &self,
        session_id: &str,
        cancels: Vec<(WorkerId, TaskId)>,
        reason: &str,
    ) {
        let sends = cancels.into_iter().map(|(worker_id, task_id)| async move {
            let message = WorkerMessage::CancelTask {
                task_id: task_id.clone(),
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            };
            if let Err(e) = self.channel.publish(&worker_id, message).await {
                debug!(worker_id = %worker_id, task_id = %task_id, error = %e, "Cancellation not delivered");
            }
        });
        join_all(sends).await;
    }

    fn release_slot(&self, session_id: &str) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if open.as_ref().map(|slot| slot.session_id.as_str()) == Some(session_id) {
            *open = None;
        }
    }

    fn take_pending(&self, session_id: &str) -> CoordinatorResult<Vec<Proposal>> {
        let mut pending = lock(&self.pending)?;
        let (mine, rest): (Vec<_>, Vec<_>) = pending
            .drain(..)
            .partition(|p| p.session_id == session_id);
        *pending = rest;
        Ok(mine)
    }
}

/// One outcome per worker that held a task through collection
///
/// A worker that was assigned a task but never answered gets an outcome with
/// nothing submitted, so inactivity is visible to evolution.
fn session_outcomes(
    session: &Session,
    proposals: &[Proposal],
    decision: &DecisionRecord,
) -> Vec<Outcome> {
    let mut per_worker: BTreeMap<WorkerId, (u32, u32)> = BTreeMap::new();
    for task in session
        .tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Fulfilled | TaskStatus::TimedOut))
    {
        if let Some(worker_id) = &task.assigned_worker {
            per_worker.entry(worker_id.clone()).or_default();
        }
    }
    for proposal in proposals {
        per_worker.entry(proposal.worker_id.clone()).or_default().0 += 1;
    }
    for accepted in &decision.accepted {
        per_worker.entry(accepted.worker_id.clone()).or_default().1 += 1;
    }

    per_worker
        .into_iter()
        .map(|(worker_id, (submitted, accepted))| {
            let mut outcome = Outcome::new(worker_id, session.id.clone(), submitted, accepted);
            outcome.recorded_at = decision.decided_at;
            outcome
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, MessageChannel};
    use crate::events::EventBus;
    use crate::state::{MemoryStore, Persistence, ResourceSet, RejectionReason};
    use std::time::Duration;

    struct Fixture {
        coordinator: SessionCoordinator,
        store: Arc<MemoryStore>,
        registry: Arc<WorkerRegistry>,
        channel: SharedMessageChannel,
    }

    fn fixture(config: CoordinatorConfig) -> Fixture {
        let registry = Arc::new(WorkerRegistry::new());
        let (channel, submissions) = MessageChannel::new(ChannelConfig::default());
        let channel = channel.shared();
        let store = Arc::new(MemoryStore::new());
        let coordinator = SessionCoordinator::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&channel),
            submissions,
            store.clone(),
            EventBus::new().shared(),
        );
        Fixture {
            coordinator,
            store,
            registry,
            channel,
        }
    }

    fn short_deadline() -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();
        config.session.task_deadline_ms = 1_000;
        config
    }

    /// Answer every assignment with a proposal over `resources`
    fn respond(mut handle: WorkerHandle, resources: &[&str], confidence: f64) {
        let resources: ResourceSet = resources.iter().copied().collect();
        tokio::spawn(async move {
            while let Some(envelope) = handle.recv().await {
                handle.ack(envelope.seq);
                if let WorkerMessage::AssignTask(task) = envelope.message {
                    let proposal = Proposal::new(
                        handle.worker_id(),
                        task.session_id,
                        task.task_id,
                        resources.clone(),
                        b"diff".to_vec(),
                        confidence,
                    );
                    if handle.submit(proposal).await.is_err() {
                        break;
                    }
                }
            }
        });
    }

    fn code_tasks(n: usize) -> Vec<TaskSpec> {
        (0..n)
            .map(|i| TaskSpec::new(Capability::Code, format!("src/{i}.rs")))
            .collect()
    }

    #[tokio::test]
    async fn test_full_cycle_closes_with_decision() {
        let f = fixture(CoordinatorConfig::default());
        let h1 = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code).with_id("w-1"))
            .await
            .unwrap();
        let h2 = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code).with_id("w-2"))
            .await
            .unwrap();
        respond(h1, &["shared.py"], 0.9);
        respond(h2, &["shared.py"], 0.8);

        let mut active = f.coordinator.create_session(&code_tasks(2)).await.unwrap();
        assert_eq!(active.status(), SessionStatus::Assigning);

        let assigned = f.coordinator.assign(&mut active).await.unwrap();
        assert_eq!(assigned.dispatched.len(), 2);

        let collected = f.coordinator.collect(&mut active).await.unwrap();
        assert_eq!(collected.received, 2);
        assert!(collected.timed_out.is_empty());

        let decision = f.coordinator.resolve(&mut active).await.unwrap();
        assert_eq!(active.status(), SessionStatus::Closed);
        assert_eq!(decision.accepted.len(), 1);
        assert_eq!(decision.accepted[0].worker_id, "w-1");
        assert!(matches!(
            decision.rejected[0].reason,
            RejectionReason::ConflictLoss { .. }
        ));

        // Resolving again is a no-op
        let again = f.coordinator.resolve(&mut active).await.unwrap();
        assert_eq!(again, decision);

        let stored = f.store.load_session(active.id()).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Closed);
        assert_eq!(stored.decision, Some(decision.clone()));
        assert_eq!(f.store.load_decision(active.id()).await.unwrap(), decision);
        assert_eq!(f.store.outcomes_for_session(active.id()).await.unwrap().len(), 2);
        assert!(f.coordinator.open_session().unwrap().is_none());
        assert_eq!(f.registry.in_flight("w-1").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_capacity_exceeded_only_when_nothing_can_be_served() {
        let f = fixture(CoordinatorConfig::default());
        let result = f.coordinator.create_session(&code_tasks(1)).await;
        assert!(matches!(result, Err(CoordinatorError::CapacityExceeded(_))));
        assert!(f.coordinator.open_session().unwrap().is_none());

        let _handle = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code))
            .await
            .unwrap();
        let specs = vec![
            TaskSpec::new(Capability::Code, "src/"),
            TaskSpec::new(Capability::Doc, "README.md"),
        ];
        let mut active = f.coordinator.create_session(&specs).await.unwrap();
        let assigned = f.coordinator.assign(&mut active).await.unwrap();
        assert_eq!(assigned.dispatched.len(), 1);
        assert_eq!(assigned.unassigned.len(), 1);
    }

    #[tokio::test]
    async fn test_strict_capacity_refuses_partial_service() {
        let mut config = CoordinatorConfig::default();
        config.session.require_full_capacity = true;
        let f = fixture(config);
        let _handle = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code))
            .await
            .unwrap();

        let specs = vec![
            TaskSpec::new(Capability::Code, "src/"),
            TaskSpec::new(Capability::Test, "tests/"),
        ];
        let result = f.coordinator.create_session(&specs).await;
        assert_eq!(
            result.err(),
            Some(CoordinatorError::CapacityExceeded("test".into()))
        );
    }

    #[tokio::test]
    async fn test_one_open_session_at_a_time() {
        let f = fixture(CoordinatorConfig::default());
        let _handle = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code))
            .await
            .unwrap();

        let active = f.coordinator.create_session(&code_tasks(1)).await.unwrap();
        let second = f.coordinator.create_session(&code_tasks(1)).await;
        assert_eq!(
            second.err(),
            Some(CoordinatorError::SessionAlreadyOpen(active.id().to_string()))
        );

        // A dropped owner frees the slot
        drop(active);
        assert!(f.coordinator.create_session(&code_tasks(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_worker_times_out_and_session_still_closes() {
        let f = fixture(short_deadline());
        let _silent = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code).with_id("w-quiet"))
            .await
            .unwrap();

        let mut active = f.coordinator.create_session(&code_tasks(1)).await.unwrap();
        f.coordinator.assign(&mut active).await.unwrap();
        let collected = f.coordinator.collect(&mut active).await.unwrap();
        assert_eq!(collected.timed_out.len(), 1);

        let decision = f.coordinator.resolve(&mut active).await.unwrap();
        assert!(decision.accepted.is_empty());
        assert_eq!(decision.timed_out, collected.timed_out);

        let outcomes = f.store.outcomes_for_worker("w-quiet").await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].submitted, 0);
        assert_eq!(f.coordinator.metrics().tasks_timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_collection() {
        let f = fixture(short_deadline());
        let mut silent = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code).with_id("w-1"))
            .await
            .unwrap();

        let mut active = f.coordinator.create_session(&code_tasks(1)).await.unwrap();
        f.coordinator.assign(&mut active).await.unwrap();

        let handle = active.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.abort("operator cancelled");
        });

        let result = f.coordinator.collect(&mut active).await;
        assert!(matches!(result, Err(CoordinatorError::Aborted { .. })));
        assert_eq!(active.status(), SessionStatus::Aborted);
        assert_eq!(active.session().tasks[0].status, TaskStatus::Cancelled);
        assert_eq!(f.registry.in_flight("w-1").unwrap(), 0);

        let stored = f.store.load_session(active.id()).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Aborted);
        assert!(stored.decision.is_none());
        assert!(f.store.load_decision(active.id()).await.is_err());

        // Assignment, then the best-effort cancellation
        let first = silent.recv().await.unwrap();
        let second = silent.recv().await.unwrap();
        assert_eq!(first.message.kind(), "assign_task");
        assert_eq!(second.message.kind(), "cancel_task");

        assert!(matches!(
            f.coordinator.resolve(&mut active).await,
            Err(CoordinatorError::Aborted { .. })
        ));
    }

    #[tokio::test]
    async fn test_late_proposal_rejected_session_closed() {
        let f = fixture(CoordinatorConfig::default());
        let mut inbox = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code).with_id("w-1"))
            .await
            .unwrap();

        let mut active = f.coordinator.create_session(&code_tasks(1)).await.unwrap();
        f.coordinator.assign(&mut active).await.unwrap();
        let envelope = inbox.recv().await.unwrap();
        let task_id = envelope.message.task_id().to_string();
        let first = Proposal::new("w-1", active.id(), &task_id, ResourceSet::new(), vec![], 0.9);
        inbox.submit(first).await.unwrap();

        f.coordinator.collect(&mut active).await.unwrap();
        f.coordinator.resolve(&mut active).await.unwrap();

        // Redelivery answered again after close
        let straggler = Proposal::new("w-1", active.id(), &task_id, ResourceSet::new(), vec![], 0.99);
        inbox.submit(straggler.clone()).await.unwrap();
        let rejections = f.coordinator.drain_late_submissions().await.unwrap();

        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].proposal_id, straggler.id);
        assert_eq!(rejections[0].reason, RejectionReason::SessionClosed);

        let stored = f.store.load_session(active.id()).await.unwrap();
        assert!(matches!(
            stored.log.last(),
            Some(SessionLogEntry::LateProposalRejected { .. })
        ));
        assert!(!stored.decision.unwrap().is_accepted(&straggler.id));
        assert_eq!(f.coordinator.metrics().late_rejections, 1);
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_ignored() {
        let f = fixture(short_deadline());
        let mut handle = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code).with_id("w-1"))
            .await
            .unwrap();

        let mut active = f.coordinator.create_session(&code_tasks(1)).await.unwrap();
        f.coordinator.assign(&mut active).await.unwrap();
        let envelope = handle.recv().await.unwrap();
        let task_id = envelope.message.task_id().to_string();

        for confidence in [0.9, 0.95] {
            let proposal = Proposal::new("w-1", active.id(), &task_id, ResourceSet::new(), vec![], confidence);
            handle.submit(proposal).await.unwrap();
        }
        let collected = f.coordinator.collect(&mut active).await.unwrap();
        assert_eq!(collected.received, 1);
        assert_eq!(active.proposals().len(), 1);
        assert_eq!(active.proposals()[0].confidence, 0.9);

        // The second copy is still queued; it is drained as a straggler
        f.coordinator.resolve(&mut active).await.unwrap();
        let rejections = f.coordinator.drain_late_submissions().await.unwrap();
        assert_eq!(rejections.len(), 1);
    }

    #[tokio::test]
    async fn test_success_signal_updates_outcome_and_log() {
        let f = fixture(CoordinatorConfig::default());
        let handle = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code).with_id("w-1"))
            .await
            .unwrap();
        respond(handle, &["a.py"], 0.9);

        let mut active = f.coordinator.create_session(&code_tasks(1)).await.unwrap();
        f.coordinator.assign(&mut active).await.unwrap();
        f.coordinator.collect(&mut active).await.unwrap();
        let decision = f.coordinator.resolve(&mut active).await.unwrap();
        let accepted = &decision.accepted[0];

        let outcome = f
            .coordinator
            .record_success_signal(active.id(), &accepted.proposal_id, true)
            .await
            .unwrap();
        assert_eq!(outcome.success_signal, Some(true));

        let outcome = f
            .coordinator
            .record_success_signal(active.id(), &accepted.proposal_id, false)
            .await
            .unwrap();
        assert_eq!(outcome.success_signal, Some(false));

        let stored = f.store.load_session(active.id()).await.unwrap();
        assert_eq!(stored.log.len(), 2);

        let unknown = f
            .coordinator
            .record_success_signal("nope", &accepted.proposal_id, true)
            .await;
        assert_eq!(
            unknown.err(),
            Some(CoordinatorError::SessionNotFound("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_dry_run_marks_decision() {
        let mut config = CoordinatorConfig::default();
        config.session.dry_run = true;
        let f = fixture(config);
        let handle = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code))
            .await
            .unwrap();
        respond(handle, &["a.py"], 0.9);

        let mut active = f.coordinator.create_session(&code_tasks(1)).await.unwrap();
        f.coordinator.assign(&mut active).await.unwrap();
        f.coordinator.collect(&mut active).await.unwrap();
        let decision = f.coordinator.resolve(&mut active).await.unwrap();
        assert!(decision.dry_run);
        assert_eq!(decision.accepted.len(), 1);
    }

    #[tokio::test]
    async fn test_steps_out_of_order_are_refused() {
        let f = fixture(CoordinatorConfig::default());
        let _handle = f
            .coordinator
            .enroll_worker(Worker::new(Capability::Code))
            .await
            .unwrap();
        let mut active = f.coordinator.create_session(&code_tasks(1)).await.unwrap();

        let result = f.coordinator.collect(&mut active).await;
        assert_eq!(
            result.err(),
            Some(CoordinatorError::InvalidState {
                expected: SessionStatus::Collecting,
                actual: SessionStatus::Assigning,
            })
        );
        assert!(f.channel.is_connected(&f.registry.snapshot().unwrap()[0].worker.id));
    }
}
