//! Evolution across real sessions: scoring from recorded outcomes,
//! retirement, replacement and exclusion from later assignment

mod common;

use std::sync::Arc;

use common::{spawn_silent_worker, spawn_worker, tasks, Harness, Script};
use cycle_coordination::config::CoordinatorConfig;
use cycle_coordination::events::CoordinationEvent;
use cycle_coordination::evolution::{
    EvolutionConfig, EvolutionEngine, EvolutionScheduler, ThresholdEvolutionPolicy,
};
use cycle_coordination::retry::RetryPolicy;
use cycle_coordination::state::{Capability, WorkerStatus};

fn evolution_config() -> EvolutionConfig {
    EvolutionConfig {
        window: 2,
        retirement_threshold: 0.5,
        min_score: 0.0,
        max_workers_per_capability: 4,
        sessions_per_pass: 2,
    }
}

fn engine(h: &Harness, config: EvolutionConfig) -> Arc<EvolutionEngine> {
    Arc::new(EvolutionEngine::new(
        config.clone(),
        RetryPolicy::no_retry(),
        Arc::clone(&h.registry),
        Arc::clone(&h.store),
        Arc::clone(&h.events),
        Arc::new(ThresholdEvolutionPolicy::from_config(&config)),
    ))
}

async fn run_cycle(h: &Harness, n_tasks: usize) -> Vec<(String, String)> {
    let mut active = h
        .coordinator
        .create_session(&tasks(Capability::Code, n_tasks))
        .await
        .unwrap();
    let summary = h.coordinator.assign(&mut active).await.unwrap();
    h.coordinator.collect(&mut active).await.unwrap();
    h.coordinator.resolve(&mut active).await.unwrap();
    summary.dispatched
}

#[tokio::test]
async fn test_poor_worker_retired_and_never_assigned_again() {
    let h = Harness::new(CoordinatorConfig::default());
    spawn_worker(h.enroll("w-good", Capability::Code).await, Script::answer(&["good.rs"], 0.9));
    // Always under the confidence floor, so nothing it sends is accepted
    spawn_worker(h.enroll("w-poor", Capability::Code).await, Script::answer(&["poor.rs"], 0.3));

    for _ in 0..2 {
        let dispatched = run_cycle(&h, 2).await;
        assert!(dispatched.iter().any(|(_, w)| w == "w-poor"));
    }

    let engine = engine(&h, evolution_config());
    let stats = engine.worker_stats().await.unwrap();
    let poor = stats.iter().find(|s| s.worker_id == "w-poor").unwrap();
    assert_eq!(poor.rolling_score, 0.0);
    assert_eq!(poor.sessions_observed, 2);

    let report = engine.run_pass().await.unwrap();
    // Idle between sessions, so it goes straight to archived
    assert_eq!(report.archived, vec!["w-poor".to_string()]);
    assert_eq!(report.spawned.len(), 1);
    assert_eq!(
        h.registry.get("w-poor").unwrap().unwrap().status,
        WorkerStatus::Archived
    );

    let child_id = report.spawned[0].clone();
    let child = h.registry.get(&child_id).unwrap().unwrap();
    assert_eq!(child.parent_id.as_deref(), Some("w-poor"));
    assert_eq!(child.generation, 1);
    spawn_worker(h.channel.connect(&child_id).await, Script::answer(&["child.rs"], 0.9));

    for _ in 0..3 {
        let dispatched = run_cycle(&h, 2).await;
        assert!(dispatched.iter().all(|(_, w)| w != "w-poor"));
        assert!(dispatched.iter().any(|(_, w)| w == &child_id));
    }

    // Archived records stay for audit
    let stored = h.store.load_worker("w-poor").await.unwrap();
    assert_eq!(stored.status, WorkerStatus::Archived);
    assert!(stored.retirement_reason.is_some());
}

#[tokio::test]
async fn test_inactive_worker_penalized() {
    let h = Harness::new(config_with_short_deadline());
    spawn_worker(h.enroll("w-good", Capability::Code).await, Script::answer(&["good.rs"], 0.9));
    spawn_silent_worker(h.enroll("w-idle", Capability::Code).await);

    for _ in 0..2 {
        run_cycle(&h, 2).await;
    }

    let engine = engine(&h, evolution_config());
    let stats = engine.worker_stats().await.unwrap();
    let idle = stats.iter().find(|s| s.worker_id == "w-idle").unwrap();
    assert_eq!(idle.submitted, 0);
    assert_eq!(idle.rolling_score, 0.0);

    let report = engine.run_pass().await.unwrap();
    assert_eq!(report.archived, vec!["w-idle".to_string()]);
    let good = h.registry.get("w-good").unwrap().unwrap();
    assert!(good.is_active());
}

fn config_with_short_deadline() -> CoordinatorConfig {
    common::config_with_deadline(200)
}

#[tokio::test]
async fn test_scheduler_runs_pass_after_enough_sessions() {
    let h = Harness::new(CoordinatorConfig::default());
    spawn_worker(h.enroll("w-good", Capability::Code).await, Script::answer(&["good.rs"], 0.9));
    spawn_worker(h.enroll("w-poor", Capability::Code).await, Script::answer(&["poor.rs"], 0.1));

    let config = evolution_config();
    let scheduler = EvolutionScheduler::spawn(engine(&h, config.clone()), &h.events, config.sessions_per_pass);
    let mut events = h.events.subscribe();

    for _ in 0..2 {
        run_cycle(&h, 2).await;
    }

    let pass = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if let Ok(CoordinationEvent::EvolutionCompleted { pass, retired, .. }) = events.recv().await {
                return (pass, retired);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(pass, (1, 1));
    assert!(!h.registry.get("w-poor").unwrap().unwrap().is_active());

    assert_eq!(scheduler.shutdown().await, 1);
    assert_eq!(h.store.list_evolutions().await.unwrap().len(), 1);
}
