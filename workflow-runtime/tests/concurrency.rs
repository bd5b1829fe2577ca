mod common;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{AddNumbers, Numbers, fast_config, host, wait_for_terminal};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use workflow_core::{
    DataSchema, ExecutionResult, Lease, StepBody, StepContext, WorkflowBuilder,
    WorkflowDefinition, WorkflowInstance, WorkflowStatus,
};
use workflow_runtime::{
    CycleOutcome, EngineContext, InMemoryProvider, PersistenceError, PersistenceProvider,
    WorkflowHost,
};

static RUNNING: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(Default::default);
static OVERLAP: AtomicBool = AtomicBool::new(false);
static TRACKED_RUNS: AtomicUsize = AtomicUsize::new(0);

/// Records whether two executions of the same instance ever overlap.
#[derive(Default, Serialize, Deserialize, DataSchema)]
struct Tracked {}

#[async_trait]
impl StepBody for Tracked {
    async fn run(&mut self, ctx: &StepContext) -> anyhow::Result<ExecutionResult> {
        if !RUNNING.lock().unwrap().insert(ctx.instance_id.clone()) {
            OVERLAP.store(true, Ordering::SeqCst);
        }
        TRACKED_RUNS.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        RUNNING.lock().unwrap().remove(&ctx.instance_id);
        Ok(ExecutionResult::proceed())
    }
}

static GATE_STARTED: LazyLock<Notify> = LazyLock::new(Notify::new);
static GATE_RELEASE: LazyLock<Notify> = LazyLock::new(Notify::new);

/// Blocks mid-step until the test releases it.
#[derive(Default, Serialize, Deserialize, DataSchema)]
struct Gate {}

#[async_trait]
impl StepBody for Gate {
    async fn run(&mut self, _ctx: &StepContext) -> anyhow::Result<ExecutionResult> {
        GATE_STARTED.notify_one();
        GATE_RELEASE.notified().await;
        Ok(ExecutionResult::proceed())
    }
}

#[derive(Default, Serialize, Deserialize, DataSchema)]
struct Slow {}

#[async_trait]
impl StepBody for Slow {
    async fn run(&mut self, _ctx: &StepContext) -> anyhow::Result<ExecutionResult> {
        tokio::time::sleep(Duration::from_millis(800)).await;
        Ok(ExecutionResult::proceed())
    }
}

fn tracked() -> WorkflowDefinition {
    WorkflowBuilder::<Numbers>::new("tracked", 1)
        .start_with::<Tracked>()
        .then::<Tracked>()
        .then::<Tracked>()
        .then::<Tracked>()
        .then::<Tracked>()
        .build()
        .unwrap()
}

fn add() -> WorkflowDefinition {
    WorkflowBuilder::<Numbers>::new("add", 1)
        .start_with::<AddNumbers>()
        .input("input1", "value1")
        .input("input2", "value2")
        .output("value3", "output")
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_two_nodes_never_run_an_instance_concurrently() {
    let provider = InMemoryProvider::new();
    let config = fast_config().with_worker_count(NonZeroUsize::new(8).unwrap());
    let node_a = WorkflowHost::new(EngineContext::new(
        provider.clone(),
        config.clone().with_node_id("node-a"),
    ));
    let node_b = WorkflowHost::new(EngineContext::new(
        provider.clone(),
        config.with_node_id("node-b"),
    ));
    node_a.register_workflow(tracked()).unwrap();
    node_b.register_workflow(tracked()).unwrap();
    node_a.start();
    node_b.start();

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(
            node_a
                .start_workflow("tracked", None, &Numbers::default())
                .await
                .unwrap(),
        );
    }
    for id in &ids {
        let instance = wait_for_terminal(&node_b, id).await;
        assert_eq!(instance.status, WorkflowStatus::Complete);
        assert_eq!(instance.step_history.len(), 5);
    }

    node_a.stop().await;
    node_b.stop().await;

    assert!(!OVERLAP.load(Ordering::SeqCst));
    assert_eq!(TRACKED_RUNS.load(Ordering::SeqCst), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_external_write_wins_over_running_step() {
    let (host, _) = host(fast_config());
    let host = Arc::new(host);
    host.register_workflow(
        WorkflowBuilder::<Numbers>::new("gated", 1)
            .start_with::<Gate>()
            .build()
            .unwrap(),
    )
    .unwrap();

    let id = host
        .start_workflow("gated", None, &Numbers::default())
        .await
        .unwrap();
    let running = tokio::spawn({
        let host = Arc::clone(&host);
        let id = id.clone();
        async move { host.step_once(&id).await }
    });

    GATE_STARTED.notified().await;
    assert!(host.terminate_workflow(&id, "operator").await.unwrap());
    GATE_RELEASE.notify_one();

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome, CycleOutcome::Conflict);

    let instance = host.get_instance(&id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Terminated);
    assert_eq!(instance.error.as_deref(), Some("operator"));
    assert!(instance.step_history.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_lease_is_recovered() {
    let (host, provider) = host(fast_config());
    host.register_workflow(add()).unwrap();

    let data = Numbers {
        value1: 20,
        value2: 22,
        ..Default::default()
    };
    let id = host.start_workflow("add", None, &data).await.unwrap();

    // A worker on another node leases the instance, reads it and then dies
    let crashed = provider
        .acquire_lease(&id, "crashed-node-0", ChronoDuration::milliseconds(200))
        .await
        .unwrap()
        .unwrap();
    let mut stale = provider.get_instance(&id).await.unwrap();

    assert_eq!(host.step_once(&id).await.unwrap(), CycleOutcome::Busy);

    host.start();
    let instance = wait_for_terminal(&host, &id).await;
    host.stop().await;

    assert_eq!(instance.status, WorkflowStatus::Complete);
    assert_eq!(instance.data_as::<Numbers>().unwrap().value3, 42);
    assert!(instance.step_history[0].started_at >= crashed.expires_at);

    // The crashed worker's late write is rejected
    stale.data["value3"] = serde_json::json!(-1);
    assert!(matches!(
        provider.persist_instance(&stale).await,
        Err(PersistenceError::ConcurrencyConflict { .. })
    ));
    assert!(matches!(
        provider.release_lease(&crashed).await,
        Err(PersistenceError::LeaseLost(_))
    ));
    assert_eq!(
        host.get_instance(&id).await.unwrap().data_as::<Numbers>().unwrap().value3,
        42
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heartbeat_keeps_lease_alive() {
    let config = fast_config()
        .with_lease_ttl(Duration::from_millis(300))
        .with_heartbeat_interval(Some(Duration::from_millis(50)));
    let (host, provider) = host(config);
    let host = Arc::new(host);
    host.register_workflow(
        WorkflowBuilder::<Numbers>::new("slow", 1)
            .start_with::<Slow>()
            .build()
            .unwrap(),
    )
    .unwrap();

    let id = host
        .start_workflow("slow", None, &Numbers::default())
        .await
        .unwrap();
    let running = tokio::spawn({
        let host = Arc::clone(&host);
        let id = id.clone();
        async move { host.step_once(&id).await }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    let intruder = provider
        .acquire_lease(&id, "intruder", ChronoDuration::seconds(30))
        .await
        .unwrap();
    assert!(intruder.is_none());

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome, CycleOutcome::Persisted(WorkflowStatus::Complete));
    assert!(provider.current_lease(&id).is_none());
    assert!(provider.list_runnable(Utc::now(), 10).await.unwrap().is_empty());
}

/// Counts heartbeat extensions on top of the in-memory provider.
#[derive(Clone)]
struct CountingProvider {
    inner: InMemoryProvider,
    extends: Arc<AtomicUsize>,
}

#[async_trait]
impl PersistenceProvider for CountingProvider {
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<String, PersistenceError> {
        self.inner.create_instance(instance).await
    }

    async fn get_instance(&self, instance_id: &str) -> Result<WorkflowInstance, PersistenceError> {
        self.inner.get_instance(instance_id).await
    }

    async fn persist_instance(&self, instance: &WorkflowInstance) -> Result<u64, PersistenceError> {
        self.inner.persist_instance(instance).await
    }

    async fn list_runnable(
        &self,
        before: chrono::DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, PersistenceError> {
        self.inner.list_runnable(before, limit).await
    }

    async fn acquire_lease(
        &self,
        instance_id: &str,
        owner: &str,
        ttl: ChronoDuration,
    ) -> Result<Option<Lease>, PersistenceError> {
        self.inner.acquire_lease(instance_id, owner, ttl).await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), PersistenceError> {
        self.inner.release_lease(lease).await
    }

    async fn extend_lease(&self, lease: &Lease, ttl: ChronoDuration) -> Result<Lease, PersistenceError> {
        self.extends.fetch_add(1, Ordering::SeqCst);
        self.inner.extend_lease(lease, ttl).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heartbeat_stops_once_lease_is_lost() {
    let provider = CountingProvider {
        inner: InMemoryProvider::new(),
        extends: Arc::new(AtomicUsize::new(0)),
    };
    let config = fast_config()
        .with_lease_ttl(Duration::from_millis(300))
        .with_heartbeat_interval(Some(Duration::from_millis(50)));
    let host = Arc::new(WorkflowHost::new(EngineContext::new(provider.clone(), config)));
    host.register_workflow(
        WorkflowBuilder::<Numbers>::new("slow", 1)
            .start_with::<Slow>()
            .build()
            .unwrap(),
    )
    .unwrap();

    let id = host
        .start_workflow("slow", None, &Numbers::default())
        .await
        .unwrap();
    let running = tokio::spawn({
        let host = Arc::clone(&host);
        let id = id.clone();
        async move { host.step_once(&id).await }
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(provider.extends.load(Ordering::SeqCst) >= 1);

    // Take the lease away from the running worker
    let held = provider.inner.current_lease(&id).unwrap();
    provider.inner.release_lease(&held).await.unwrap();
    let intruder = provider
        .inner
        .acquire_lease(&id, "intruder", ChronoDuration::seconds(30))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let extends_after_loss = provider.extends.load(Ordering::SeqCst);

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome, CycleOutcome::Persisted(WorkflowStatus::Complete));
    assert_eq!(provider.extends.load(Ordering::SeqCst), extends_after_loss);

    let current = provider.inner.current_lease(&id).unwrap();
    assert_eq!(current.token, intruder.token);
    assert_eq!(current.expires_at, intruder.expires_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_definition_is_left_for_other_nodes() {
    let provider = InMemoryProvider::new();
    let old_node = WorkflowHost::new(EngineContext::new(
        provider.clone(),
        fast_config().with_node_id("old-node"),
    ));
    let new_node = WorkflowHost::new(EngineContext::new(
        provider.clone(),
        fast_config().with_node_id("new-node"),
    ));
    new_node.register_workflow(add()).unwrap();

    let data = Numbers {
        value1: 4,
        value2: 5,
        ..Default::default()
    };
    let id = new_node.start_workflow("add", None, &data).await.unwrap();

    assert_eq!(old_node.step_once(&id).await.unwrap(), CycleOutcome::Skipped);
    let instance = old_node.get_instance(&id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Runnable);
    assert_eq!(instance.execution_pointer, 0);
    assert!(instance.error.is_none());
    assert!(provider.current_lease(&id).is_none());

    assert_eq!(
        new_node.step_once(&id).await.unwrap(),
        CycleOutcome::Persisted(WorkflowStatus::Complete)
    );
    let instance = new_node.get_instance(&id).await.unwrap();
    assert_eq!(instance.data_as::<Numbers>().unwrap().value3, 9);
}
