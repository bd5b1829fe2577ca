mod common;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use common::{AddNumbers, Numbers, fast_config, host, wait_for_terminal};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::Notify;
use workflow_core::{
    DataSchema, ExecutionResult, StepBody, StepContext, WorkflowBuilder, WorkflowStatus,
};
use workflow_runtime::{CycleOutcome, InMemoryProvider, PersistenceProvider};

/// Ignores cancellation and never finishes on its own.
#[derive(Default, Serialize, Deserialize, DataSchema)]
struct Stubborn {}

#[async_trait]
impl StepBody for Stubborn {
    async fn run(&mut self, _ctx: &StepContext) -> anyhow::Result<ExecutionResult> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ExecutionResult::proceed())
    }
}

#[derive(Default, Serialize, Deserialize, DataSchema)]
struct Explode {}

#[async_trait]
impl StepBody for Explode {
    async fn run(&mut self, _ctx: &StepContext) -> anyhow::Result<ExecutionResult> {
        panic!("step exploded");
    }
}

static PATIENT_STARTED: LazyLock<Notify> = LazyLock::new(Notify::new);

/// Waits for shutdown, then reports whether it saw the cancellation.
#[derive(Default, Serialize, Deserialize, DataSchema)]
struct Patient {
    observed: i64,
}

#[async_trait]
impl StepBody for Patient {
    async fn run(&mut self, ctx: &StepContext) -> anyhow::Result<ExecutionResult> {
        PATIENT_STARTED.notify_one();
        ctx.cancelled().await;
        self.observed = i64::from(ctx.is_cancelled());
        Ok(ExecutionResult::proceed())
    }
}

async fn wait_for_lease(provider: &InMemoryProvider, id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while provider.current_lease(id).is_none() {
        assert!(tokio::time::Instant::now() < deadline, "instance {id} was never leased");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lease_expires_after_stop_timeout() {
    let config = fast_config()
        .with_worker_count(NonZeroUsize::new(1).unwrap())
        .with_lease_ttl(Duration::from_millis(300))
        .with_heartbeat_interval(Some(Duration::from_millis(50)))
        .with_stop_timeout(Duration::from_millis(200));
    let (host, provider) = host(config);
    host.register_workflow(
        WorkflowBuilder::<Numbers>::new("stubborn", 1)
            .start_with::<Stubborn>()
            .build()
            .unwrap(),
    )
    .unwrap();
    host.start();

    let id = host
        .start_workflow("stubborn", None, &Numbers::default())
        .await
        .unwrap();
    wait_for_lease(&provider, &id).await;

    host.stop().await;
    assert!(!host.is_running());

    // The aborted cycle's heartbeat must not keep the lease alive
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(provider.current_lease(&id).is_none());

    let instance = provider.get_instance(&id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Runnable);
    assert_eq!(instance.execution_pointer, 0);
    assert!(instance.step_history.is_empty());

    let next = provider
        .acquire_lease(&id, "other-node-0", ChronoDuration::seconds(30))
        .await
        .unwrap();
    assert!(next.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_step_terminates_and_frees_lease() {
    let config = fast_config()
        .with_lease_ttl(Duration::from_millis(300))
        .with_heartbeat_interval(Some(Duration::from_millis(50)));
    let (host, provider) = host(config);
    host.register_workflow(
        WorkflowBuilder::<Numbers>::new("explode", 1)
            .start_with::<Explode>()
            .build()
            .unwrap(),
    )
    .unwrap();

    let id = host
        .start_workflow("explode", None, &Numbers::default())
        .await
        .unwrap();
    let outcome = host.step_once(&id).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Persisted(WorkflowStatus::Terminated));

    let instance = host.get_instance(&id).await.unwrap();
    let error = instance.error.unwrap();
    assert!(error.contains("step panicked: step exploded"), "{error}");
    assert!(provider.current_lease(&id).is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(provider.current_lease(&id).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_survives_panicking_step() {
    let config = fast_config().with_worker_count(NonZeroUsize::new(1).unwrap());
    let (host, _) = host(config);
    host.register_workflow(
        WorkflowBuilder::<Numbers>::new("explode", 1)
            .start_with::<Explode>()
            .build()
            .unwrap(),
    )
    .unwrap();
    host.register_workflow(
        WorkflowBuilder::<Numbers>::new("add", 1)
            .start_with::<AddNumbers>()
            .input("input1", "value1")
            .input("input2", "value2")
            .output("value3", "output")
            .build()
            .unwrap(),
    )
    .unwrap();
    host.start();

    let exploded = host
        .start_workflow("explode", None, &Numbers::default())
        .await
        .unwrap();
    let instance = wait_for_terminal(&host, &exploded).await;
    assert_eq!(instance.status, WorkflowStatus::Terminated);

    let data = Numbers {
        value1: 2,
        value2: 3,
        ..Default::default()
    };
    let added = host.start_workflow("add", None, &data).await.unwrap();
    let instance = wait_for_terminal(&host, &added).await;
    assert_eq!(instance.status, WorkflowStatus::Complete);
    assert_eq!(instance.data_as::<Numbers>().unwrap().value3, 5);

    host.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_lets_cancelled_step_finish() {
    let config = fast_config().with_stop_timeout(Duration::from_secs(5));
    let (host, provider) = host(config);
    host.register_workflow(
        WorkflowBuilder::<Numbers>::new("patient", 1)
            .start_with::<Patient>()
            .output("value3", "observed")
            .build()
            .unwrap(),
    )
    .unwrap();
    host.start();

    let id = host
        .start_workflow("patient", None, &Numbers::default())
        .await
        .unwrap();
    PATIENT_STARTED.notified().await;

    host.stop().await;

    // The step's result is persisted before stop returns
    let instance = host.get_instance(&id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Complete);
    assert_eq!(instance.data_as::<Numbers>().unwrap().value3, 1);
    assert!(provider.current_lease(&id).is_none());
}
