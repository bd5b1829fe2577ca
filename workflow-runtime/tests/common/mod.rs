#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;
use workflow_core::{DataSchema, ExecutionResult, StepBody, StepContext, WorkflowInstance};
use workflow_runtime::{EngineConfig, EngineContext, InMemoryProvider, RetryPolicy, WorkflowHost};

#[derive(Debug, Default, Clone, Serialize, Deserialize, DataSchema)]
pub struct Numbers {
    pub value1: i64,
    pub value2: i64,
    pub value3: i64,
    pub label: String,
    pub maybe: Option<i64>,
    pub wake_at: Option<DateTime<Utc>>,
    pub failures: u32,
}

#[derive(Default, Serialize, Deserialize, DataSchema)]
pub struct AddNumbers {
    pub input1: i64,
    pub input2: i64,
    pub output: i64,
}

#[async_trait]
impl StepBody for AddNumbers {
    async fn run(&mut self, _ctx: &StepContext) -> anyhow::Result<ExecutionResult> {
        self.output = self.input1 + self.input2;
        Ok(ExecutionResult::proceed())
    }
}

/// Sleeps until `wake_at`, then proceeds.
#[derive(Default, Serialize, Deserialize, DataSchema)]
pub struct SleepUntil {
    pub wake_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl StepBody for SleepUntil {
    async fn run(&mut self, _ctx: &StepContext) -> anyhow::Result<ExecutionResult> {
        match self.wake_at {
            Some(at) if at > Utc::now() => Ok(ExecutionResult::sleep_until(at)),
            _ => Ok(ExecutionResult::proceed()),
        }
    }
}

/// Fails with a retryable error on its first `failures` attempts.
#[derive(Default, Serialize, Deserialize, DataSchema)]
pub struct Flaky {
    pub failures: u32,
    pub attempts: i64,
}

#[async_trait]
impl StepBody for Flaky {
    async fn run(&mut self, ctx: &StepContext) -> anyhow::Result<ExecutionResult> {
        self.attempts = i64::from(ctx.attempt) + 1;
        if ctx.attempt < self.failures {
            return Ok(ExecutionResult::retry(format!("attempt {} failed", ctx.attempt)));
        }
        Ok(ExecutionResult::proceed())
    }
}

pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_node_id("test-node")
        .with_worker_count(NonZeroUsize::new(4).unwrap())
        .with_poll_interval(Duration::from_millis(20))
        .with_lease_ttl(Duration::from_secs(30))
        .with_heartbeat_interval(None)
        .with_stop_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy::immediate(Some(3)))
}

pub fn host(config: EngineConfig) -> (WorkflowHost, InMemoryProvider) {
    let provider = InMemoryProvider::new();
    let host = WorkflowHost::new(EngineContext::new(provider.clone(), config));
    (host, provider)
}

pub async fn wait_for_terminal(host: &WorkflowHost, id: &str) -> WorkflowInstance {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let instance = host.get_instance(id).await.unwrap();
        if instance.is_terminal() {
            return instance;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "instance {id} still {:?} at pointer {}",
            instance.status,
            instance.execution_pointer
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
