//! Shared fixtures for the lock store and scheduler integration tests.
//! Everything runs against real SQLite files in temp dirs — no mocks of the
//! coordination substrate itself.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tempfile::TempDir;

use shoal::{
    AgentExecution, AgentRegistry, AgentScheduler, AlwaysEnabled, CachingAgent, IntervalPolicy,
    IntervalResolver, LockStore, NodeIdentity, NodeStatusProvider, StaticConfigSource, WorkerPool,
};

pub type ExecutionLog = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> ExecutionLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub struct TestAgent(pub String);

impl CachingAgent for TestAgent {
    fn agent_type(&self) -> &str {
        &self.0
    }
}

/// Records every execution into a shared log; optionally sleeps (to keep the
/// lock live across overlapping ticks) and optionally fails.
pub struct RecordingExecution {
    pub log: ExecutionLog,
    pub delay: Duration,
    pub fail: bool,
}

#[async_trait]
impl AgentExecution for RecordingExecution {
    async fn execute(&self, agent: Arc<dyn CachingAgent>) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(agent.agent_type().to_string());
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            bail!("injected failure for {}", agent.agent_type());
        }
        Ok(())
    }
}

pub fn register(
    registry: &AgentRegistry,
    name: &str,
    log: &ExecutionLog,
    delay: Duration,
    fail: bool,
) {
    registry.register(
        Arc::new(TestAgent(name.to_string())),
        Arc::new(RecordingExecution {
            log: Arc::clone(log),
            delay,
            fail,
        }),
    );
}

/// Node status stuck at disabled, for eligibility-gate tests.
pub struct Disabled;

impl NodeStatusProvider for Disabled {
    fn is_enabled(&self) -> bool {
        false
    }
}

/// Agents are always due and leases run long enough to stay live for the
/// whole execution.
pub fn always_due() -> IntervalResolver {
    IntervalResolver::new(IntervalPolicy {
        poll: Duration::ZERO,
        error: Duration::ZERO,
        timeout: Duration::from_secs(900),
    })
}

pub async fn open_store(dir: &TempDir) -> Arc<LockStore> {
    Arc::new(
        LockStore::open(&dir.path().join("locks.db"), "")
            .await
            .expect("lock store open failed"),
    )
}

pub fn build_scheduler(
    node: &str,
    registry: Arc<AgentRegistry>,
    store: Arc<LockStore>,
    config: Arc<StaticConfigSource>,
    capacity: usize,
    intervals: IntervalResolver,
    status: Arc<dyn NodeStatusProvider>,
) -> AgentScheduler {
    AgentScheduler::new(
        NodeIdentity::from_string(node),
        registry,
        store,
        config,
        status,
        intervals,
        WorkerPool::new(capacity),
        Duration::from_millis(10),
    )
}

pub fn make_scheduler(
    node: &str,
    registry: Arc<AgentRegistry>,
    store: Arc<LockStore>,
    config: Arc<StaticConfigSource>,
    capacity: usize,
) -> AgentScheduler {
    build_scheduler(
        node,
        registry,
        store,
        config,
        capacity,
        always_due(),
        Arc::new(AlwaysEnabled),
    )
}

/// Wait until every dispatched execution has completed and released its lock.
pub async fn wait_for_idle(store: &LockStore) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if store.list().await.expect("lock listing failed").is_empty() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "locks were not released within the test deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
