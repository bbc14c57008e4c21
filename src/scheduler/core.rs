// SPDX-License-Identifier: MIT
//! The tick loop.
//!
//! A single periodic task reconciles the agent registry against the lock
//! store and the dynamic config, claims locks for a fair subset of due
//! agents, and hands winners to the worker pool. All cross-node coordination
//! happens through the lock table's unique key; everything else here is
//! process-local.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{
    keys, DynamicConfigSource, DEFAULT_ENABLED_PATTERN, DEFAULT_MAX_CONCURRENT_AGENTS,
    DEFAULT_RELEASE_THRESHOLD_MS,
};
use crate::identity::NodeIdentity;
use crate::intervals::{IntervalPolicy, IntervalResolver};
use crate::registry::{AgentRegistry, RegisteredAgent};
use crate::status::NodeStatusProvider;
use crate::storage::{now_ms, LockStore, LockStoreError};
use crate::worker::WorkerPool;

use super::selection::{filter_candidates, parse_disabled, select_fair};

/// What one tick did. Logged at debug and asserted on in tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Stale locks deleted before selection.
    pub reclaimed: u64,
    /// Due, enabled, unlocked agents before capping.
    pub candidates: usize,
    /// Candidates kept after the fairness shuffle and cap.
    pub selected: usize,
    /// Lock claims won by this node.
    pub claimed: usize,
    /// Executions actually handed to the worker pool.
    pub dispatched: usize,
    /// Claims lost to another node. Expected, silent.
    pub contended: usize,
    /// Claims won but dropped because the pool was full (lock released).
    pub saturated: usize,
}

/// Outcome of the most recent run, kept per agent to decide due-ness.
struct RunRecord {
    finished_at: Instant,
    failed: bool,
}

/// Process-local execution history. Cross-node due-ness converges through
/// the lock table alone; this only spaces out runs on the node that did them.
#[derive(Default)]
struct RunHistory {
    inner: RwLock<HashMap<String, RunRecord>>,
}

impl RunHistory {
    fn is_due(&self, agent_type: &str, policy: &IntervalPolicy) -> bool {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        match map.get(agent_type) {
            None => true,
            Some(record) => {
                let delay = if record.failed {
                    policy.error
                } else {
                    policy.poll
                };
                record.finished_at.elapsed() >= delay
            }
        }
    }

    fn record(&self, agent_type: &str, failed: bool) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(
            agent_type.to_string(),
            RunRecord {
                finished_at: Instant::now(),
                failed,
            },
        );
    }
}

pub struct AgentScheduler {
    node_id: NodeIdentity,
    registry: Arc<AgentRegistry>,
    locks: Arc<LockStore>,
    config: Arc<dyn DynamicConfigSource>,
    status: Arc<dyn NodeStatusProvider>,
    intervals: IntervalResolver,
    pool: WorkerPool,
    poll_interval: std::time::Duration,
    history: Arc<RunHistory>,
    // Compiled enabled-pattern, cached until the raw string changes.
    pattern_cache: Mutex<(String, Option<Regex>)>,
}

impl AgentScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeIdentity,
        registry: Arc<AgentRegistry>,
        locks: Arc<LockStore>,
        config: Arc<dyn DynamicConfigSource>,
        status: Arc<dyn NodeStatusProvider>,
        intervals: IntervalResolver,
        pool: WorkerPool,
        poll_interval: std::time::Duration,
    ) -> Self {
        Self {
            node_id,
            registry,
            locks,
            config,
            status,
            intervals,
            pool,
            poll_interval,
            history: Arc::new(RunHistory::default()),
            pattern_cache: Mutex::new((String::new(), None)),
        }
    }

    pub fn node_id(&self) -> &NodeIdentity {
        &self.node_id
    }

    /// Drive [`Self::tick`] on the configured cadence until shutdown flips.
    ///
    /// A failed tick is logged and retried next cycle; nothing here is
    /// allowed to end the loop besides the shutdown signal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            node = %self.node_id,
            interval_ms = self.poll_interval.as_millis() as u64,
            workers = self.pool.capacity(),
            "agent scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if report.dispatched > 0 || report.reclaimed > 0 => {
                            debug!(?report, "tick complete");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(err = %e, "tick aborted; retrying next cycle"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(node = %self.node_id, "agent scheduler stopping");
                    break;
                }
            }
        }
    }

    /// One reconciliation pass.
    ///
    /// Any lock-store failure aborts the remainder of the pass; already
    /// dispatched executions finish and release their own locks.
    pub async fn tick(&self) -> Result<TickReport, LockStoreError> {
        let mut report = TickReport::default();

        if !self.status.is_enabled() {
            debug!(node = %self.node_id, "node disabled; skipping tick");
            return Ok(report);
        }

        // Knobs are re-read every tick so they apply without a restart.
        let max_concurrent = self
            .config
            .get_int(keys::MAX_CONCURRENT_AGENTS, DEFAULT_MAX_CONCURRENT_AGENTS)
            .max(0) as usize;
        let disabled_raw = self.config.get_string(keys::DISABLED_AGENTS, "");
        let release_threshold_ms = self
            .config
            .get_long(keys::RELEASE_THRESHOLD_MS, DEFAULT_RELEASE_THRESHOLD_MS)
            .max(0);
        let pattern_raw = self
            .config
            .get_string(keys::ENABLED_PATTERN, DEFAULT_ENABLED_PATTERN);

        let now = now_ms();

        // Crashed owners first, so their agents are claimable this same tick.
        report.reclaimed = self.locks.reclaim_stale(now, release_threshold_ms).await?;
        if report.reclaimed > 0 {
            info!(count = report.reclaimed, "reclaimed stale agent locks");
        }

        let live = self.locks.live_locks(now).await?;
        let disabled = parse_disabled(&disabled_raw);
        let pattern = self.enabled_pattern(&pattern_raw);

        let candidates = filter_candidates(
            self.registry.snapshot(),
            pattern.as_ref(),
            &disabled,
            &live,
            |candidate| {
                let policy = self.intervals.interval_for(candidate.agent.as_ref());
                self.history.is_due(candidate.agent_type(), &policy)
            },
        );
        report.candidates = candidates.len();

        let selected = select_fair(candidates, max_concurrent);
        report.selected = selected.len();

        for candidate in selected {
            let name = candidate.agent_type().to_string();
            let policy = self.intervals.interval_for(candidate.agent.as_ref());
            let expires_at = now + policy.timeout.as_millis() as i64;

            if !self
                .locks
                .try_acquire(&name, self.node_id.as_str(), now, expires_at)
                .await?
            {
                // Another node won the insert race.
                report.contended += 1;
                continue;
            }
            report.claimed += 1;

            let fut = run_agent(
                name.clone(),
                candidate,
                Arc::clone(&self.locks),
                self.node_id.clone(),
                Arc::clone(&self.history),
            );
            if self.pool.try_dispatch(fut) {
                report.dispatched += 1;
            } else {
                // Backpressure: give the claim back instead of queueing.
                report.saturated += 1;
                debug!(agent = %name, "worker pool full; releasing fresh claim");
                self.locks.release(&name, self.node_id.as_str()).await?;
            }
        }

        if report.contended > 0 {
            debug!(count = report.contended, "lost claim races to other nodes");
        }

        Ok(report)
    }

    /// Compile the enabled-agent pattern, caching per raw string. An invalid
    /// pattern falls back to allowing all agents (the configured default).
    fn enabled_pattern(&self, raw: &str) -> Option<Regex> {
        let mut cache = self
            .pattern_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if cache.0 != raw {
            let compiled = match Regex::new(raw) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %raw, err = %e, "invalid enabled-agent pattern; allowing all agents");
                    None
                }
            };
            *cache = (raw.to_string(), compiled);
        }
        cache.1.clone()
    }
}

/// Execute one claimed agent and run its completion continuation: record the
/// outcome for due-ness, then delete the lock so the agent is schedulable
/// again immediately instead of waiting out the lease.
async fn run_agent(
    name: String,
    candidate: RegisteredAgent,
    locks: Arc<LockStore>,
    node_id: NodeIdentity,
    history: Arc<RunHistory>,
) {
    let started = Instant::now();
    let agent = Arc::clone(&candidate.agent);
    let execution = Arc::clone(&candidate.execution);

    // Executions run in their own task so a panic is contained and surfaces
    // as a JoinError instead of skipping the completion continuation.
    let outcome = tokio::spawn(async move { execution.execute(agent).await }).await;
    let failed = match outcome {
        Ok(Ok(())) => {
            debug!(
                agent = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "agent execution completed"
            );
            false
        }
        Ok(Err(e)) => {
            warn!(agent = %name, err = %e, "agent execution failed");
            true
        }
        Err(e) => {
            warn!(agent = %name, err = %e, "agent execution panicked");
            true
        }
    };

    history.record(&name, failed);

    if let Err(e) = locks.release(&name, node_id.as_str()).await {
        // Not fatal: the row ages out via the release threshold.
        warn!(agent = %name, err = %e, "failed to release agent lock; it will be reclaimed as stale");
    }
}
