//! Agent contract consumed from caching subsystems.
//!
//! A caching subsystem contributes two things per unit of polling work: a
//! [`CachingAgent`] carrying its identity (and optionally a cadence
//! override), and an [`AgentExecution`] that performs the actual fetch.
//! Both are registered once at startup and stay immutable for the process
//! lifetime.

use std::sync::Arc;

use async_trait::async_trait;

use crate::intervals::IntervalPolicy;

/// A named unit of periodic polling work.
///
/// `agent_type` is the cluster-wide identity and may embed shard info, e.g.
/// `"account/KubernetesCoreCachingAgent[2/4]"`. The scheduler treats it as an
/// opaque key into the lock table.
pub trait CachingAgent: Send + Sync {
    fn agent_type(&self) -> &str;

    /// Per-agent cadence override. `None` defers to configured intervals.
    fn interval_override(&self) -> Option<IntervalPolicy> {
        None
    }
}

/// The execution half of the agent contract.
#[async_trait]
pub trait AgentExecution: Send + Sync {
    /// Run one polling cycle for `agent`.
    ///
    /// Errors are isolated per agent: they are logged with the agent's
    /// identity, shift the next run onto the error interval, and never affect
    /// scheduling of other agents.
    async fn execute(&self, agent: Arc<dyn CachingAgent>) -> anyhow::Result<()>;
}
