//! Polling cadence resolution.
//!
//! Every agent type maps to an [`IntervalPolicy`]: how often it should run,
//! how long to back off after a failure, and how long a single execution is
//! expected to take at most. The timeout also sizes the lock lease taken when
//! the agent is claimed.

use std::collections::HashMap;
use std::time::Duration;

use crate::agent::CachingAgent;

/// Default polling cadence: once a minute.
pub const DEFAULT_POLL_MS: u64 = 60_000;
/// Default backoff after a failed execution: five minutes.
pub const DEFAULT_ERROR_MS: u64 = 300_000;
/// Default execution timeout, which also bounds the lock lease: fifteen minutes.
pub const DEFAULT_TIMEOUT_MS: u64 = 900_000;

/// Cadence and lease bounds for one agent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalPolicy {
    /// Delay between successful runs.
    pub poll: Duration,
    /// Delay before the next attempt after a failed run.
    pub error: Duration,
    /// Upper bound on a single execution; sizes the lock's `expires_at`.
    pub timeout: Duration,
}

impl Default for IntervalPolicy {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(DEFAULT_POLL_MS),
            error: Duration::from_millis(DEFAULT_ERROR_MS),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Resolves the effective [`IntervalPolicy`] for an agent.
///
/// Precedence, highest first: the agent's own override, a configured
/// per-type override, the global defaults. Pure lookup — no I/O.
#[derive(Debug, Clone, Default)]
pub struct IntervalResolver {
    defaults: IntervalPolicy,
    overrides: HashMap<String, IntervalPolicy>,
}

impl IntervalResolver {
    pub fn new(defaults: IntervalPolicy) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
        }
    }

    /// Register a per-type override (builder style).
    pub fn with_override(mut self, agent_type: impl Into<String>, policy: IntervalPolicy) -> Self {
        self.overrides.insert(agent_type.into(), policy);
        self
    }

    pub fn defaults(&self) -> IntervalPolicy {
        self.defaults
    }

    pub fn interval_for(&self, agent: &dyn CachingAgent) -> IntervalPolicy {
        agent
            .interval_override()
            .or_else(|| self.overrides.get(agent.agent_type()).copied())
            .unwrap_or(self.defaults)
    }
}
