//! Command agents — the built-in consumer of the agent contract.
//!
//! Each `[[agents]]` entry in `config.toml` becomes one [`CommandAgent`]
//! whose execution spawns the configured command and treats a non-zero exit
//! as a failed run. Embedding crates register their own [`CachingAgent`] /
//! [`AgentExecution`] implementations instead.

use std::sync::Arc;

use anyhow::{bail, Context as _};
use async_trait::async_trait;

use crate::agent::{AgentExecution, CachingAgent};
use crate::config::AgentEntry;
use crate::intervals::IntervalPolicy;

pub struct CommandAgent {
    name: String,
    command: String,
    interval: Option<IntervalPolicy>,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            interval: None,
        }
    }

    pub fn with_interval(mut self, interval: IntervalPolicy) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Build from a config entry; partial cadence fields fall back to
    /// `defaults`, and an entry with no cadence fields defers entirely to the
    /// interval resolver.
    pub fn from_entry(entry: &AgentEntry, defaults: IntervalPolicy) -> Self {
        let agent = Self::new(&entry.name, &entry.command);
        if entry.poll_ms.is_none() && entry.error_ms.is_none() && entry.timeout_ms.is_none() {
            return agent;
        }
        agent.with_interval(IntervalPolicy {
            poll: entry
                .poll_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or(defaults.poll),
            error: entry
                .error_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or(defaults.error),
            timeout: entry
                .timeout_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or(defaults.timeout),
        })
    }
}

impl CachingAgent for CommandAgent {
    fn agent_type(&self) -> &str {
        &self.name
    }

    fn interval_override(&self) -> Option<IntervalPolicy> {
        self.interval
    }
}

#[async_trait]
impl AgentExecution for CommandAgent {
    async fn execute(&self, _agent: Arc<dyn CachingAgent>) -> anyhow::Result<()> {
        let parts: Vec<&str> = self.command.split_whitespace().collect();
        let Some((program, args)) = parts.split_first() else {
            bail!("agent {:?} has an empty command", self.name);
        };

        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawning {program:?}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "command exited with {}: {}",
                output.status,
                stderr.trim_end()
            );
        }
        Ok(())
    }
}
