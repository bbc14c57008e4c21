//! In-memory agent registry.
//!
//! Caching subsystems register their agents here once at startup; the
//! scheduler snapshots the registry every tick. The registry is injected
//! into the scheduler rather than living as a process-wide singleton, which
//! keeps the scheduler testable against fake registries.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::agent::{AgentExecution, CachingAgent};

/// An agent paired with its execution, as stored in the registry.
#[derive(Clone)]
pub struct RegisteredAgent {
    pub agent: Arc<dyn CachingAgent>,
    pub execution: Arc<dyn AgentExecution>,
}

impl RegisteredAgent {
    pub fn agent_type(&self) -> &str {
        self.agent.agent_type()
    }
}

/// Thread-safe map from agent type to its registered execution.
#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<HashMap<String, RegisteredAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert keyed by `agent_type()`. Re-registering an existing
    /// type replaces the prior entry — last writer wins.
    pub fn register(&self, agent: Arc<dyn CachingAgent>, execution: Arc<dyn AgentExecution>) {
        let name = agent.agent_type().to_string();
        let entry = RegisteredAgent { agent, execution };
        let mut map = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if map.insert(name.clone(), entry).is_some() {
            debug!(agent = %name, "replaced existing agent registration");
        }
    }

    /// One tick's view of the registry, sorted by agent type for stable logs.
    pub fn snapshot(&self) -> Vec<RegisteredAgent> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut agents: Vec<RegisteredAgent> = map.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_type().cmp(b.agent_type()));
        agents
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NamedAgent(&'static str);

    impl CachingAgent for NamedAgent {
        fn agent_type(&self) -> &str {
            self.0
        }
    }

    struct TaggedExecution {
        tag: &'static str,
        log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl AgentExecution for TaggedExecution {
        async fn execute(&self, _agent: Arc<dyn CachingAgent>) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.tag);
            Ok(())
        }
    }

    fn tagged(tag: &'static str, log: &Arc<std::sync::Mutex<Vec<&'static str>>>) -> Arc<TaggedExecution> {
        Arc::new(TaggedExecution {
            tag,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn register_and_snapshot() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = AgentRegistry::new();
        registry.register(Arc::new(NamedAgent("b")), tagged("b", &log));
        registry.register(Arc::new(NamedAgent("a")), tagged("a", &log));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        // Sorted by type.
        assert_eq!(snapshot[0].agent_type(), "a");
        assert_eq!(snapshot[1].agent_type(), "b");
    }

    #[tokio::test]
    async fn duplicate_registration_replaces() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = AgentRegistry::new();
        registry.register(Arc::new(NamedAgent("a")), tagged("one", &log));
        registry.register(Arc::new(NamedAgent("a")), tagged("two", &log));

        assert_eq!(registry.len(), 1);
        let entry = registry.snapshot().remove(0);
        entry
            .execution
            .execute(Arc::clone(&entry.agent))
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["two"], "last writer wins");
    }

    #[test]
    fn empty_registry() {
        let registry = AgentRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }
}
