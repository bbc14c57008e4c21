//! shoal — fleet-coordinated caching agent scheduler.
//!
//! Runs named units of periodic polling work ("caching agents") roughly
//! exactly-once across a fleet of stateless replicas, coordinating purely
//! through a shared SQL lock table: optimistic unique-key inserts for mutual
//! exclusion, age-based reclamation for crash recovery, and a re-randomized
//! selection shuffle for fairness across shards. No consensus service, no
//! node-to-node RPC.
//!
//! Embedders construct an [`AgentRegistry`], register their agents, and hand
//! everything to an [`AgentScheduler`]; the `shoald` binary does the same
//! wiring for command agents declared in `config.toml`.

pub mod agent;
pub mod command;
pub mod config;
pub mod identity;
pub mod intervals;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod worker;

pub use agent::{AgentExecution, CachingAgent};
pub use command::CommandAgent;
pub use config::{DynamicConfigSource, FileConfigSource, Settings, StaticConfigSource};
pub use identity::NodeIdentity;
pub use intervals::{IntervalPolicy, IntervalResolver};
pub use registry::{AgentRegistry, RegisteredAgent};
pub use scheduler::{AgentScheduler, TickReport};
pub use status::{AlwaysEnabled, DrainFile, NodeStatusProvider};
pub use storage::{AgentLockRow, LockStore, LockStoreError};
pub use worker::WorkerPool;
