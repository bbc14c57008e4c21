//! Configuration.
//!
//! Two layers with different lifetimes:
//!
//! - [`Settings`] — startup configuration assembled once from CLI/env args,
//!   `{data_dir}/config.toml`, and built-in defaults (highest priority
//!   first). Changing these requires a restart.
//! - [`DynamicConfigSource`] — runtime knobs re-read by the scheduler on
//!   every tick. The file-backed implementation hot-reloads the `[dynamic]`
//!   table of `config.toml` through a debounced filesystem watcher, so the
//!   knobs can be adjusted on a live fleet.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::intervals::{
    IntervalPolicy, IntervalResolver, DEFAULT_ERROR_MS, DEFAULT_POLL_MS, DEFAULT_TIMEOUT_MS,
};

/// Dynamic config keys consumed by the scheduler each tick.
pub mod keys {
    /// Cap on agents selected (and dispatched) per tick. Int.
    pub const MAX_CONCURRENT_AGENTS: &str = "sql.agent.max-concurrent-agents";
    /// Comma-separated exact-match deny-list of agent names. String.
    pub const DISABLED_AGENTS: &str = "sql.agent.disabled-agents";
    /// Age in milliseconds past which an unreleased lock is reclaimed. Long.
    pub const RELEASE_THRESHOLD_MS: &str = "sql.agent.release-threshold-ms";
    /// Regex allow-list an agent name must match to be scheduled. String.
    pub const ENABLED_PATTERN: &str = "sql.agent.enabled-pattern";
}

pub const DEFAULT_MAX_CONCURRENT_AGENTS: i64 = 1000;
pub const DEFAULT_RELEASE_THRESHOLD_MS: i64 = 300_000;
pub const DEFAULT_ENABLED_PATTERN: &str = ".*";
/// Tick cadence of the scheduler loop.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `[scheduler]` section — startup-only fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerSection {
    /// Tick interval in milliseconds (default: 1000).
    pub poll_interval_ms: Option<u64>,
    /// Worker pool size. Defaults to the max-concurrent-agents knob read at
    /// startup, so the pool accommodates a full tick's dispatch.
    pub worker_capacity: Option<usize>,
    /// Lock table namespace prefix (default: empty → `agent_locks`).
    pub table_prefix: Option<String>,
    /// Lock database path (default: `{data_dir}/shoal.db`).
    pub database: Option<PathBuf>,
}

/// `[intervals]` section — global cadence defaults plus per-type overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntervalsSection {
    pub poll_ms: u64,
    pub error_ms: u64,
    pub timeout_ms: u64,
    /// Per-type overrides, e.g. `[intervals.overrides."account/Foo[1/2]"]`.
    pub overrides: HashMap<String, IntervalOverride>,
}

impl Default for IntervalsSection {
    fn default() -> Self {
        Self {
            poll_ms: DEFAULT_POLL_MS,
            error_ms: DEFAULT_ERROR_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            overrides: HashMap::new(),
        }
    }
}

/// Partial per-type cadence override; unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntervalOverride {
    pub poll_ms: Option<u64>,
    pub error_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl IntervalsSection {
    pub fn defaults(&self) -> IntervalPolicy {
        IntervalPolicy {
            poll: Duration::from_millis(self.poll_ms),
            error: Duration::from_millis(self.error_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    /// Build the resolver the scheduler consults each tick.
    pub fn resolver(&self) -> IntervalResolver {
        let defaults = self.defaults();
        self.overrides
            .iter()
            .fold(IntervalResolver::new(defaults), |resolver, (name, o)| {
                resolver.with_override(
                    name.clone(),
                    IntervalPolicy {
                        poll: o.poll_ms.map(Duration::from_millis).unwrap_or(defaults.poll),
                        error: o
                            .error_ms
                            .map(Duration::from_millis)
                            .unwrap_or(defaults.error),
                        timeout: o
                            .timeout_ms
                            .map(Duration::from_millis)
                            .unwrap_or(defaults.timeout),
                    },
                )
            })
    }
}

/// `[[agents]]` entry — a command agent served by the `shoald` binary.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub name: String,
    pub command: String,
    pub poll_ms: Option<u64>,
    pub error_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
///
/// The `[dynamic]` table is deliberately absent here: it is owned by
/// [`FileConfigSource`], which re-reads it at runtime.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,shoal=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default) | "json".
    log_format: Option<String>,
    scheduler: Option<SchedulerSection>,
    intervals: Option<IntervalsSection>,
    agents: Option<Vec<AgentEntry>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            warn!(path = %path.display(), err = %e, "failed to parse config.toml; using defaults");
            None
        }
    }
}

// ─── Settings ─────────────────────────────────────────────────────────────────

/// Assembled startup configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub database: PathBuf,
    pub log: String,
    pub log_format: String,
    pub poll_interval: Duration,
    pub worker_capacity: Option<usize>,
    pub table_prefix: String,
    pub intervals: IntervalsSection,
    pub agents: Vec<AgentEntry>,
}

impl Settings {
    /// Build settings from CLI/env args + optional TOML file.
    pub fn new(
        data_dir: Option<PathBuf>,
        log: Option<String>,
        poll_interval_ms: Option<u64>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();
        let scheduler = toml.scheduler.unwrap_or_default();

        let poll_interval_ms = poll_interval_ms
            .or(scheduler.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let database = scheduler
            .database
            .unwrap_or_else(|| data_dir.join("shoal.db"));

        Self {
            database,
            log: toml.log.unwrap_or_else(|| "info".to_string()),
            log_format: toml.log_format.unwrap_or_else(|| "pretty".to_string()),
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
            worker_capacity: scheduler.worker_capacity,
            table_prefix: scheduler.table_prefix.unwrap_or_default(),
            intervals: toml.intervals.unwrap_or_default(),
            agents: toml.agents.unwrap_or_default(),
            data_dir,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("shoal");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("shoal");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("shoal");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("shoal");
        }
    }
    PathBuf::from(".shoal")
}

// ─── Dynamic config ───────────────────────────────────────────────────────────

/// Runtime knob lookup. Values may change between ticks; callers must re-read
/// every tick and never cache beyond one.
pub trait DynamicConfigSource: Send + Sync {
    fn get_long(&self, key: &str, default: i64) -> i64;
    fn get_string(&self, key: &str, default: &str) -> String;

    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_long(key, default)
    }
}

/// Fixed in-memory source for tests and embedders with their own delivery
/// mechanism. Knobs can still be flipped between ticks via [`Self::set`].
#[derive(Default)]
pub struct StaticConfigSource {
    values: RwLock<HashMap<String, String>>,
}

impl StaticConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn unset(&self, key: &str) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

impl DynamicConfigSource for StaticConfigSource {
    fn get_long(&self, key: &str, default: i64) -> i64 {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

/// File-backed dynamic config: the `[dynamic]` table of `config.toml`,
/// hot-reloaded on file change.
///
/// Reload failures keep the last-known-good values; a missing file or table
/// means every lookup falls through to its default.
pub struct FileConfigSource {
    path: PathBuf,
    values: Arc<RwLock<HashMap<String, String>>>,
    // Hold the watcher alive; dropping it stops the file watch.
    _watcher: Option<
        notify_debouncer_full::Debouncer<
            notify_debouncer_full::notify::RecommendedWatcher,
            notify_debouncer_full::FileIdMap,
        >,
    >,
}

impl FileConfigSource {
    /// Load the current values and start watching for changes.
    ///
    /// The watcher is best-effort: if it cannot be created the source still
    /// works, it just never reloads (a warning is logged).
    pub fn start(config_path: &Path) -> Self {
        let values = Arc::new(RwLock::new(
            load_dynamic_table(config_path).unwrap_or_default(),
        ));

        let values_clone = Arc::clone(&values);
        let path_clone = config_path.to_path_buf();
        let watcher = notify_debouncer_full::new_debouncer(
            Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    let relevant = events.iter().any(|e| {
                        use notify_debouncer_full::notify::EventKind;
                        matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    });
                    if relevant {
                        apply_reload(&path_clone, &values_clone);
                    }
                }
            },
        );

        let watcher = match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                // Watch the parent directory: watching a not-yet-existing
                // file fails on some platforms.
                let watch_path = config_path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                match debouncer.watcher().watch(
                    watch_path,
                    notify_debouncer_full::notify::RecursiveMode::NonRecursive,
                ) {
                    Ok(()) => {
                        info!(path = %config_path.display(), "dynamic config watcher started");
                        Some(debouncer)
                    }
                    Err(e) => {
                        warn!("dynamic config watcher failed to start: {e}; hot-reload disabled");
                        None
                    }
                }
            }
            Err(e) => {
                warn!("dynamic config watcher creation failed: {e}; hot-reload disabled");
                None
            }
        };

        Self {
            path: config_path.to_path_buf(),
            values,
            _watcher: watcher,
        }
    }

    /// Re-read the file immediately (the watcher calls this on change).
    pub fn reload(&self) {
        apply_reload(&self.path, &self.values);
    }
}

impl DynamicConfigSource for FileConfigSource {
    fn get_long(&self, key: &str, default: i64) -> i64 {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

fn apply_reload(path: &Path, values: &Arc<RwLock<HashMap<String, String>>>) {
    match load_dynamic_table(path) {
        Some(map) => {
            let mut guard = values.write().unwrap_or_else(PoisonError::into_inner);
            if *guard != map {
                info!(path = %path.display(), keys = map.len(), "dynamic config reloaded");
                *guard = map;
            }
        }
        None => {
            warn!(
                path = %path.display(),
                "dynamic config unreadable; keeping last-known-good values"
            );
        }
    }
}

/// Parse the `[dynamic]` table into flat string values.
///
/// TOML scalars of any type are accepted; `get_long` parses on read, so an
/// operator can write `16` or `"16"` interchangeably.
fn load_dynamic_table(path: &Path) -> Option<HashMap<String, String>> {
    let contents = std::fs::read_to_string(path).ok()?;
    let value: toml::Value = toml::from_str(&contents).ok()?;
    let table = value.get("dynamic")?.as_table()?;

    let mut map = HashMap::new();
    for (key, value) in table {
        let rendered = match value {
            toml::Value::String(s) => s.clone(),
            toml::Value::Integer(i) => i.to_string(),
            toml::Value::Float(f) => f.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            other => {
                warn!(key = %key, kind = other.type_str(), "ignoring non-scalar dynamic config value");
                continue;
            }
        };
        map.insert(key.clone(), rendered);
    }
    Some(map)
}
