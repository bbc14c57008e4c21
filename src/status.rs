//! Node eligibility.
//!
//! Before touching the lock table, every tick asks a [`NodeStatusProvider`]
//! whether this process is allowed to run agents at all. Draining a node for
//! maintenance therefore requires no restart and no cluster coordination:
//! a disabled node simply stops competing for locks, and its in-flight work
//! finishes normally.

use std::io;
use std::path::{Path, PathBuf};

/// Answers whether the current process may run agents.
pub trait NodeStatusProvider: Send + Sync {
    fn is_enabled(&self) -> bool;
}

/// A node that is always eligible.
pub struct AlwaysEnabled;

impl NodeStatusProvider for AlwaysEnabled {
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Drain-file based eligibility: the node is enabled while the marker file
/// is absent. `shoald drain` / `shoald resume` toggle it.
pub struct DrainFile {
    path: PathBuf,
}

impl DrainFile {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("drain"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark this node as draining. Idempotent.
    pub fn drain(&self) -> io::Result<()> {
        std::fs::write(&self.path, b"")
    }

    /// Return this node to service. Idempotent.
    pub fn resume(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

impl NodeStatusProvider for DrainFile {
    fn is_enabled(&self) -> bool {
        !self.path.exists()
    }
}
