// SPDX-License-Identifier: MIT
//! Node identity for lock ownership.
//!
//! Each scheduler process gets an opaque identity string written into the
//! `owner_node_id` column of every lock it claims: a SHA-256 fingerprint of
//! the platform machine id, truncated, plus a per-process random suffix so
//! replicas co-located on one host stay distinct. Nothing else in the system
//! depends on the format.

use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// Derive the identity for the current process.
    ///
    /// Falls back to a purely random identity when no machine id can be
    /// read — uniqueness matters here, stability across restarts does not.
    pub fn detect() -> Self {
        let host = match platform_machine_id() {
            Ok(raw) => hex_sha256(raw.trim()),
            Err(e) => {
                warn!(err = %e, "no platform machine id; using random node identity");
                Uuid::new_v4().simple().to_string()
            }
        };
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", &host[..12], &suffix[..8]))
    }

    /// Use a caller-chosen identity (tests, embedders with their own scheme).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Platform machine id ─────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
fn platform_machine_id() -> anyhow::Result<String> {
    // /etc/machine-id is guaranteed on any systemd-based distro
    std::fs::read_to_string("/etc/machine-id")
        .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
        .map_err(|e| anyhow::anyhow!("no machine-id file found: {e}"))
}

#[cfg(target_os = "macos")]
fn platform_machine_id() -> anyhow::Result<String> {
    let out = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    for line in stdout.lines() {
        if line.contains("IOPlatformUUID") {
            if let Some(start) = line.rfind('"') {
                let tail = &line[..start];
                if let Some(end) = tail.rfind('"') {
                    return Ok(line[end + 1..start].to_string());
                }
            }
        }
    }
    anyhow::bail!("IOPlatformUUID not found in ioreg output")
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn platform_machine_id() -> anyhow::Result<String> {
    anyhow::bail!("unsupported platform for machine id detection")
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
