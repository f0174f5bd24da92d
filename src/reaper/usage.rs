use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::reaper::daemon::reaper_event;

/// Final resource counters of a cgroup, read once at the moment it is
/// found empty. Every counter is individually optional: a cgroup that is
/// already half torn down still gets the fields that are left.
#[derive(Debug, Clone, Default)]
pub struct ResourceUsageSnapshot {
    pub cpu_total: Option<Duration>,
    pub cpu_user: Option<Duration>,
    pub cpu_system: Option<Duration>,
    /// Memory high-water mark in bytes (`memory.peak`).
    pub memory_peak: Option<u64>,
}

impl ResourceUsageSnapshot {
    pub fn is_empty(&self) -> bool {
        self.cpu_total.is_none()
            && self.cpu_user.is_none()
            && self.cpu_system.is_none()
            && self.memory_peak.is_none()
    }

    /// One human-readable report line, or `None` when every field is
    /// unknown. `5242880` bytes formats as `5M`.
    pub fn report_line(&self, suffix: &str) -> Option<String> {
        let mut line = format!("{suffix}:");
        let mut any = false;

        if let Some(total) = self.cpu_total {
            line.push_str(&format!(" cpu={}s", total.as_secs()));
            if let (Some(user), Some(system)) = (self.cpu_user, self.cpu_system) {
                line.push_str(&format!("/{}s/{}s", user.as_secs(), system.as_secs()));
            }
            any = true;
        }
        if let Some(peak) = self.memory_peak {
            line.push_str(&format!(" memory={}M", round_to_mebibytes(peak)));
            any = true;
        }

        any.then_some(line)
    }
}

fn round_to_mebibytes(bytes: u64) -> u64 {
    (bytes + (1 << 19)) >> 20
}

/// Read the final counters of the cgroup at `cgroup_path` (absolute,
/// relative to the unified mount at `cgroup_root`).
///
/// `cpu.stat` supplies `usage_usec` / `user_usec` / `system_usec`,
/// `memory.peak` the high-water mark. Missing or unreadable files
/// downgrade to unknown fields, never to an error.
pub fn read_usage(cgroup_root: &Path, cgroup_path: &str) -> ResourceUsageSnapshot {
    let dir = cgroup_root.join(cgroup_path.trim_start_matches('/'));

    let mut snapshot = ResourceUsageSnapshot::default();
    if let Some(stat) = read_optional(&dir.join("cpu.stat")).map(|s| parse_kv_u64_lines(&s)) {
        snapshot.cpu_total = stat.get("usage_usec").copied().map(Duration::from_micros);
        snapshot.cpu_user = stat.get("user_usec").copied().map(Duration::from_micros);
        snapshot.cpu_system = stat.get("system_usec").copied().map(Duration::from_micros);
    }
    snapshot.memory_peak =
        read_optional(&dir.join("memory.peak")).and_then(|s| s.trim().parse().ok());

    snapshot
}

/// Read a counter file, treating absence as "unknown". A vanished file is
/// normal for a cgroup in teardown and not worth a log line; anything
/// else is.
fn read_optional(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(s) => Some(s),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            reaper_event("usage", format!("failed to read {}: {e}", path.display()));
            None
        }
    }
}

fn parse_kv_u64_lines(s: &str) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for line in s.lines() {
        let t = line.trim();
        if t.is_empty() {
            continue;
        }
        let mut it = t.split_whitespace();
        let Some(k) = it.next() else { continue };
        let Some(vs) = it.next() else { continue };
        if let Ok(v) = vs.parse::<u64>() {
            out.insert(k.to_string(), v);
        }
    }
    out
}
