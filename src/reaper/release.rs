use std::collections::BTreeSet;
use std::io;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::time::Instant;

use crate::reaper::config::ReaperConfig;
use crate::reaper::daemon::reaper_event;
use crate::reaper::tree_watch::TreeWatchHandler;
use crate::reaper::usage::{read_usage, ResourceUsageSnapshot};

/// Consumer of per-release accounting records. Fire-and-forget: failures
/// are logged by the implementation and never propagated into the core.
pub trait AccountingSink {
    fn report_released(&mut self, cgroup_path: &str, usage: &ResourceUsageSnapshot);
}

/// Accounting sink that spawns a configured command per release, with the
/// cgroup path and counters in the environment. The child is not awaited;
/// the runtime reaps it in the background.
pub struct CommandSink {
    program: String,
    args: Vec<String>,
}

impl CommandSink {
    /// The program is a separate argument so an empty command line is
    /// unrepresentable.
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

impl AccountingSink for CommandSink {
    fn report_released(&mut self, cgroup_path: &str, usage: &ResourceUsageSnapshot) {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .env("CGREAPER_CGROUP", cgroup_path);
        if let Some(d) = usage.cpu_total {
            cmd.env("CGREAPER_CPU_TOTAL_USEC", d.as_micros().to_string());
        }
        if let Some(d) = usage.cpu_user {
            cmd.env("CGREAPER_CPU_USER_USEC", d.as_micros().to_string());
        }
        if let Some(d) = usage.cpu_system {
            cmd.env("CGREAPER_CPU_SYSTEM_USEC", d.as_micros().to_string());
        }
        if let Some(peak) = usage.memory_peak {
            cmd.env("CGREAPER_MEMORY_PEAK", peak.to_string());
        }
        match cmd.spawn() {
            Ok(_child) => {} // dropped on purpose; tokio reaps the orphan
            Err(e) => reaper_event(
                "accounting",
                format!("failed to spawn {}: {e}", self.program),
            ),
        }
    }
}

/// Reacts to "cgroup became empty" signals for the configured managed
/// scopes: reads the final counters, prints the report line, feeds the
/// accounting sink and batches the directory removal on a short deferred
/// timer so near-simultaneous releases coalesce into one sweep.
pub struct ReleaseHandler {
    cgroup_root: PathBuf,
    managed_scopes: Vec<String>,
    delay: Duration,
    sink: Option<Box<dyn AccountingSink>>,
    /// Distinct pending-deletion paths; re-adding is a no-op.
    queue: BTreeSet<String>,
    flush_at: Option<Instant>,
}

impl ReleaseHandler {
    pub fn new(cfg: &ReaperConfig) -> Self {
        let sink: Option<Box<dyn AccountingSink>> =
            cfg.accounting_command.split_first().map(|(program, args)| {
                Box::new(CommandSink::new(program.clone(), args.to_vec()))
                    as Box<dyn AccountingSink>
            });
        Self {
            cgroup_root: cfg.cgroup_root.clone(),
            managed_scopes: cfg.managed_scopes.clone(),
            delay: cfg.reap_delay,
            sink,
            queue: BTreeSet::new(),
            flush_at: None,
        }
    }

    #[cfg(test)]
    fn with_sink(mut self, sink: Box<dyn AccountingSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Handle one "cgroup became empty" signal. Paths outside every
    /// managed scope are ignored; that is the common case, not an error.
    pub fn on_cgroup_released(&mut self, cgroup_path: &str) {
        let Some(suffix) = managed_suffix(cgroup_path, &self.managed_scopes) else {
            return;
        };

        reaper_event("release", format!("cgroup released: {cgroup_path}"));

        let usage = read_usage(&self.cgroup_root, cgroup_path);
        if let Some(line) = usage.report_line(suffix) {
            eprintln!("{line}");
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.report_released(cgroup_path, &usage);
        }

        self.queue.insert(cgroup_path.to_string());
        // Idempotent single-slot re-arm: later releases push the sweep
        // out, they never stack additional timers.
        self.flush_at = Some(Instant::now() + self.delay);
    }

    /// Deadline of the pending deletion sweep, if one is armed.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    /// Drain the queue in descending lexicographic order (children before
    /// parents) and remove each directory once, best-effort. Returns the
    /// paths in the order they were processed.
    pub fn flush(&mut self) -> Vec<String> {
        self.flush_at = None;
        let batch: Vec<String> = std::mem::take(&mut self.queue).into_iter().rev().collect();
        for path in &batch {
            self.remove_cgroup(path);
        }
        batch
    }

    /// Single rmdir, no recursion: by the time a path is queued its
    /// subtree has already been torn down logically, and children that
    /// are still alive will trigger their own release later.
    fn remove_cgroup(&self, cgroup_path: &str) {
        let dir = self.cgroup_root.join(cgroup_path.trim_start_matches('/'));
        match std::fs::remove_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {} // already gone
            Err(e) => reaper_event("reap", format!("failed to delete {}: {e}", dir.display())),
        }
    }
}

impl TreeWatchHandler for ReleaseHandler {
    fn on_directory_created(&mut self, relative_path: &Path, _directory_fd: BorrowedFd<'_>) {
        reaper_event("watch", format!("tracking {}", relative_path.display()));
    }

    /// In the unified hierarchy the manager removes an emptied cgroup's
    /// directory, so the deletion of a watched directory is the release
    /// signal.
    fn on_directory_deleted(&mut self, relative_path: &Path) {
        let path = format!("/{}", relative_path.display());
        self.on_cgroup_released(&path);
    }

    fn on_inotify_error(&mut self, error: anyhow::Error) {
        reaper_event("watch", format!("inotify failure: {error:#}"));
    }
}

/// Match `path` against the configured scope prefixes; the first match
/// yields the part after the prefix.
pub fn managed_suffix<'a>(path: &'a str, scopes: &[String]) -> Option<&'a str> {
    scopes
        .iter()
        .find_map(|scope| path.strip_prefix(scope.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn handler(root: &Path, managed: &[&str]) -> ReleaseHandler {
        ReleaseHandler {
            cgroup_root: root.to_path_buf(),
            managed_scopes: scopes(managed),
            delay: Duration::from_millis(50),
            sink: None,
            queue: BTreeSet::new(),
            flush_at: None,
        }
    }

    #[test]
    fn suffix_matching_honors_scope_prefixes() {
        let scopes = scopes(&["/system.slice/", "/user.slice/"]);
        assert_eq!(
            managed_suffix("/system.slice/foo.scope", &scopes),
            Some("foo.scope")
        );
        assert_eq!(
            managed_suffix("/user.slice/u1/x", &scopes),
            Some("u1/x")
        );
        assert_eq!(managed_suffix("/init.scope", &scopes), None);
        // The scope directory itself is not reaped.
        assert_eq!(managed_suffix("/system.slice", &scopes), None);
    }

    #[test]
    fn unmanaged_paths_are_ignored_entirely() {
        let tmp = TempDir::new().unwrap();
        let mut h = handler(tmp.path(), &["/managed/"]);
        h.on_cgroup_released("/elsewhere/foo");
        assert!(h.queue.is_empty());
        assert!(h.flush_deadline().is_none());
    }

    #[test]
    fn releases_batch_and_deduplicate() {
        let tmp = TempDir::new().unwrap();
        let mut h = handler(tmp.path(), &["/"]);
        h.on_cgroup_released("/a");
        h.on_cgroup_released("/b");
        h.on_cgroup_released("/a");
        assert_eq!(h.queue.len(), 2);
        assert!(h.flush_deadline().is_some());

        let batch = h.flush();
        assert_eq!(batch, vec!["/b", "/a"]);
        assert!(h.queue.is_empty());
        assert!(h.flush_deadline().is_none());
    }

    #[test]
    fn flush_removes_children_before_parents() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();

        let mut h = handler(tmp.path(), &["/"]);
        h.on_cgroup_released("/a");
        h.on_cgroup_released("/a/b");

        let batch = h.flush();
        assert_eq!(batch, vec!["/a/b", "/a"]);
        assert!(!tmp.path().join("a").exists());
    }

    #[test]
    fn vanished_directories_count_as_removed() {
        let tmp = TempDir::new().unwrap();
        let mut h = handler(tmp.path(), &["/"]);
        h.on_cgroup_released("/never/existed");
        let batch = h.flush();
        assert_eq!(batch, vec!["/never/existed"]);
    }

    #[test]
    fn not_yet_empty_directories_do_not_block_the_batch() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("busy/child")).unwrap();
        fs::create_dir_all(tmp.path().join("idle")).unwrap();

        let mut h = handler(tmp.path(), &["/"]);
        h.on_cgroup_released("/busy");
        h.on_cgroup_released("/idle");
        h.flush();

        // "busy" still has a child and stays; "idle" is removed anyway.
        assert!(tmp.path().join("busy").exists());
        assert!(!tmp.path().join("idle").exists());
    }

    #[test]
    fn accounting_command_splits_into_program_and_args() {
        let cfg = ReaperConfig {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            managed_scopes: scopes(&["/a/"]),
            reap_delay: Duration::from_millis(50),
            accounting_command: Vec::new(),
            unshare_ipc: false,
        };
        assert!(ReleaseHandler::new(&cfg).sink.is_none());

        let cfg = ReaperConfig {
            accounting_command: vec!["/usr/bin/acct".to_string(), "--json".to_string()],
            ..cfg
        };
        assert!(ReleaseHandler::new(&cfg).sink.is_some());
    }

    struct RecordingSink(mpsc::Sender<(String, Option<u64>)>);

    impl AccountingSink for RecordingSink {
        fn report_released(&mut self, cgroup_path: &str, usage: &ResourceUsageSnapshot) {
            let _ = self.0.send((cgroup_path.to_string(), usage.memory_peak));
        }
    }

    #[test]
    fn sink_sees_path_and_snapshot() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("scope/foo");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("memory.peak"), "1048576\n").unwrap();

        let (tx, rx) = mpsc::channel();
        let mut h = handler(tmp.path(), &["/scope/"]).with_sink(Box::new(RecordingSink(tx)));
        h.on_cgroup_released("/scope/foo");

        assert_eq!(
            rx.try_recv().unwrap(),
            ("/scope/foo".to_string(), Some(1_048_576))
        );
    }

    #[tokio::test]
    async fn command_sink_spawns_the_configured_command() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("marker");
        let mut sink = CommandSink::new(
            "sh".to_string(),
            vec![
                "-c".to_string(),
                format!("echo \"$CGREAPER_CGROUP\" > {}", marker.display()),
            ],
        );

        let usage = ResourceUsageSnapshot::default();
        sink.report_released("/scope/foo", &usage);

        // Fire-and-forget: poll for the side effect.
        for _ in 0..100 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let out = fs::read_to_string(&marker).unwrap();
        assert_eq!(out.trim(), "/scope/foo");
    }
}
