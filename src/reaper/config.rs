use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Flattened runtime configuration, assembled from the grouped YAML file.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Unified cgroup2 mount the watcher and the reaper operate on.
    pub cgroup_root: PathBuf,

    /// Absolute cgroup path prefixes this daemon is responsible for.
    /// Normalized to end in `/`, so stripping a prefix yields a clean
    /// suffix and the scope directory itself never matches.
    pub managed_scopes: Vec<String>,

    /// Batching window between a release event and the deletion sweep.
    pub reap_delay: Duration,

    /// Optional accounting hook argv, spawned once per release.
    pub accounting_command: Vec<String>,

    /// Detach into a private IPC namespace at startup.
    pub unshare_ipc: bool,
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReaperConfigFile {
    #[serde(default)]
    cgroup: Option<CgroupConfigFile>,
    managed_scopes: Vec<String>,
    #[serde(default)]
    reap: Option<ReapConfigFile>,
    #[serde(default)]
    accounting: Option<AccountingConfigFile>,
    #[serde(default)]
    namespace: Option<NamespaceConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CgroupConfigFile {
    #[serde(default = "default_cgroup_root")]
    root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReapConfigFile {
    #[serde(default = "default_reap_delay_ms")]
    delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AccountingConfigFile {
    #[serde(default)]
    command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NamespaceConfigFile {
    #[serde(default)]
    ipc: bool,
}

fn default_cgroup_root() -> PathBuf {
    "/sys/fs/cgroup".into()
}

fn default_reap_delay_ms() -> u64 {
    50
}

pub fn load_config(config_path: &Path) -> anyhow::Result<ReaperConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let file_cfg: ReaperConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;

    let mut cfg = ReaperConfig {
        cgroup_root: default_cgroup_root(),
        managed_scopes: Vec::new(),
        reap_delay: Duration::from_millis(default_reap_delay_ms()),
        accounting_command: Vec::new(),
        unshare_ipc: false,
    };

    if let Some(cg) = file_cfg.cgroup {
        cfg.cgroup_root = cg.root;
    }
    anyhow::ensure!(
        cfg.cgroup_root.is_absolute(),
        "cgroup.root must be an absolute path"
    );

    anyhow::ensure!(
        !file_cfg.managed_scopes.is_empty(),
        "managed_scopes must list at least one cgroup path prefix"
    );
    for scope in file_cfg.managed_scopes {
        let scope = scope.trim();
        anyhow::ensure!(
            scope.starts_with('/') && scope.len() > 1,
            "managed scope {scope:?} must be an absolute cgroup path"
        );
        let mut scope = scope.to_string();
        if !scope.ends_with('/') {
            scope.push('/');
        }
        cfg.managed_scopes.push(scope);
    }

    if let Some(reap) = file_cfg.reap {
        anyhow::ensure!(reap.delay_ms > 0, "reap.delay_ms must be nonzero");
        cfg.reap_delay = Duration::from_millis(reap.delay_ms);
    }

    if let Some(acc) = file_cfg.accounting {
        if !acc.command.is_empty() {
            anyhow::ensure!(
                !acc.command[0].trim().is_empty(),
                "accounting.command program must not be empty"
            );
            cfg.accounting_command = acc.command;
        }
    }

    if let Some(ns) = file_cfg.namespace {
        cfg.unshare_ipc = ns.ipc;
    }

    Ok(cfg)
}

impl ReaperConfig {
    /// Watch paths relative to the cgroup root, one per managed scope.
    pub fn scope_watch_paths(&self) -> impl Iterator<Item = &str> {
        self.managed_scopes
            .iter()
            .map(|s| s.trim_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn load(yaml: &str) -> anyhow::Result<ReaperConfig> {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        load_config(f.path())
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = load("managed_scopes: [\"/system.slice/\"]\n").unwrap();
        assert_eq!(cfg.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(cfg.managed_scopes, vec!["/system.slice/"]);
        assert_eq!(cfg.reap_delay, Duration::from_millis(50));
        assert!(cfg.accounting_command.is_empty());
        assert!(!cfg.unshare_ipc);
    }

    #[test]
    fn scopes_are_normalized_to_trailing_slash() {
        let cfg = load("managed_scopes: [\"/a/b\", \"/c/\"]\n").unwrap();
        assert_eq!(cfg.managed_scopes, vec!["/a/b/", "/c/"]);
        let watch: Vec<&str> = cfg.scope_watch_paths().collect();
        assert_eq!(watch, vec!["a/b", "c"]);
    }

    #[test]
    fn full_config_round_trips() {
        let cfg = load(
            "cgroup:\n  root: /mnt/cgroup2\nmanaged_scopes: [\"/x/\"]\nreap:\n  delay_ms: 200\naccounting:\n  command: [\"/usr/local/bin/acct\", \"--json\"]\nnamespace:\n  ipc: true\n",
        )
        .unwrap();
        assert_eq!(cfg.cgroup_root, PathBuf::from("/mnt/cgroup2"));
        assert_eq!(cfg.reap_delay, Duration::from_millis(200));
        assert_eq!(cfg.accounting_command, vec!["/usr/local/bin/acct", "--json"]);
        assert!(cfg.unshare_ipc);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(load("managed_scopes: []\n").is_err());
        assert!(load("managed_scopes: [\"relative/path\"]\n").is_err());
        assert!(load("managed_scopes: [\"/\"]\n").is_err());
        assert!(load("managed_scopes: [\"/x/\"]\nreap:\n  delay_ms: 0\n").is_err());
        assert!(load("managed_scopes: [\"/x/\"]\nunknown_key: 1\n").is_err());
    }
}
