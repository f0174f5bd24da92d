use anyhow::Context as _;
use nix::sched::{unshare, CloneFlags};

/// Detach the daemon into a private IPC namespace, so SysV IPC objects
/// left behind by reaped services never become visible to it.
pub fn isolate_ipc() -> anyhow::Result<()> {
    unshare(CloneFlags::CLONE_NEWIPC).context("unshare(CLONE_NEWIPC) failed")?;
    Ok(())
}
