use anyhow::Context as _;
use chrono::Local;
use futures_util::StreamExt as _;
use inotify::Inotify;
use std::env;
use std::os::unix::net::UnixDatagram;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{sleep_until, Instant};

use crate::reaper::build_info;
use crate::reaper::config::ReaperConfig;
use crate::reaper::namespace;
use crate::reaper::release::ReleaseHandler;
use crate::reaper::tree_watch::TreeWatch;

/// Timestamped diagnostic line on stderr. Running under systemd, stderr
/// ends up in the journal; no log files are kept.
pub fn reaper_event(component: &str, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    eprintln!("{ts} [{component}] {}", msg.as_ref());
}

/// Run the reaper until SIGTERM/SIGINT. Everything happens on this one
/// task: inotify events, release handling and the deletion sweep, so the
/// tree and the queue are never touched concurrently.
pub async fn run_daemon(cfg: ReaperConfig) -> anyhow::Result<()> {
    reaper_event("daemon", build_info::banner());

    if cfg.unshare_ipc {
        namespace::isolate_ipc()?;
        reaper_event("daemon", "detached into private IPC namespace");
    }

    let inotify = Inotify::init().context("failed to initialize inotify")?;
    let mut tree = TreeWatch::new(inotify.watches(), &cfg.cgroup_root).with_context(|| {
        format!(
            "failed to watch cgroup mount {}",
            cfg.cgroup_root.display()
        )
    })?;
    let mut handler = ReleaseHandler::new(&cfg);

    let scope_paths: Vec<String> = cfg.scope_watch_paths().map(str::to_string).collect();
    for scope in &scope_paths {
        tree.add(scope, &mut handler)
            .with_context(|| format!("failed to register managed scope /{scope}"))?;
        reaper_event("watch", format!("managed scope /{scope}"));
    }

    let mut stream = inotify
        .into_event_stream([0u8; 4096])
        .context("failed to start inotify event stream")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    sd_notify_ready();
    reaper_event("daemon", "ready");

    loop {
        let flush_at = handler.flush_deadline();
        tokio::select! {
            _ = sigterm.recv() => {
                reaper_event("daemon", "SIGTERM received, shutting down");
                break;
            }
            _ = sigint.recv() => {
                reaper_event("daemon", "SIGINT received, shutting down");
                break;
            }
            _ = sighup.recv() => {
                // Scopes and delays are fixed at startup; nothing to reload.
                reaper_event("daemon", "SIGHUP ignored (restart to apply config changes)");
            }
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    tree.handle_event(&event.wd, event.mask, event.name.as_deref(), &mut handler);
                }
                Some(Err(e)) => reaper_event("inotify", format!("event read error: {e}")),
                None => {
                    reaper_event("inotify", "event stream closed");
                    break;
                }
            },
            _ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                let batch = handler.flush();
                if !batch.is_empty() {
                    reaper_event("reap", format!("swept {} cgroup(s)", batch.len()));
                }
            }
        }
    }

    // A not-yet-drained queue is left alone on purpose: the kernel does
    // not need the directories removed, and a restart reaps them.
    Ok(())
}

/// Tell systemd we are ready, when started with a NOTIFY_SOCKET. Silent
/// no-op outside systemd.
fn sd_notify_ready() {
    let Ok(socket) = env::var("NOTIFY_SOCKET") else {
        return;
    };
    let result = (|| -> std::io::Result<()> {
        let sock = UnixDatagram::unbound()?;
        if let Some(name) = socket.strip_prefix('@') {
            use std::os::linux::net::SocketAddrExt as _;
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
            sock.send_to_addr(b"READY=1", &addr)?;
        } else {
            sock.send_to(b"READY=1", &socket)?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        reaper_event("daemon", format!("sd_notify failed: {e}"));
    }
}
