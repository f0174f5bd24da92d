use clap::Parser;
use nix::unistd::geteuid;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = cgreaper::reaper::cli::Args::parse();
    // Fail fast: removing cgroup directories needs root.
    if !geteuid().is_root() {
        anyhow::bail!("cgreaper is not running as root; please start it as root");
    }
    let cfg = cgreaper::reaper::config::load_config(&args.config)?;
    cgreaper::reaper::daemon::run_daemon(cfg).await
}
