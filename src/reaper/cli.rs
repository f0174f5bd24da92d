use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cgreaper", version, about = "cgroup reaper daemon")]
pub struct Args {
    /// Path to reaper config YAML
    #[arg(short = 'c', long = "config", default_value = "/etc/cgreaper/config.yaml")]
    pub config: PathBuf,
}
