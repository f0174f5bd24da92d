pub mod build_info;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod namespace;
pub mod release;
pub mod tree_watch;
pub mod usage;
