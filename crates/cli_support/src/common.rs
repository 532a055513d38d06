use clap::Args;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

use launch::{DistUrl, LaunchError, LaunchSpec};

/// Flags the launcher appends when it re-executes a binary for a local rank.
const WORKER_FLAGS: [&str; 3] = ["--local-rank", "--dist-url", "--spawn-workers"];
/// Of those, the ones that take a value.
const WORKER_VALUE_FLAGS: [&str; 2] = ["--local-rank", "--dist-url"];

/// Default rendezvous URL: a loopback port derived from the current user so
/// that concurrent jobs of different users on one host do not collide.
pub fn default_dist_url() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    user.hash(&mut hasher);
    let port = (1u64 << 15) + (1u64 << 14) + hasher.finish() % (1u64 << 14);
    format!("tcp://127.0.0.1:{port}")
}

/// Distributed launch options shared by training binaries.
#[derive(Debug, Clone, Args)]
pub struct LaunchArgs {
    /// Number of worker processes per machine (one per GPU).
    #[arg(long, default_value_t = 1)]
    pub num_gpus: usize,
    /// Total number of machines in the job.
    #[arg(long, default_value_t = 1)]
    pub num_machines: usize,
    /// Rank of this machine (unique per machine).
    #[arg(long, default_value_t = 0)]
    pub machine_rank: usize,
    /// Rank of this process on its machine; set by the launcher for spawned workers.
    #[arg(long, default_value_t = 0)]
    pub local_rank: usize,
    /// Rendezvous URL: tcp://host:port, file:///path, env:// or "auto".
    #[arg(long, default_value_t = default_dist_url())]
    pub dist_url: String,
    /// Seconds to wait for every rank to join the rendezvous.
    #[arg(long, default_value_t = launch::DEFAULT_TIMEOUT.as_secs())]
    pub timeout_secs: u64,
}

impl LaunchArgs {
    /// Parse the URL and assemble the launch description for this process.
    pub fn launch_spec(&self) -> Result<LaunchSpec, LaunchError> {
        let dist_url: DistUrl = self.dist_url.parse()?;
        Ok(LaunchSpec {
            num_processes_per_machine: self.num_gpus,
            num_machines: self.num_machines,
            machine_rank: self.machine_rank,
            local_rank: self.local_rank,
            dist_url: Some(dist_url),
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

/// Config file plus trailing `KEY VALUE` overrides.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Path to a TOML config file.
    #[arg(long, value_name = "FILE")]
    pub config_file: Option<PathBuf>,
    /// Modify config options with KEY VALUE pairs, e.g. MODEL.PVT.DROP_PATH_RATE 0.1
    #[arg(
        value_name = "KEY VALUE",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub opts: Vec<String>,
}

/// Drop launcher-owned flags from `args` so they can be re-applied per worker.
///
/// Handles both `--flag value` and `--flag=value` spellings.
pub fn strip_worker_flags(args: &[String]) -> Vec<String> {
    let mut kept = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            kept.push(arg.clone());
            kept.extend(iter.cloned());
            break;
        }
        if WORKER_VALUE_FLAGS.contains(&arg.as_str()) {
            iter.next();
            continue;
        }
        let name = arg.split_once('=').map_or(arg.as_str(), |(name, _)| name);
        if WORKER_FLAGS.contains(&name) {
            continue;
        }
        kept.push(arg.clone());
    }
    kept
}
