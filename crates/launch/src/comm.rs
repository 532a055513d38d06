//! Rank queries for code running inside a launched worker.
//!
//! Outside a distributed job every query answers as a single-process world.

use std::sync::OnceLock;

use crate::error::{LaunchError, LaunchResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub local_size: usize,
    pub machine_rank: usize,
}

static GROUP: OnceLock<ProcessGroup> = OnceLock::new();

pub(crate) fn install(group: ProcessGroup) -> LaunchResult<()> {
    GROUP.set(group).map_err(|_| LaunchError::AlreadyInitialized)
}

pub fn process_group() -> Option<&'static ProcessGroup> {
    GROUP.get()
}

pub fn get_world_size() -> usize {
    GROUP.get().map_or(1, |g| g.world_size)
}

pub fn get_rank() -> usize {
    GROUP.get().map_or(0, |g| g.rank)
}

pub fn get_local_rank() -> usize {
    GROUP.get().map_or(0, |g| g.local_rank)
}

pub fn get_local_size() -> usize {
    GROUP.get().map_or(1, |g| g.local_size)
}

pub fn is_main_process() -> bool {
    get_rank() == 0
}
