use tracing::info;

use crate::comm::{self, ProcessGroup};
use crate::error::LaunchError;
use crate::launcher::{WorkerBootstrap, WorkerInfo};
use crate::rendezvous::rendezvous;

/// Default worker bootstrap: rendezvous with every rank of the job, publish
/// the resulting group through [`comm`], then run the entry point.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessGroupBootstrap;

impl ProcessGroupBootstrap {
    pub fn establish(worker: &WorkerInfo) -> Result<ProcessGroup, LaunchError> {
        let local_size = worker.num_processes_per_machine;
        if worker.local_rank >= local_size {
            return Err(LaunchError::RankOutOfRange {
                what: "local",
                rank: worker.local_rank,
                size: local_size,
            });
        }
        if worker.machine_rank >= worker.num_machines() {
            return Err(LaunchError::RankOutOfRange {
                what: "machine",
                rank: worker.machine_rank,
                size: worker.num_machines(),
            });
        }
        let rank = worker.global_rank();
        rendezvous(&worker.dist_url, rank, worker.world_size, worker.timeout)?;
        Ok(ProcessGroup {
            rank,
            local_rank: worker.local_rank,
            world_size: worker.world_size,
            local_size,
            machine_rank: worker.machine_rank,
        })
    }
}

impl WorkerBootstrap for ProcessGroupBootstrap {
    fn run<A, R, E, F>(&self, worker: WorkerInfo, main_func: F, args: A) -> Result<(), E>
    where
        F: FnOnce(A) -> Result<R, E>,
        E: From<LaunchError>,
    {
        let group = Self::establish(&worker)?;
        info!(
            rank = group.rank,
            local_rank = group.local_rank,
            world_size = group.world_size,
            "process group ready"
        );
        comm::install(group)?;
        main_func(args).map(|_| ())
    }
}
