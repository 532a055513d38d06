use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dist_url::{find_free_port, DistUrl};
use crate::error::{LaunchError, LaunchResult};

/// Default bound on the distributed rendezvous.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Machine topology and rendezvous settings of one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Processes per machine (one per GPU when training on GPUs).
    pub num_processes_per_machine: usize,
    pub num_machines: usize,
    pub machine_rank: usize,
    /// Rank of this process among the processes of its machine.
    pub local_rank: usize,
    pub dist_url: Option<DistUrl>,
    pub timeout: Duration,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            num_processes_per_machine: 1,
            num_machines: 1,
            machine_rank: 0,
            local_rank: 0,
            dist_url: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl LaunchSpec {
    pub fn new(num_processes_per_machine: usize) -> Self {
        Self {
            num_processes_per_machine,
            ..Self::default()
        }
    }

    pub fn world_size(&self) -> usize {
        self.num_machines * self.num_processes_per_machine
    }

    /// Rendezvous address the workers of a distributed job will use.
    ///
    /// `auto` becomes a loopback tcp address on a free port, which is only
    /// meaningful when every worker runs on this machine. Resolving does not
    /// log; [`launch`] emits the `file://` advisory once per launch.
    pub fn resolve_dist_url(&self) -> LaunchResult<DistUrl> {
        let url = match &self.dist_url {
            None => {
                return Err(LaunchError::MissingDistUrl {
                    world_size: self.world_size(),
                })
            }
            Some(DistUrl::Auto) => {
                if self.num_machines != 1 {
                    return Err(LaunchError::AutoUrlMultiMachine {
                        num_machines: self.num_machines,
                    });
                }
                let url = DistUrl::loopback(find_free_port()?);
                debug!(%url, "resolved dist_url=auto");
                url
            }
            Some(url) => url.clone(),
        };
        Ok(url)
    }
}

/// Identity of the current process inside a distributed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub local_rank: usize,
    pub world_size: usize,
    pub num_processes_per_machine: usize,
    pub machine_rank: usize,
    pub dist_url: DistUrl,
    pub timeout: Duration,
}

impl WorkerInfo {
    pub fn global_rank(&self) -> usize {
        self.machine_rank * self.num_processes_per_machine + self.local_rank
    }

    pub fn num_machines(&self) -> usize {
        self.world_size / self.num_processes_per_machine.max(1)
    }
}

/// Joins the current process to a distributed group and runs the entry point.
pub trait WorkerBootstrap {
    fn run<A, R, E, F>(&self, worker: WorkerInfo, main_func: F, args: A) -> Result<(), E>
    where
        F: FnOnce(A) -> Result<R, E>,
        E: From<LaunchError>;
}

/// Run `main_func(args)` in this process, or as one worker of a distributed
/// group when the world size exceeds one.
///
/// Returns `Some(result)` for single-process runs and `None` once the
/// distributed worker completes. Errors from `main_func` are returned as-is;
/// invalid launch parameters fail before the bootstrap is invoked.
pub fn launch<A, R, E, F, W>(
    main_func: F,
    spec: &LaunchSpec,
    args: A,
    bootstrap: &W,
) -> Result<Option<R>, E>
where
    F: FnOnce(A) -> Result<R, E>,
    E: From<LaunchError>,
    W: WorkerBootstrap,
{
    let world_size = spec.world_size();
    if world_size == 0 {
        return Err(LaunchError::EmptyWorld.into());
    }
    if world_size == 1 {
        debug!("world size 1; running in-process");
        return main_func(args).map(Some);
    }

    let dist_url = spec.resolve_dist_url()?;
    if spec.num_machines > 1 && dist_url.is_file() {
        warn!("file:// is not a reliable init_method in multi-machine jobs. Prefer tcp://");
    }
    let worker = WorkerInfo {
        local_rank: spec.local_rank,
        world_size,
        num_processes_per_machine: spec.num_processes_per_machine,
        machine_rank: spec.machine_rank,
        dist_url,
        timeout: spec.timeout,
    };
    info!(
        rank = worker.global_rank(),
        world_size,
        dist_url = %worker.dist_url,
        "launching distributed worker"
    );
    bootstrap.run(worker, main_func, args)?;
    Ok(None)
}
