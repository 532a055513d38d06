//! Launch a training entry point in-process or as one worker of a
//! multi-process, multi-machine job.
//!
//! ```ignore
//! let spec = LaunchSpec {
//!     num_processes_per_machine: 2,
//!     dist_url: Some(DistUrl::Auto),
//!     ..LaunchSpec::default()
//! };
//! launch(run_main, &spec, args, &ProcessGroupBootstrap)?;
//! ```

pub mod bootstrap;
pub mod comm;
pub mod dist_url;
pub mod error;
pub mod launcher;
pub mod rendezvous;
pub mod workers;

pub use bootstrap::ProcessGroupBootstrap;
pub use comm::ProcessGroup;
pub use dist_url::{find_free_port, DistUrl};
pub use error::{LaunchError, LaunchResult};
pub use launcher::{launch, LaunchSpec, WorkerBootstrap, WorkerInfo, DEFAULT_TIMEOUT};
pub use workers::{spawn_local_workers, wait_workers};
