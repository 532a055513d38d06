//! Argument groups and process setup shared by the workspace binaries.

pub mod common;
pub mod logging;

pub use common::{default_dist_url, strip_worker_flags, ConfigArgs, LaunchArgs};
pub use logging::init_tracing;
