//! Spawning the sibling workers of a single-machine job.

use std::io;
use std::ops::Range;
use std::path::Path;
use std::process::{Child, Command};

use tracing::{info, warn};

use crate::dist_url::DistUrl;
use crate::error::{LaunchError, LaunchResult};
use crate::launcher::LaunchSpec;

/// Start local ranks `1..num_processes_per_machine` by re-running `program`
/// as `program --local-rank <i> --dist-url <url> <base_args...>`.
///
/// The launcher flags go first so trailing positional arguments in
/// `base_args` stay last. The calling process is expected to act as local
/// rank 0.
pub fn spawn_local_workers(
    spec: &LaunchSpec,
    dist_url: &DistUrl,
    program: &Path,
    base_args: &[String],
) -> LaunchResult<Vec<Child>> {
    spawn_each(1..spec.num_processes_per_machine, |local_rank| {
        Command::new(program)
            .arg("--local-rank")
            .arg(local_rank.to_string())
            .arg("--dist-url")
            .arg(dist_url.to_string())
            .args(base_args)
            .spawn()
    })
}

/// Spawn one child per rank. If any spawn fails, the children already
/// started are killed and reaped before the error is returned.
fn spawn_each<F>(local_ranks: Range<usize>, mut spawn: F) -> LaunchResult<Vec<Child>>
where
    F: FnMut(usize) -> io::Result<Child>,
{
    let mut children = Vec::with_capacity(local_ranks.len());
    for local_rank in local_ranks {
        match spawn(local_rank) {
            Ok(child) => {
                info!(pid = child.id(), local_rank, "spawned worker");
                children.push(child);
            }
            Err(source) => {
                for mut child in children {
                    let pid = child.id();
                    if let Err(err) = child.kill().and_then(|_| child.wait().map(|_| ())) {
                        warn!(pid, error = %err, "failed to stop worker");
                    }
                }
                return Err(LaunchError::Spawn { local_rank, source });
            }
        }
    }
    Ok(children)
}

/// Wait for every child; report the first one that exited unsuccessfully.
pub fn wait_workers(children: Vec<Child>) -> LaunchResult<()> {
    let mut first_failure = None;
    for mut child in children {
        let pid = child.id();
        let status = child
            .wait()
            .map_err(LaunchError::io(format!("wait for worker pid {pid}")))?;
        if !status.success() && first_failure.is_none() {
            first_failure = Some(LaunchError::WorkerFailed {
                pid,
                status: status.to_string(),
            });
        }
    }
    first_failure.map_or(Ok(()), Err)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn spawns_one_child_per_extra_rank() {
        let spec = LaunchSpec::new(3);
        let children =
            spawn_local_workers(&spec, &DistUrl::loopback(1234), Path::new("true"), &[]).unwrap();
        assert_eq!(children.len(), 2);
        wait_workers(children).unwrap();
    }

    #[test]
    fn failing_child_is_reported() {
        let spec = LaunchSpec::new(2);
        let children =
            spawn_local_workers(&spec, &DistUrl::loopback(1234), Path::new("false"), &[]).unwrap();
        let err = wait_workers(children).unwrap_err();
        assert!(matches!(err, LaunchError::WorkerFailed { .. }));
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let spec = LaunchSpec::new(2);
        let err = spawn_local_workers(
            &spec,
            &DistUrl::loopback(1234),
            Path::new("/nonexistent/fct-worker"),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { local_rank: 1, .. }));
    }

    #[test]
    fn failed_spawn_stops_earlier_workers() {
        let mut started = Vec::new();
        let err = spawn_each(1..4, |local_rank| {
            if local_rank == 3 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "fork refused"));
            }
            let child = Command::new("sleep").arg("30").spawn()?;
            started.push(child.id());
            Ok(child)
        })
        .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { local_rank: 3, .. }));
        assert_eq!(started.len(), 2);
        for pid in started {
            assert!(
                !Path::new(&format!("/proc/{pid}")).exists(),
                "worker {pid} still running"
            );
        }
    }
}
