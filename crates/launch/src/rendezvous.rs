//! Blocking rendezvous used to assemble a process group.
//!
//! tcp: rank 0 listens on the address; every other rank connects, sends its
//! rank, and waits for rank 0 to release the group once all ranks checked in.
//! file: every other rank keeps rewriting `<path>.rank<N>` with a per-run
//! token and a heartbeat; rank 0 waits until each marker changes under it,
//! then lists the tokens it saw in `<path>.release`.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::dist_url::DistUrl;
use crate::error::{LaunchError, LaunchResult};

const RELEASE: u8 = b'G';
const POLL: Duration = Duration::from_millis(20);

/// Block until all `world_size` ranks reached `url`, or `timeout` elapses.
pub fn rendezvous(
    url: &DistUrl,
    rank: usize,
    world_size: usize,
    timeout: Duration,
) -> LaunchResult<()> {
    if rank >= world_size {
        return Err(LaunchError::RankOutOfRange {
            what: "global",
            rank,
            size: world_size,
        });
    }
    let deadline = Deadline::new(url, timeout);
    match url {
        DistUrl::Auto => Err(LaunchError::InvalidDistUrl {
            url: url.to_string(),
            reason: "auto must be resolved before rendezvous".into(),
        }),
        DistUrl::Env => rendezvous(&DistUrl::from_env()?, rank, world_size, timeout),
        DistUrl::Tcp { host, port } => {
            let addr = format!("{host}:{port}");
            if rank == 0 {
                serve(&addr, world_size, &deadline)
            } else {
                join(&addr, rank, &deadline)
            }
        }
        DistUrl::File(path) => file_rendezvous(path, rank, world_size, &deadline),
    }
}

struct Deadline {
    at: Instant,
    url: String,
    timeout: Duration,
}

impl Deadline {
    fn new(url: &DistUrl, timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            url: url.to_string(),
            timeout,
        }
    }

    fn expired(&self) -> LaunchError {
        LaunchError::RendezvousTimeout {
            url: self.url.clone(),
            timeout: self.timeout,
        }
    }

    fn remaining(&self) -> LaunchResult<Duration> {
        self.at
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| self.expired())
    }

    fn read_error(&self, context: &str) -> impl FnOnce(io::Error) -> LaunchError + '_ {
        let context = context.to_string();
        move |source| match source.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => self.expired(),
            _ => LaunchError::Io { context, source },
        }
    }
}

fn serve(addr: &str, world_size: usize, deadline: &Deadline) -> LaunchResult<()> {
    let listener = TcpListener::bind(addr)
        .map_err(LaunchError::io(format!("bind rendezvous address {addr}")))?;
    listener
        .set_nonblocking(true)
        .map_err(LaunchError::io("configure rendezvous listener"))?;

    let mut checked_in = vec![false; world_size];
    checked_in[0] = true;
    let mut peers = Vec::with_capacity(world_size.saturating_sub(1));
    while peers.len() + 1 < world_size {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let wait = deadline.remaining()?;
                stream
                    .set_nonblocking(false)
                    .and_then(|_| stream.set_read_timeout(Some(wait)))
                    .map_err(LaunchError::io("configure rendezvous peer"))?;
                let mut buf = [0u8; 8];
                stream
                    .read_exact(&mut buf)
                    .map_err(deadline.read_error("read peer rank"))?;
                let peer_rank = u64::from_le_bytes(buf) as usize;
                if peer_rank == 0 || peer_rank >= world_size || checked_in[peer_rank] {
                    return Err(LaunchError::Rendezvous(format!(
                        "unexpected rank {peer_rank} from {peer} (world size {world_size})"
                    )));
                }
                checked_in[peer_rank] = true;
                debug!(peer_rank, %peer, "rank checked in");
                peers.push(stream);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                deadline.remaining()?;
                thread::sleep(POLL);
            }
            Err(err) => return Err(LaunchError::io("accept rendezvous peer")(err)),
        }
    }
    for stream in &mut peers {
        stream
            .write_all(&[RELEASE])
            .map_err(LaunchError::io("release rendezvous peer"))?;
    }
    Ok(())
}

fn join(addr: &str, rank: usize, deadline: &Deadline) -> LaunchResult<()> {
    let targets: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(LaunchError::io(format!("resolve rendezvous address {addr}")))?
        .collect();
    let target = targets.first().copied().ok_or_else(|| LaunchError::InvalidDistUrl {
        url: addr.to_string(),
        reason: "address resolved to nothing".into(),
    })?;

    let mut stream = loop {
        match TcpStream::connect_timeout(&target, deadline.remaining()?) {
            Ok(stream) => break stream,
            Err(_) => thread::sleep(POLL),
        }
    };
    stream
        .write_all(&(rank as u64).to_le_bytes())
        .map_err(LaunchError::io("send rank to rendezvous"))?;
    stream
        .set_read_timeout(Some(deadline.remaining()?))
        .map_err(LaunchError::io("configure rendezvous stream"))?;
    let mut release = [0u8; 1];
    stream
        .read_exact(&mut release)
        .map_err(deadline.read_error("wait for rendezvous release"))?;
    if release[0] != RELEASE {
        return Err(LaunchError::Rendezvous(format!(
            "unexpected release byte {:#x} from {addr}",
            release[0]
        )));
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn marker_path(path: &Path, rank: usize) -> PathBuf {
    sibling(path, &format!(".rank{rank}"))
}

fn release_path(path: &Path) -> PathBuf {
    sibling(path, ".release")
}

/// Replace `target` in one step so readers never see a partial file.
fn write_atomic(target: &Path, contents: &str) -> LaunchResult<()> {
    let tmp = sibling(target, ".tmp");
    fs::write(&tmp, contents)
        .and_then(|_| fs::rename(&tmp, target))
        .map_err(LaunchError::io(format!("write rendezvous file {}", target.display())))
}

/// Identifies one rank of one run; never reused across processes or runs.
fn run_token(rank: usize) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!("{}-{nanos}-{rank}", std::process::id())
}

fn file_rendezvous(
    path: &Path,
    rank: usize,
    world_size: usize,
    deadline: &Deadline,
) -> LaunchResult<()> {
    if rank == 0 {
        collect_markers(path, world_size, deadline)
    } else {
        announce_marker(path, rank, deadline)
    }
}

/// Rank 0: wait until every peer marker is live, then release the peers by token.
///
/// A marker only counts once its contents differ from what was on disk when
/// rank 0 arrived, so markers left behind by an earlier run are ignored until
/// a live peer rewrites them.
fn collect_markers(path: &Path, world_size: usize, deadline: &Deadline) -> LaunchResult<()> {
    let stale: Vec<Option<String>> = (0..world_size)
        .map(|r| fs::read_to_string(marker_path(path, r)).ok())
        .collect();
    let mut tokens: Vec<Option<String>> = vec![None; world_size];
    loop {
        for peer in 1..world_size {
            if tokens[peer].is_some() {
                continue;
            }
            let Ok(contents) = fs::read_to_string(marker_path(path, peer)) else {
                continue;
            };
            if stale[peer].as_ref() == Some(&contents) {
                continue;
            }
            if let Some((token, _beat)) = contents.split_once(' ') {
                debug!(peer, "rank checked in");
                tokens[peer] = Some(token.to_string());
            }
        }
        if tokens.iter().skip(1).all(Option::is_some) {
            let release: String = tokens
                .iter()
                .enumerate()
                .filter_map(|(r, t)| t.as_ref().map(|t| format!("{r} {t}\n")))
                .collect();
            return write_atomic(&release_path(path), &release);
        }
        deadline.remaining()?;
        thread::sleep(POLL);
    }
}

/// Peer: keep rewriting the marker until rank 0 releases this run's token.
fn announce_marker(path: &Path, rank: usize, deadline: &Deadline) -> LaunchResult<()> {
    let marker = marker_path(path, rank);
    let token = run_token(rank);
    let expected = format!("{rank} {token}");
    let mut beat = 0u64;
    loop {
        write_atomic(&marker, &format!("{token} {beat}"))?;
        let released = fs::read_to_string(release_path(path))
            .is_ok_and(|release| release.lines().any(|line| line == expected));
        if released {
            let _ = fs::remove_file(&marker);
            return Ok(());
        }
        if let Err(err) = deadline.remaining() {
            let _ = fs::remove_file(&marker);
            return Err(err);
        }
        beat += 1;
        thread::sleep(POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist_url::find_free_port;

    fn run_group(url: DistUrl, world_size: usize, timeout: Duration) -> Vec<LaunchResult<()>> {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let url = url.clone();
                thread::spawn(move || rendezvous(&url, rank, world_size, timeout))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn tcp_group_assembles() {
        let url = DistUrl::loopback(find_free_port().unwrap());
        for result in run_group(url, 3, Duration::from_secs(10)) {
            result.unwrap();
        }
    }

    #[test]
    fn file_group_assembles() {
        let dir = tempfile::tempdir().unwrap();
        let url = DistUrl::File(dir.path().join("rdzv"));
        for result in run_group(url, 3, Duration::from_secs(10)) {
            result.unwrap();
        }
        assert!(!dir.path().join("rdzv.rank1").exists());
        assert!(!dir.path().join("rdzv.rank2").exists());
    }

    #[test]
    fn file_rerun_waits_for_fresh_peers() {
        let dir = tempfile::tempdir().unwrap();
        let url = DistUrl::File(dir.path().join("rdzv"));
        for _ in 0..2 {
            for result in run_group(url.clone(), 2, Duration::from_secs(10)) {
                result.unwrap();
            }
        }

        let err = rendezvous(&url, 0, 2, Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, LaunchError::RendezvousTimeout { .. }), "{err}");
        let err = rendezvous(&url, 1, 2, Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, LaunchError::RendezvousTimeout { .. }), "{err}");
    }

    #[test]
    fn file_leftover_marker_is_not_a_live_peer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rdzv");
        fs::write(marker_path(&path, 1), "1234-5678-1 0").unwrap();
        let err = rendezvous(&DistUrl::File(path), 0, 2, Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, LaunchError::RendezvousTimeout { .. }), "{err}");
    }

    #[test]
    fn missing_peer_times_out() {
        let url = DistUrl::loopback(find_free_port().unwrap());
        let err = rendezvous(&url, 0, 2, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, LaunchError::RendezvousTimeout { .. }), "{err}");
    }

    #[test]
    fn absent_server_times_out() {
        let url = DistUrl::loopback(find_free_port().unwrap());
        let err = rendezvous(&url, 1, 2, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, LaunchError::RendezvousTimeout { .. }), "{err}");
    }

    #[test]
    fn rank_must_fit_world() {
        let err = rendezvous(&DistUrl::loopback(1), 2, 2, Duration::from_secs(1)).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn auto_is_not_a_rendezvous_address() {
        let err = rendezvous(&DistUrl::Auto, 0, 2, Duration::from_secs(1)).unwrap_err();
        assert!(err.is_configuration());
    }
}
