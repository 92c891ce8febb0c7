/// Controller operations run from a second invocation: restart, stop and status.
///
/// They talk to a running supervisor only through its marker file and signals.
use crate::liveness::is_alive;
use crate::marker::{MarkerError, MarkerFile, PidPair};
use crate::signals::RESTART_SIGNAL;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Why a restart request was refused.
#[derive(Debug)]
pub enum RestartError {
    /// No marker: the directory is not supervised.
    NoMarker { dir: PathBuf },
    /// The recorded supervisor is gone (it crashed without cleaning up).
    SupervisorNotAlive { pid: i32 },
    /// The recorded child is gone.
    ChildNotAlive { pid: i32 },
    /// The marker exists but could not be read.
    Marker(MarkerError),
    /// The restart notification could not be delivered to the supervisor.
    Signal {
        pid: i32,
        signal: Signal,
        source: Errno,
    },
}

impl RestartError {
    /// Process exit code reported for this outcome. Success is 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            RestartError::NoMarker { .. } => 1,
            RestartError::SupervisorNotAlive { .. } => 2,
            RestartError::ChildNotAlive { .. } => 3,
            RestartError::Marker(_) => 4,
            RestartError::Signal { .. } => 5,
        }
    }
}

impl std::fmt::Display for RestartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartError::NoMarker { dir } => {
                write!(f, "no supervisor is running in {}", dir.display())
            }
            RestartError::SupervisorNotAlive { pid } => {
                write!(f, "recorded supervisor process {} is not alive", pid)
            }
            RestartError::ChildNotAlive { pid } => {
                write!(f, "recorded child process {} is not alive", pid)
            }
            RestartError::Marker(e) => write!(f, "{}", e),
            RestartError::Signal {
                pid,
                signal,
                source,
            } => write!(f, "failed to send {} to process {}: {}", signal, pid, source),
        }
    }
}

impl std::error::Error for RestartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RestartError::Marker(e) => Some(e),
            RestartError::Signal { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<MarkerError> for RestartError {
    fn from(e: MarkerError) -> Self {
        RestartError::Marker(e)
    }
}

/// Why a stop request was refused.
#[derive(Debug)]
pub enum StopError {
    NotRunning { dir: PathBuf },
    Marker(MarkerError),
}

impl StopError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StopError::NotRunning { .. } => 1,
            StopError::Marker(_) => 4,
        }
    }
}

impl std::fmt::Display for StopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopError::NotRunning { dir } => {
                write!(f, "no supervisor is running in {}", dir.display())
            }
            StopError::Marker(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StopError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StopError::NotRunning { .. } => None,
            StopError::Marker(e) => Some(e),
        }
    }
}

impl From<MarkerError> for StopError {
    fn from(e: MarkerError) -> Self {
        StopError::Marker(e)
    }
}

fn send(pid: i32, signal: Signal) -> Result<(), Errno> {
    debug!(pid, %signal, "sending signal");
    kill(Pid::from_raw(pid), signal)
}

/// Ask the supervisor owning `dir` to restart its command.
///
/// Both recorded ids are validated before anything is sent. The supervisor is
/// notified first, so its flag is already raised when the child's exit wakes it;
/// then the child gets SIGTERM followed at once by SIGINT, for programs that
/// want a second interrupt before they quit.
pub fn request_restart(dir: &Path) -> Result<PidPair, RestartError> {
    let pair = MarkerFile::in_dir(dir)
        .read()?
        .ok_or_else(|| RestartError::NoMarker {
            dir: dir.to_path_buf(),
        })?;
    if !is_alive(pair.supervisor) {
        return Err(RestartError::SupervisorNotAlive {
            pid: pair.supervisor,
        });
    }
    if !is_alive(pair.child) {
        return Err(RestartError::ChildNotAlive { pid: pair.child });
    }

    send(pair.supervisor, RESTART_SIGNAL).map_err(|e| RestartError::Signal {
        pid: pair.supervisor,
        signal: RESTART_SIGNAL,
        source: e,
    })?;
    for signal in [Signal::SIGTERM, Signal::SIGINT] {
        // The child may already be gone after the first one.
        if let Err(e) = send(pair.child, signal) {
            debug!(pid = pair.child, %signal, error = %e, "child signal not delivered");
        }
    }
    info!(%pair, "restart requested");
    Ok(pair)
}

/// What a stop request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub pair: PidPair,
    /// Recorded ids that were alive and got SIGTERM.
    pub signalled: Vec<i32>,
}

/// Terminate the live recorded processes of `dir` and delete its marker.
///
/// Dead ids are skipped: after a crash their numbers may have been reused by
/// unrelated processes. Does not wait for either process to exit.
pub fn request_stop(dir: &Path) -> Result<StopReport, StopError> {
    let marker = MarkerFile::in_dir(dir);
    let pair = marker.read()?.ok_or_else(|| StopError::NotRunning {
        dir: dir.to_path_buf(),
    })?;
    let mut signalled = Vec::new();
    for pid in [pair.supervisor, pair.child] {
        if !is_alive(pid) {
            debug!(pid, "recorded process not alive, not signalling");
            continue;
        }
        match send(pid, Signal::SIGTERM) {
            Ok(()) => signalled.push(pid),
            Err(e) => debug!(pid, error = %e, "stop signal not delivered"),
        }
    }
    marker.remove()?;
    info!(%pair, ?signalled, "stop requested");
    Ok(StopReport { pair, signalled })
}

/// Snapshot of a directory's marker and the liveness of both ids.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub dir: PathBuf,
    pub supervisor: i32,
    pub supervisor_alive: bool,
    pub child: i32,
    pub child_alive: bool,
}

/// Inspect `dir`. `Ok(None)` means no marker is present.
pub fn status(dir: &Path) -> Result<Option<Status>, MarkerError> {
    Ok(MarkerFile::in_dir(dir).read()?.map(|pair| Status {
        dir: dir.to_path_buf(),
        supervisor: pair.supervisor,
        supervisor_alive: is_alive(pair.supervisor),
        child: pair.child,
        child_alive: is_alive(pair.child),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Child, Command};
    use std::time::{Duration, Instant};

    fn sleeper() -> Child {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    fn exited_pid() -> i32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        pid
    }

    /// Reap `child` if it exits within a few seconds.
    fn exits_soon(child: &mut Child) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if child.try_wait().unwrap().is_some() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn still_running(child: &mut Child) -> bool {
        std::thread::sleep(Duration::from_millis(50));
        child.try_wait().unwrap().is_none()
    }

    fn cleanup(mut child: Child) {
        let _ = child.kill();
        let _ = child.wait();
    }

    fn write_marker(dir: &Path, supervisor: i32, child: i32) {
        MarkerFile::in_dir(dir)
            .write(PidPair::new(supervisor, child))
            .unwrap();
    }

    #[test]
    fn test_restart_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let err = request_restart(dir.path()).unwrap_err();
        assert!(matches!(err, RestartError::NoMarker { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_restart_with_dead_supervisor_leaves_child_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = sleeper();
        let dead = exited_pid();
        write_marker(dir.path(), dead, child.id() as i32);

        let err = request_restart(dir.path()).unwrap_err();
        assert!(matches!(err, RestartError::SupervisorNotAlive { pid } if pid == dead));
        assert_eq!(err.exit_code(), 2);
        assert!(still_running(&mut child));
        assert!(MarkerFile::in_dir(dir.path()).path().exists());
        cleanup(child);
    }

    #[test]
    fn test_restart_with_dead_child_leaves_supervisor_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = sleeper();
        let dead = exited_pid();
        write_marker(dir.path(), supervisor.id() as i32, dead);

        let err = request_restart(dir.path()).unwrap_err();
        assert!(matches!(err, RestartError::ChildNotAlive { pid } if pid == dead));
        assert_eq!(err.exit_code(), 3);
        assert!(still_running(&mut supervisor));
        cleanup(supervisor);
    }

    #[test]
    fn test_restart_with_malformed_marker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(MarkerFile::in_dir(dir.path()).path(), "oops").unwrap();
        let err = request_restart(dir.path()).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_restart_signals_both_and_keeps_marker() {
        let dir = tempfile::tempdir().unwrap();
        // `sleep` dies of SIGUSR1 as well as SIGTERM, which makes delivery observable.
        let mut supervisor = sleeper();
        let mut child = sleeper();
        write_marker(dir.path(), supervisor.id() as i32, child.id() as i32);

        let pair = request_restart(dir.path()).unwrap();
        assert_eq!(pair.child, child.id() as i32);
        assert!(exits_soon(&mut supervisor));
        assert!(exits_soon(&mut child));
        assert_eq!(MarkerFile::in_dir(dir.path()).read().unwrap(), Some(pair));
    }

    #[test]
    fn test_stop_terminates_both_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = sleeper();
        let mut child = sleeper();
        write_marker(dir.path(), supervisor.id() as i32, child.id() as i32);

        let report = request_stop(dir.path()).unwrap();
        assert_eq!(
            report.signalled,
            vec![supervisor.id() as i32, child.id() as i32]
        );
        assert!(exits_soon(&mut supervisor));
        assert!(exits_soon(&mut child));
        assert!(!MarkerFile::in_dir(dir.path()).path().exists());

        let err = request_stop(dir.path()).unwrap_err();
        assert!(matches!(err, StopError::NotRunning { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_stop_with_stale_ids_still_removes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let dead = exited_pid();
        write_marker(dir.path(), dead, dead);

        let report = request_stop(dir.path()).unwrap();
        assert_eq!(report.pair, PidPair::new(dead, dead));
        assert!(report.signalled.is_empty());
        assert!(!MarkerFile::in_dir(dir.path()).path().exists());
    }

    #[test]
    fn test_stop_signals_only_the_live_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = sleeper();
        let dead = exited_pid();
        write_marker(dir.path(), dead, child.id() as i32);

        let report = request_stop(dir.path()).unwrap();
        assert_eq!(report.signalled, vec![child.id() as i32]);
        assert!(exits_soon(&mut child));
    }

    #[test]
    fn test_status_reports_liveness() {
        let dir = tempfile::tempdir().unwrap();
        assert!(status(dir.path()).unwrap().is_none());

        let dead = exited_pid();
        let own = std::process::id() as i32;
        write_marker(dir.path(), own, dead);

        let status = status(dir.path()).unwrap().unwrap();
        assert!(status.supervisor_alive);
        assert!(!status.child_alive);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["supervisor"], own);
        assert_eq!(json["child_alive"], false);
    }
}
