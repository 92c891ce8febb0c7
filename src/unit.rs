/// One fork/wait cycle: spawn a subprocess, record it in the marker, wait for it
/// to exit, then confirm its pid is gone.
use crate::config::SettleConfig;
use crate::liveness;
use crate::marker::{MarkerError, MarkerFile, PidPair};
use std::path::Path;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

/// Result of a completed unit.
#[derive(Debug)]
pub struct UnitResult {
    /// Process exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the unit.
    pub duration: Duration,
    pub pid: i32,
}

/// Errors that can occur while running a unit.
#[derive(Debug)]
pub enum UnitError {
    /// Failed to spawn the subprocess.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The subprocess started but could not be recorded in the marker.
    /// It has been killed and reaped.
    Marker { pid: i32, source: MarkerError },
    /// Failed to wait on the subprocess.
    Wait { pid: i32, source: std::io::Error },
}

impl std::fmt::Display for UnitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            UnitError::Marker { pid, source } => {
                write!(f, "failed to record child {}: {}", pid, source)
            }
            UnitError::Wait { pid, source } => {
                write!(f, "failed to wait for process {}: {}", pid, source)
            }
        }
    }
}

impl std::error::Error for UnitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UnitError::Spawn { source, .. } => Some(source),
            UnitError::Marker { source, .. } => Some(source),
            UnitError::Wait { source, .. } => Some(source),
        }
    }
}

/// Build `<shell> -c <command>` running in `dir`.
pub fn shell_command(shell: &str, command: &str, dir: &Path) -> Command {
    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(command).current_dir(dir);
    cmd
}

/// Build the idle placeholder: a bare `sleep` so a signal to its pid ends it directly.
pub fn idle_command(secs: u64, dir: &Path) -> Command {
    let mut cmd = Command::new("sleep");
    cmd.arg(secs.to_string()).current_dir(dir);
    cmd
}

/// A spawned subprocess whose pid has been written to the marker.
///
/// The child stays in the supervisor's process group and inherits its stdio,
/// so interactive programs keep the terminal.
#[derive(Debug)]
pub struct ForkedUnit {
    child: Child,
    pid: i32,
    start: Instant,
}

impl ForkedUnit {
    /// Spawn `command` and record `(own pid, child pid)` in `marker`.
    ///
    /// If the marker cannot be written the child is killed and reaped before
    /// returning the error, since nothing could reach it afterwards.
    pub async fn spawn(command: &mut Command, marker: &MarkerFile) -> Result<Self, UnitError> {
        let program = command.as_std().get_program().to_string_lossy().to_string();
        let mut child = command
            .spawn()
            .map_err(|e| UnitError::Spawn { program, source: e })?;
        let pid = child.id().map(|id| id as i32).unwrap_or(0);

        if let Err(e) = marker.write(PidPair::new(std::process::id() as i32, pid)) {
            if let Err(kill_err) = child.kill().await {
                tracing::warn!(pid, error = %kill_err, "failed to kill unrecorded child");
            }
            return Err(UnitError::Marker { pid, source: e });
        }
        tracing::debug!(pid, "unit started");

        Ok(Self {
            child,
            pid,
            start: Instant::now(),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Block until the child exits. Cancel-safe: dropping the future leaves the
    /// child running and the unit waitable again.
    pub async fn exited(&mut self) -> Result<ExitStatus, UnitError> {
        self.child.wait().await.map_err(|e| UnitError::Wait {
            pid: self.pid,
            source: e,
        })
    }

    /// Wait for the child to exit, then poll until its pid is confirmed gone.
    pub async fn wait(mut self, settle: &SettleConfig) -> Result<UnitResult, UnitError> {
        let status = self.exited().await?;
        self.finish(status, settle).await
    }

    /// Complete a unit whose exit status has already been observed.
    pub async fn finish(
        self,
        status: ExitStatus,
        settle: &SettleConfig,
    ) -> Result<UnitResult, UnitError> {
        liveness::wait_until_dead(self.pid, settle.poll_interval(), settle.max_polls).await;
        let result = UnitResult {
            exit_code: status.code(),
            duration: self.start.elapsed(),
            pid: self.pid,
        };
        tracing::debug!(
            pid = result.pid,
            exit_code = ?result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            "unit finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settle() -> SettleConfig {
        SettleConfig {
            poll_interval_ms: 5,
            max_polls: 200,
        }
    }

    #[tokio::test]
    async fn test_exit_code_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let marker = MarkerFile::in_dir(dir.path());
        let mut cmd = shell_command("sh", "exit 3", dir.path());

        let unit = ForkedUnit::spawn(&mut cmd, &marker).await.unwrap();
        let result = unit.wait(&settle()).await.unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert!(!liveness::is_alive(result.pid));
    }

    #[tokio::test]
    async fn test_marker_records_own_pid_and_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = MarkerFile::in_dir(dir.path());
        let mut cmd = shell_command("sh", "exec sleep 30", dir.path());

        let unit = ForkedUnit::spawn(&mut cmd, &marker).await.unwrap();
        let pair = marker.read().unwrap().unwrap();
        assert_eq!(pair.supervisor, std::process::id() as i32);
        assert_eq!(pair.child, unit.pid());
        assert!(liveness::is_alive(pair.child));

        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(unit.pid()),
            nix::sys::signal::Signal::SIGTERM,
        )
        .unwrap();
        let result = unit.wait(&settle()).await.unwrap();
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn test_runs_in_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        let marker = MarkerFile::in_dir(dir.path());
        let mut cmd = shell_command("sh", "touch here", dir.path());

        ForkedUnit::spawn(&mut cmd, &marker)
            .await
            .unwrap()
            .wait(&settle())
            .await
            .unwrap();
        assert!(dir.path().join("here").exists());
    }

    #[tokio::test]
    async fn test_idle_command_is_bare_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let marker = MarkerFile::in_dir(dir.path());
        let mut cmd = idle_command(1000, dir.path());
        assert_eq!(cmd.as_std().get_program(), "sleep");

        let unit = ForkedUnit::spawn(&mut cmd, &marker).await.unwrap();
        let start = Instant::now();
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(unit.pid()),
            nix::sys::signal::Signal::SIGTERM,
        )
        .unwrap();
        unit.wait(&settle()).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = MarkerFile::in_dir(dir.path());
        let mut cmd = shell_command("nonexistent-shell-xyz", "true", dir.path());

        let err = ForkedUnit::spawn(&mut cmd, &marker).await.unwrap_err();
        assert!(matches!(err, UnitError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn nonexistent-shell-xyz"));
        assert_eq!(marker.read().unwrap(), None);
    }

    #[tokio::test]
    async fn test_marker_failure_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = MarkerFile::in_dir(&dir.path().join("missing"));
        let mut cmd = shell_command("sh", "exec sleep 30", dir.path());

        let err = ForkedUnit::spawn(&mut cmd, &marker).await.unwrap_err();
        let UnitError::Marker { pid, .. } = err else {
            panic!("expected marker error, got {err:?}");
        };
        assert!(pid > 0);
        assert!(!liveness::is_alive(pid));
    }
}
