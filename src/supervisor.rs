/// The supervision loop: run the command, wait for it, restart it on request,
/// idle when it ends on its own, and clean up on shutdown.
use crate::announce::{Announcer, Console};
use crate::config::RespawnConfig;
use crate::liveness;
use crate::marker::{MarkerError, MarkerFile};
use crate::signals::{self, RestartFlag, ShutdownSignals};
use crate::unit::{idle_command, shell_command, ForkedUnit, UnitError};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgrp, Pid};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the supervisor was asked to run, and where.
#[derive(Debug, Clone)]
pub struct Session {
    pub command: String,
    pub dir: PathBuf,
    pub preserve_output: bool,
}

/// Loop states, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    StartingRealCommand,
    CommandRunning,
    CommandExitedNaturally,
    RestartRequested,
    IdleSleep,
    ShuttingDown,
}

/// Errors that end a supervisor.
#[derive(Debug)]
pub enum SupervisorError {
    /// Another live supervisor owns the directory.
    OwnershipConflict { dir: PathBuf, supervisor: i32 },
    /// Failed to install signal listeners.
    Signals(std::io::Error),
    Marker(MarkerError),
    Unit(UnitError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::OwnershipConflict { dir, supervisor } => write!(
                f,
                "{} is already supervised by process {}",
                dir.display(),
                supervisor
            ),
            SupervisorError::Signals(e) => write!(f, "failed to install signal handlers: {}", e),
            SupervisorError::Marker(e) => write!(f, "{}", e),
            SupervisorError::Unit(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::OwnershipConflict { .. } => None,
            SupervisorError::Signals(e) => Some(e),
            SupervisorError::Marker(e) => Some(e),
            SupervisorError::Unit(e) => Some(e),
        }
    }
}

impl From<MarkerError> for SupervisorError {
    fn from(e: MarkerError) -> Self {
        SupervisorError::Marker(e)
    }
}

impl From<UnitError> for SupervisorError {
    fn from(e: UnitError) -> Self {
        SupervisorError::Unit(e)
    }
}

/// Take ownership of `dir`'s marker.
///
/// A marker naming a live supervisor is a conflict. A marker naming a dead one,
/// or one that cannot be parsed, is left over from a crash and gets taken over.
pub fn claim(dir: &std::path::Path) -> Result<MarkerFile, SupervisorError> {
    let marker = MarkerFile::in_dir(dir);
    let own = std::process::id() as i32;
    match marker.read() {
        Ok(Some(pair)) if pair.supervisor != own && liveness::is_alive(pair.supervisor) => {
            Err(SupervisorError::OwnershipConflict {
                dir: dir.to_path_buf(),
                supervisor: pair.supervisor,
            })
        }
        Ok(Some(pair)) => {
            warn!(%pair, "taking over stale marker");
            Ok(marker)
        }
        Ok(None) => Ok(marker),
        Err(e @ MarkerError::Malformed { .. }) => {
            warn!(error = %e, "taking over unreadable marker");
            Ok(marker)
        }
        Err(e) => Err(e.into()),
    }
}

/// Supervise `session` until a shutdown signal arrives.
///
/// The directory is claimed and the restart listener installed before anything
/// is forked, so a marker never names a supervisor that would die of SIGUSR1.
pub async fn run_supervised(session: Session, config: RespawnConfig) -> Result<(), SupervisorError> {
    let marker = claim(&session.dir)?;
    let announcer = Arc::new(Console::new(session.preserve_output));
    let restart = RestartFlag::new();
    signals::listen_for_restart(restart.clone()).map_err(SupervisorError::Signals)?;
    let shutdown = ShutdownSignals::install().map_err(SupervisorError::Signals)?;

    info!(command = %session.command, dir = %session.dir.display(), "supervising");
    Supervisor::new(session, config, marker, restart, announcer)
        .run(shutdown.recv())
        .await
}

pub struct Supervisor {
    session: Session,
    config: RespawnConfig,
    marker: MarkerFile,
    restart: RestartFlag,
    announcer: Arc<dyn Announcer>,
}

impl Supervisor {
    pub fn new(
        session: Session,
        config: RespawnConfig,
        marker: MarkerFile,
        restart: RestartFlag,
        announcer: Arc<dyn Announcer>,
    ) -> Self {
        Self {
            session,
            config,
            marker,
            restart,
            announcer,
        }
    }

    fn transition(&self, state: LoopState) {
        debug!(?state, "supervisor state");
    }

    /// Run the loop until `shutdown` resolves.
    ///
    /// The restart flag is only read here, after a wait has returned; the signal
    /// listener never touches the child.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let command = &self.session.command;
        let dir = &self.session.dir;

        loop {
            self.restart.clear();
            self.transition(LoopState::StartingRealCommand);
            // Announce before forking: the notice may clear the screen, which must
            // not wipe what the new child prints.
            self.announcer.starting(command);
            let mut cmd = shell_command(&self.config.supervisor.shell, command, dir);
            let mut unit = ForkedUnit::spawn(&mut cmd, &self.marker).await?;
            self.transition(LoopState::CommandRunning);

            let Some(status) = Self::wait_or_shutdown(&mut unit, &mut shutdown).await? else {
                return self.shut_down(Some(unit)).await;
            };
            let result = unit.finish(status, &self.config.settle).await?;

            // A child killed by a controller can be reaped before our own restart
            // notification has been handled, so give it a short grace period.
            let grace = self.config.supervisor.restart_grace();
            let restart_requested = tokio::select! {
                biased;
                _ = shutdown.as_mut() => return self.shut_down(None).await,
                raised = self.restart.raised_within(grace) => raised,
            };
            if restart_requested {
                self.transition(LoopState::RestartRequested);
                info!(pid = result.pid, "restarting command");
                continue;
            }

            self.transition(LoopState::CommandExitedNaturally);
            info!(exit_code = ?result.exit_code, "command exited");
            self.announcer.finished(command, result.exit_code);

            self.transition(LoopState::IdleSleep);
            let mut cmd = idle_command(self.config.supervisor.idle_sleep_secs, dir);
            let mut idle = ForkedUnit::spawn(&mut cmd, &self.marker).await?;
            let Some(status) = Self::wait_or_shutdown(&mut idle, &mut shutdown).await? else {
                return self.shut_down(Some(idle)).await;
            };
            idle.finish(status, &self.config.settle).await?;

            // Consume the notification that ended the idle sleep, so it cannot be
            // raised after the next iteration has cleared the flag.
            tokio::select! {
                biased;
                _ = shutdown.as_mut() => return self.shut_down(None).await,
                raised = self.restart.raised_within(grace) => {
                    debug!(raised, "idle sleep ended");
                }
            }
        }
    }

    /// Wait for `unit` to exit. `None` means shutdown was requested first.
    async fn wait_or_shutdown<F>(
        unit: &mut ForkedUnit,
        shutdown: &mut std::pin::Pin<&mut F>,
    ) -> Result<Option<ExitStatus>, UnitError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = shutdown.as_mut() => Ok(None),
            status = unit.exited() => status.map(Some),
        }
    }

    /// Remove the marker, then terminate the process group (or just the current
    /// child) and wait for the child to go, up to the settle ceiling.
    async fn shut_down(&self, unit: Option<ForkedUnit>) -> Result<(), SupervisorError> {
        self.transition(LoopState::ShuttingDown);
        if !self.marker.remove()? {
            debug!(path = %self.marker.path().display(), "marker already removed");
        }
        self.announcer.clear_title();

        let pid = unit.as_ref().map(ForkedUnit::pid);
        let sent = if self.config.shutdown.signal_group {
            killpg(getpgrp(), Signal::SIGTERM)
        } else if let Some(pid) = pid {
            kill(Pid::from_raw(pid), Signal::SIGTERM)
        } else {
            Ok(())
        };
        if let Err(e) = sent {
            warn!(?pid, error = %e, "failed to deliver shutdown signal");
        }

        if let Some(unit) = unit {
            let settle = &self.config.settle;
            let ceiling = settle.poll_interval() * settle.max_polls.max(1);
            let pid = unit.pid();
            match tokio::time::timeout(ceiling, unit.wait(settle)).await {
                Ok(result) => {
                    result?;
                }
                Err(_) => {
                    warn!(pid, "child ignored SIGTERM, sending SIGKILL");
                    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                }
            }
        }
        info!("supervisor stopped");
        Ok(())
    }
}
