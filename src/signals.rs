/// Signal handling for the supervisor.
///
/// SIGUSR1 is the restart notification: its listener only raises the restart
/// flag, the loop decides what to do once its current wait returns.
/// SIGTERM, SIGINT and SIGHUP request graceful shutdown.
use nix::sys::signal::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

/// Signal a controller sends to the supervisor to request a restart.
pub const RESTART_SIGNAL: Signal = Signal::SIGUSR1;

/// Restart-requested flag shared between the signal listener and the loop.
///
/// Single writer (the listener), single reader (the loop), so an atomic suffices.
#[derive(Debug, Clone, Default)]
pub struct RestartFlag {
    inner: Arc<FlagInner>,
}

#[derive(Debug, Default)]
struct FlagInner {
    raised: AtomicBool,
    notify: Notify,
}

impl RestartFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.inner.raised.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Return `true` if the flag is raised now or becomes raised within `grace`.
    pub async fn raised_within(&self, grace: Duration) -> bool {
        if self.is_raised() {
            return true;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_raised() {
            return true;
        }
        let _ = tokio::time::timeout(grace, notified).await;
        self.is_raised()
    }
}

/// Start a task that raises `flag` on every restart notification.
///
/// Must be called from within a tokio runtime.
pub fn listen_for_restart(flag: RestartFlag) -> std::io::Result<()> {
    let mut stream = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            tracing::info!("restart notification received");
            flag.raise();
        }
    });
    Ok(())
}

/// Listeners for the graceful-shutdown signals.
///
/// Dropping this stops reacting to them; tokio keeps its handler installed, so a
/// later SIGTERM aimed at our own process group is absorbed instead of killing us
/// halfway through cleanup.
pub struct ShutdownSignals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the first shutdown signal.
    pub async fn recv(mut self) {
        let name = tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
            _ = self.hup.recv() => "SIGHUP",
        };
        tracing::info!(signal = name, "shutdown requested");
    }
}
