//! Graceful shutdown.
//!
//! [`interrupt`] resolves on the first Ctrl-C (or SIGTERM on Unix). The
//! [`ShutdownCoordinator`] then asks every active service to stop and waits
//! for them, optionally bounded by a timeout. Once tokio has installed its
//! signal handler, further interrupts no longer kill the process, so a second
//! Ctrl-C during shutdown has no effect.

use crate::{ProxyError, orchestrator::Orchestrator};
use std::{fmt, time::Duration};
use tracing::{debug, error, info, warn};

/// Interrupt is the external event that triggered shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    CtrlC,
    Terminate,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::CtrlC => f.write_str("interrupt"),
            Interrupt::Terminate => f.write_str("terminated"),
        }
    }
}

/// interrupt waits for the process to be asked to stop. If no signal handler
/// can be installed it never resolves and the proxies keep running
#[cfg(unix)]
pub async fn interrupt() -> Interrupt {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                ctrl_c = ctrl_c() => ctrl_c,
                _ = terminate.recv() => Interrupt::Terminate,
            }
        }
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
pub async fn interrupt() -> Interrupt {
    ctrl_c().await
}

async fn ctrl_c() -> Interrupt {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Interrupt::CtrlC,
        Err(e) => {
            error!("failed to install Ctrl-C handler: {}", e);
            std::future::pending().await
        }
    }
}

/// ShutdownCoordinator drives every active service to Stopped
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownCoordinator {
    timeout: Option<Duration>,
}

/// ShutdownCoordinator implementation block
impl ShutdownCoordinator {
    /// new builds a coordinator; `None` waits for the services without bound
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// shutdown runs the stop sequence once per orchestrator. Later calls
    /// return immediately
    pub async fn shutdown(
        &self,
        orchestrator: &mut Orchestrator,
        reason: &str,
    ) -> Result<(), ProxyError> {
        if !orchestrator.begin_shutdown() {
            debug!("shutdown already in progress, ignoring {}", reason);
            return Ok(());
        }

        info!("Shutting down... reason: {}", reason);

        orchestrator.request_stop_all();

        if let Err(e) = orchestrator.await_all_stopped(self.timeout).await {
            error!("{}", e);
            return Err(e);
        }

        info!("all proxy services stopped");
        Ok(())
    }
}
