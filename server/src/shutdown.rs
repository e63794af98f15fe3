//! Process-wide shutdown: many triggers, one teardown.

use log::{error, info};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Where the shutdown request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSource {
    Interrupt,
    Http,
    /// An instance failed to start and took the fleet down with it
    Fatal,
}

impl fmt::Display for ShutdownSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSource::Interrupt => f.write_str("interrupt"),
            ShutdownSource::Http => f.write_str("http"),
            ShutdownSource::Fatal => f.write_str("fatal instance error"),
        }
    }
}

/// Fans termination triggers in and a single stop signal out.
///
/// Server instances and the HTTP listener each hold a clone of the
/// cancellation token. Only the first `trigger` records its source and logs;
/// later calls, concurrent or not, are silent no-ops.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    source: Arc<OnceLock<ShutdownSource>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the shutdown. Returns `true` only for the call that won.
    pub fn trigger(&self, source: ShutdownSource) -> bool {
        let first = self.source.set(source).is_ok();
        if first {
            info!("Shutdown requested ({})", source);
        }
        // Cancelling an already cancelled token is a no-op
        self.token.cancel();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Source of the first trigger, if any
    pub fn source(&self) -> Option<ShutdownSource> {
        self.source.get().copied()
    }

    /// Token handed to every worker that must stop on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Triggers shutdown on Ctrl+C. The task ends when shutdown happens for
    /// any other reason.
    pub fn spawn_interrupt_listener(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => {
                        coordinator.trigger(ShutdownSource::Interrupt);
                    }
                    Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
                },
                _ = coordinator.triggered() => {}
            }
        })
    }
}
