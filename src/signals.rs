//! OS notifications consumed by the event loop.
//!
//! Handlers are installed when [`Notifications::new`] is called. Signals
//! delivered after that point are queued by the runtime until the loop
//! polls for them, so installing before activation means no child exit is
//! missed.

use tokio::signal::unix::{signal, Signal, SignalKind};

/// Notifications the supervisor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// One or more children changed state (SIGCHLD)
    Child,
    /// Termination request (SIGTERM)
    Terminate,
    /// Interrupt (SIGINT)
    Interrupt,
    /// Status dump request (SIGUSR1)
    DumpStatus,
}

/// Multiplexed wait over the supervisor's signals.
pub struct Notifications {
    sigchld: Signal,
    sigterm: Signal,
    sigint: Signal,
    sigusr1: Signal,
}

impl Notifications {
    /// Install the signal handlers.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigchld: signal(SignalKind::child())?,
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sigusr1: signal(SignalKind::user_defined1())?,
        })
    }

    /// Wait for the next notification.
    pub async fn next(&mut self) -> Notification {
        tokio::select! {
            _ = self.sigchld.recv() => Notification::Child,
            _ = self.sigterm.recv() => Notification::Terminate,
            _ = self.sigint.recv() => Notification::Interrupt,
            _ = self.sigusr1.recv() => Notification::DumpStatus,
        }
    }
}
