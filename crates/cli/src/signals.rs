use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGINT or SIGTERM.
    Shutdown,
    /// SIGUSR1: log the live sessions.
    DumpSessions,
}

/// Forward process signals to `tx` until the receiver is dropped.
#[cfg(unix)]
pub async fn wait_for_signal(tx: mpsc::Sender<SignalEvent>) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        let event = tokio::select! {
            _ = sigint.recv() => SignalEvent::Shutdown,
            _ = sigterm.recv() => SignalEvent::Shutdown,
            _ = sigusr1.recv() => SignalEvent::DumpSessions,
        };
        debug!(?event, "signal received");
        if tx.send(event).await.is_err() {
            warn!("signal listener went away");
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal(tx: mpsc::Sender<SignalEvent>) -> anyhow::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        debug!("ctrl-c received");
        if tx.send(SignalEvent::Shutdown).await.is_err() {
            warn!("signal listener went away");
            return Ok(());
        }
    }
}
