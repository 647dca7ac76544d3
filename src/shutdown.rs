//! Graceful shutdown sequencing (SPEC_FULL.md §5, §9). Grounded on the
//! teacher's `main.rs` shutdown sequence: stop accepting new work, drain
//! in-flight work against a deadline, then tear down external connections.

use std::time::Duration;

use tokio::sync::watch;

use crate::models::SmallTradeBufferingConfig;
use crate::small_trade_buffer::SmallTradeBuffer;

/// Cooperative shutdown signal. Consumer loops should `select!` on
/// `receiver.changed()` alongside their normal work and stop claiming new
/// jobs once it fires.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownReceiver {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> (Self, ShutdownReceiver) {
        let (sender, receiver) = watch::channel(false);
        (ShutdownSignal { sender }, ShutdownReceiver { receiver })
    }

    pub fn fire(&self) {
        let _ = self.sender.send(true);
    }
}

impl ShutdownReceiver {
    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    pub async fn wait(&mut self) {
        let _ = self.receiver.changed().await;
    }
}

/// Run the shutdown sequence: flush the small-trade buffer with
/// `reason=shutdown` within `grace_period`, log anything left undrained.
pub async fn run_shutdown_sequence(
    buffer: &SmallTradeBuffer,
    buffering_cfg: &SmallTradeBufferingConfig,
    grace_period: Duration,
) {
    tracing::info!("shutdown: flushing small-trade buffer");
    let flush = tokio::time::timeout(grace_period, buffer.flush_all_for_shutdown(buffering_cfg)).await;
    match flush {
        Ok(Ok(outcomes)) => {
            tracing::info!(count = outcomes.len(), "shutdown: buffer flush complete");
        }
        Ok(Err(err)) => {
            tracing::error!(error = %err, "shutdown: buffer flush failed");
        }
        Err(_) => {
            tracing::warn!("shutdown: buffer flush did not complete within the grace period");
        }
    }
}

pub async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
