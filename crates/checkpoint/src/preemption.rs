//! Host termination signal

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared flag set once the host asks the process to stop
#[derive(Debug, Clone, Default)]
pub struct PreemptionSignal {
    flag: Arc<AtomicBool>,
}

impl PreemptionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Set the flag on SIGTERM or ctrl-c
    ///
    /// Must be called from within a tokio runtime. The process keeps running;
    /// the driver reacts through [`crate::CheckpointManager::reached_preemption`].
    pub fn listen(&self) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            wait_for_termination().await;
            info!("Termination requested, checkpoints will drain");
            signal.trigger();
        })
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
