use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. Repeat signals while a shutdown is in progress are logged
/// and dropped.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT");
                }
            }
            if token_clone.is_cancelled() {
                tracing::warn!("Shutdown already in progress, ignoring repeated signal");
                continue;
            }
            tracing::info!("Initiating graceful shutdown");
            token_clone.cancel();
        }
    });

    token
}

type ShutdownStep = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Completed,
    TimedOut,
}

impl ShutdownOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownOutcome::Completed => 0,
            ShutdownOutcome::TimedOut => 1,
        }
    }
}

/// Ordered async teardown under a single global deadline.
///
/// Steps run in registration order; an error in one step is logged and
/// does not short-circuit the rest. Exceeding the deadline abandons the
/// remaining steps and yields `TimedOut`.
pub struct ShutdownCoordinator {
    steps: Vec<(String, ShutdownStep)>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            steps: Vec::new(),
            timeout,
        }
    }

    pub fn register<F>(&mut self, name: &str, step: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push((name.to_string(), Box::pin(step)));
    }

    pub async fn run(self) -> ShutdownOutcome {
        let timeout = self.timeout;
        let steps = self.steps;
        let teardown = async move {
            for (name, step) in steps {
                tracing::info!(step = %name, "Running shutdown step");
                if let Err(err) = step.await {
                    tracing::error!(step = %name, error = %err, "Shutdown step failed");
                }
            }
        };
        match tokio::time::timeout(timeout, teardown).await {
            Ok(()) => {
                tracing::info!("Graceful shutdown complete");
                ShutdownOutcome::Completed
            }
            Err(_) => {
                tracing::error!(timeout_secs = timeout.as_secs(), "Shutdown deadline exceeded");
                ShutdownOutcome::TimedOut
            }
        }
    }
}
