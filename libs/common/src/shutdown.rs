//! Graceful shutdown signal handling

use tracing::warn;

/// Which signal ended the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Wait for Ctrl+C, or SIGTERM on Unix
pub async fn wait_for_shutdown() -> ShutdownSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}. Only Ctrl+C will stop the service", e);
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
            _ = async {
                match term_signal {
                    Some(mut sig) => {
                        sig.recv().await;
                    },
                    None => std::future::pending::<()>().await,
                }
            } => ShutdownSignal::Terminate,
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
        ShutdownSignal::Interrupt
    }
}
