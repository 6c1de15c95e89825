//! Process signals → cancellation.
//!
//! The reactor only knows about a [`CancellationToken`]; this module is the
//! one place that ties it to SIGINT/SIGTERM (Ctrl-C on other platforms).

use std::io;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// A token cancelled on the first termination signal.
///
/// Handlers are installed before returning, so a failure to register them
/// surfaces here rather than in a detached task. Must be called from within
/// a tokio runtime.
pub fn signal_token() -> io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let cancel = token.clone();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => info!("SIGINT received, shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            }
            cancel.cancel();
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            cancel.cancel();
        }
    });

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_starts_uncancelled() {
        let token = signal_token().unwrap();
        assert!(!token.is_cancelled());
    }
}
