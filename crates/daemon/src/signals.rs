//! Signal handling for the daemon loop.
//!
//! SIGHUP asks for a partition reload; SIGTERM, SIGINT, and Ctrl+C ask for
//! shutdown. On non-Unix platforms only Ctrl+C is available.

use tracing::info;

/// What the received signal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Reload,
    Shutdown,
}

/// Wait for the next daemon signal.
pub async fn wait_for_signal() -> Signal {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT (Ctrl+C)");
                Signal::Shutdown
            }
            _ = terminate.recv() => {
                info!("received SIGTERM");
                Signal::Shutdown
            }
            _ = hangup.recv() => {
                info!("received SIGHUP");
                Signal::Reload
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("received Ctrl+C");
        Signal::Shutdown
    }
}
