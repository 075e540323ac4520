use std::pin::Pin;

use cfg_if::cfg_if;
use futures::{future::Shared, FutureExt};
use std::future::Future;
use tokio::select;
use tracing::{error, info};

cfg_if! {
    if #[cfg(windows)] {
        use tokio::signal::windows::*;

        async fn ctrl_c_signal() {
            match ctrl_c() {
                Ok(mut signal) => { signal.recv().await; }
                Err(e) => {
                    error!(error = %e, "Failed to attach Ctrl_C shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
        }

        async fn ctrl_close_signal() {
            match ctrl_close() {
                Ok(mut signal) => { signal.recv().await; }
                Err(e) => {
                    error!(error = %e, "Failed to attach Ctrl_close shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
        }

        async fn raw_shutdown_signal() {
            select! {
                _ = ctrl_c_signal() => (),
                _ = ctrl_close_signal() => (),
            }
        }
    } else if #[cfg(unix)] {
        use tokio::signal::unix::*;

        async fn unix_shutdown_signal(signal_kind: SignalKind) {
            match signal(signal_kind) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen to unix shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
        }

        async fn raw_shutdown_signal() {
            select! {
                _ = unix_shutdown_signal(SignalKind::interrupt()) => (),
                _ = unix_shutdown_signal(SignalKind::terminate()) => (),
            };
        }
    } else {
        compile_error!("Your OS does not support shutdown signal ! Are you targeting wasm ?");
    }
}

/// Cloneable future resolving once the process is asked to stop
pub type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Resolves on SIGINT or SIGTERM (Ctrl-C / console close on windows)
pub fn shutdown_signal() -> ShutdownSignal {
    async {
        raw_shutdown_signal().await;
        info!("Shutdown signal detected. Attempting graceful shutdown...");
    }
    .boxed()
    .shared()
}

/// A signal that never fires, for components that are only stopped programmatically
pub fn never() -> ShutdownSignal {
    futures::future::pending::<()>().boxed().shared()
}
