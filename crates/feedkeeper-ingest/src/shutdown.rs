//! Cooperative shutdown signal shared by the backfill, the live feed and
//! the service. `true` on the watch channel means "stop producing".

use tokio::sync::watch;

/// Create a shutdown trigger and its receiver.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once shutdown has been requested.
///
/// A dropped sender never signals; the caller then runs until its own work
/// is finished.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
