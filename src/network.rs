//! Network state monitor
//!
//! Process-wide view of host connectivity. Constructed explicitly by the
//! application's composition root and injected into the components that
//! need it; the monitor is the only place the raw connectivity signal is
//! read, everything else consults it.

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// Tracks whether the host machine is online
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(initial_online: bool) -> Self {
        let (tx, _) = watch::channel(initial_online);
        Self { tx }
    }

    /// Feed a connectivity change from the host application's signal
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!("Network status changed: online={}", online);
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the network is online, bounded by `timeout`.
    ///
    /// Returns true on restoration (or if already online), false if the
    /// timeout elapsed first.
    pub async fn wait_for_online(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async move {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
            // Sender dropped while offline; treat as never restored
            std::future::pending::<()>().await;
        })
        .await
        .is_ok()
    }

    /// Subscribe to connectivity changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn online_resolves_immediately() {
        let monitor = NetworkMonitor::new(true);
        assert!(monitor.is_online());
        assert!(monitor.wait_for_online(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn offline_times_out() {
        let monitor = NetworkMonitor::new(false);
        assert!(!monitor.wait_for_online(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn restoration_wakes_waiters() {
        let monitor = Arc::new(NetworkMonitor::new(false));

        let waiter = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.wait_for_online(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.set_online(true);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn subscribers_see_flips() {
        let monitor = NetworkMonitor::new(true);
        let mut rx = monitor.subscribe();

        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
