//! Periodic connection health checks.
//!
//! The watchdog sweeps every registered session on a fixed interval and runs
//! its health probe. Recovery happens inside the session; the watchdog only
//! schedules it and logs the outcome. A failing session never stops the
//! sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{registry::SessionRegistry, session::AuthStatus};

pub struct ConnectionWatchdog {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConnectionWatchdog {
    pub fn start(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(registry, interval, cancel.clone()));
        Self { cancel, handle }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run(registry: Arc<SessionRegistry>, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        sweep(&registry).await;
    }
    debug!("watchdog stopped");
}

async fn sweep(registry: &SessionRegistry) {
    for session in registry.sessions_snapshot().await {
        match session.status().await {
            AuthStatus::Authorized | AuthStatus::Degraded => {}
            // Nothing to probe before login or during shutdown.
            _ => continue,
        }
        if let Err(err) = session.check_health().await {
            warn!(user = %session.user_id(), error = %err, "health check failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserId;
    use crate::metrics::InProcessMetrics;
    use crate::remote::RemoteClient;
    use crate::testutil::{test_config, FakeConnector, FakeRemoteClient, MemorySessionStore};

    #[tokio::test]
    async fn watchdog_reconnects_dropped_sessions() {
        let user = UserId(3);
        let client = Arc::new(FakeRemoteClient::authorized(user));
        let connector = Arc::new(FakeConnector::with_client(user, Arc::clone(&client)));
        let cfg = test_config();
        let interval = cfg.watchdog_interval;
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(cfg),
            connector,
            Arc::new(MemorySessionStore::new()),
            Arc::new(InProcessMetrics::new()),
        ));
        registry.session(user).await.unwrap();

        client.set_connected(false);
        let watchdog = ConnectionWatchdog::start(Arc::clone(&registry), interval);
        for _ in 0..100 {
            if client.is_connected().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(client.is_connected().await);
        watchdog.stop().await;
    }

    #[tokio::test]
    async fn watchdog_skips_unauthenticated_sessions() {
        let user = UserId(4);
        let client = Arc::new(FakeRemoteClient::unauthorized(user));
        let connector = Arc::new(FakeConnector::with_client(user, Arc::clone(&client)));
        let cfg = test_config();
        let interval = cfg.watchdog_interval;
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(cfg),
            connector,
            Arc::new(MemorySessionStore::new()),
            Arc::new(InProcessMetrics::new()),
        ));
        let session = registry.session(user).await.unwrap();

        let watchdog = ConnectionWatchdog::start(Arc::clone(&registry), interval);
        tokio::time::sleep(interval * 3).await;
        watchdog.stop().await;
        // Still waiting for login; the watchdog left it alone.
        assert_eq!(session.status().await, crate::session::AuthStatus::Unauthenticated);
    }
}
