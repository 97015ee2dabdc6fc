//! Idle session expiry

use crate::session::SessionRegistry;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval};

/// Periodically ends sessions that have gone quiet
pub struct SessionReaper {
    registry: Arc<SessionRegistry>,
    check_interval: Duration,
    idle_timeout: Duration,
}

impl SessionReaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        check_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            check_interval,
            idle_timeout,
        }
    }

    /// Start reaping loop
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.check_interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "Session reaper started"
        );

        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// One pass over the registry; returns how many sessions were ended
    pub async fn sweep(&self) -> usize {
        let reaped = self.registry.reap_idle(self.idle_timeout).await;
        if reaped > 0 {
            tracing::info!(
                reaped,
                remaining = self.registry.count(),
                "Expired idle sessions"
            );
        }
        reaped
    }
}
