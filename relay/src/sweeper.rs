use std::time::Duration;

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

use crate::registry::SessionRegistry;

/// Periodically removes sessions older than the registry's TTL.
pub fn spawn_sweeper(registry: SessionRegistry, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = registry.sweep_expired();
            if removed > 0 {
                debug!("Sweep removed {} expired sessions", removed);
            }
        }
    })
}
