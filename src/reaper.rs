use crate::store::SessionStore;
use chrono::Utc;
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::info;

/// Periodically evicts idle sessions. The task runs for the life of the
/// process; dropping the handle does not stop it.
pub fn spawn(store: SessionStore, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = store.reap(Utc::now()).await;
            if evicted > 0 {
                crate::metrics::sessions_reaped(evicted);
                let remaining = store.len().await;
                info!(
                    target = "studio.store",
                    evicted,
                    remaining,
                    "idle_sessions_reaped"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reaper_evicts_expired_sessions() {
        let store = SessionStore::new(Duration::from_millis(20));
        let id = store.create().await;
        let handle = spawn(store.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.get(id).await.is_err());
        handle.abort();
    }
}
