use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that periodically drops expired waitlist entries.
pub async fn run_waitlist_reaper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match engine.purge_expired_waitlist().await {
            Ok(0) => {}
            Ok(n) => info!("reaped {n} expired waitlist entries"),
            // Store hiccup; the next tick tries again.
            Err(e) => tracing::debug!("waitlist reaper skipped a tick: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EngineConfig;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::store::{AppointmentLedger, InMemoryStore, Mutation};
    use ulid::Ulid;

    #[tokio::test]
    async fn reaper_purges_expired_entries() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(10 * DAY_MS));
        let engine = Arc::new(
            Engine::in_memory(store.clone(), Arc::new(NotifyHub::new()), EngineConfig::default())
                .with_clock(clock.clone()),
        );

        let branch = Ulid::new();
        let entry = |expires_at| WaitlistEntry {
            id: Ulid::new(),
            customer_id: Ulid::new(),
            branch_id: branch,
            service_ids: vec![],
            preferred_start: 0,
            expires_at,
            source_appointment: None,
        };
        store
            .commit(vec![
                Mutation::CreateWaitlist { entry: entry(9 * DAY_MS) },
                Mutation::CreateWaitlist { entry: entry(12 * DAY_MS) },
            ])
            .await
            .unwrap();

        let task = tokio::spawn(run_waitlist_reaper(engine.clone(), Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.waitlist(branch).await.unwrap().len(), 1);

        clock.set(13 * DAY_MS);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.waitlist(branch).await.unwrap().is_empty());
        task.abort();
    }
}
