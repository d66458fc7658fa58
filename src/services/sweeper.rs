//! Periodic eviction of expired files.
//!
//! Runs one sweep per interval against the configured backend. Sweeps never
//! overlap: the loop awaits the running sweep before the next tick fires,
//! and a tick that would have landed mid-sweep is rescheduled after it
//! completes. A failed sweep cycle is logged and the schedule carries on.

use crate::services::storage::TempStorage;
use std::{sync::Arc, time::Duration};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub async fn run(storage: Arc<dyn TempStorage>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(interval_secs = interval.as_secs(), "eviction sweeper running");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("eviction sweeper shutting down");
                return;
            }
            _ = ticker.tick() => {}
        }

        debug!("start temp file storage sweep");
        match storage.sweep(&shutdown).await {
            Ok(removed) => debug!(removed, "temp file storage sweep finished"),
            Err(err) => error!("temp file storage sweep failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        memory_storage::MemoryStorage,
        storage::{one_shot, StorageLimits},
    };
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn sweeper_evicts_expired_files_on_schedule() {
        let storage = Arc::new(MemoryStorage::new(StorageLimits::default()));
        let expired = storage
            .store_stream(
                "old.txt",
                one_shot(Bytes::from_static(b"x")),
                ChronoDuration::seconds(-1),
                false,
                true,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let live = storage
            .store_stream(
                "new.txt",
                one_shot(Bytes::from_static(b"y")),
                ChronoDuration::hours(1),
                false,
                true,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            storage.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        // First sweep fires on the first tick, which is immediate.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(storage.content(&expired.key).await.unwrap().is_none());
        assert!(storage.content(&live.key).await.unwrap().is_some());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn sweeper_stops_promptly_on_shutdown() {
        let storage = Arc::new(MemoryStorage::new(StorageLimits::default()));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(storage, Duration::from_secs(3600), shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop after cancellation")
            .unwrap();
    }
}
