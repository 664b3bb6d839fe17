use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that compacts a tenant's WAL once enough appends pile up.
///
/// This is log maintenance only. Statuses are never rewritten here; DONE is
/// derived at read time.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Returns true if a compaction ran and succeeded.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    let pruned = engine.notify.prune();
    if pruned > 0 {
        debug!("pruned {pruned} idle notification channels");
    }
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("WAL compacted after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{claim, publish_slots};
    use crate::notify::NotifyHub;
    use crate::wal::Wal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn below_threshold_does_nothing() {
        let path = test_wal_path("below_threshold.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
        let provider = Ulid::new();
        engine.register_service(Ulid::new(), provider, Some(provider)).await.unwrap();

        assert!(!compact_if_due(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 1);
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("preserves_state.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let provider = Ulid::new();
        let sid = Ulid::new();
        engine.register_service(sid, provider, Some(provider)).await.unwrap();
        let slots: Vec<(Ulid, i64)> = (0..4).map(|i| (Ulid::new(), 1_000 + i)).collect();
        publish_slots(&engine, Some(provider), sid, &slots).await.unwrap();
        let user = Ulid::new();
        claim(&engine, slots[0].0, Some(user)).await.unwrap();

        assert!(compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // register + 4 published + 1 claimed
        assert_eq!(Wal::replay(&path).unwrap().len(), 6);
    }
}
