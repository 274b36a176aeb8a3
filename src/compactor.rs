use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a property's WAL once enough commits have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether the WAL was rewritten.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends since last compaction, below {threshold}");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
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
    use crate::directory::{InMemoryGuests, InMemoryPayments};
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bunkhouse_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::open(
            path.clone(),
            Arc::new(InMemoryGuests::new()),
            Arc::new(InMemoryPayments::new()),
        )
        .unwrap();

        engine.create_room(1, "Dorm".into(), None).await.unwrap();
        engine.add_bed(10, 1).await.unwrap();
        assert!(!compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 2);

        engine.add_facility(1, "Locker".into()).await.unwrap();
        assert!(compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let reopened = Engine::open(
            path,
            Arc::new(InMemoryGuests::new()),
            Arc::new(InMemoryPayments::new()),
        )
        .unwrap();
        let rooms = reopened.list_rooms();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].beds, vec![10]);
        assert_eq!(rooms[0].facilities[0].name, "Locker");
    }
}
