use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::engine::Engine;
use crate::observability::WAL_COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once `threshold` appends have
/// accumulated since the last compaction. A threshold of 0 disables it.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    if threshold == 0 {
        debug!("WAL compaction disabled");
        return;
    }
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        maybe_compact(&engine, threshold).await;
    }
}

/// Compact if the WAL has grown past `threshold`. Returns whether it ran.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL, "status" => "error").increment(1);
            error!("WAL compaction failed after {appends} appends: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("duet_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), Duration::from_secs(1)).unwrap();

        for i in 0..3 {
            engine
                .register_person(Ulid::new(), format!("p{i}@example.com"))
                .await
                .unwrap();
        }
        assert!(!maybe_compact(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        let id = Ulid::new();
        engine.register_person(id, "gone@example.com".into()).await.unwrap();
        engine.remove_person(id).await.unwrap();
        assert!(maybe_compact(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let engine = Engine::new(path, Duration::from_secs(1)).unwrap();
        assert!(engine.get_person(&id).is_err());
        assert_eq!(engine.person_count(), 3);
    }
}
