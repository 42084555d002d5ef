use super::{
    rank_by_utilization, total_connections, upsert, ConnectionStats, GameServerRecord,
    StatsStore, StoreError,
};
use crate::cancel::CancelToken;
use async_trait::async_trait;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// How often [`StatsStore::run`] re-reads the file written by other processes
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatsFile {
    stats: Vec<GameServerRecord>,
}

/// Stats store persisted as a JSON file
///
/// Every update merges into the file's current contents and rewrites it before
/// returning, and `run` reloads it periodically so records written by
/// game-server processes become visible.
#[derive(Debug)]
pub struct JsonFileStats {
    path: PathBuf,
    records: RwLock<Vec<GameServerRecord>>,
}

impl JsonFileStats {
    /// Opens an existing stats file, creating an empty one if it is missing
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if tokio::fs::metadata(&path).await.is_err() {
            return Self::create_empty(path).await;
        }

        let records = read_file(&path).await?;
        debug!("Loaded {} game servers from {}", records.len(), path.display());

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// Creates (or truncates) the stats file with no servers in it
    pub async fn create_empty(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        write_file(&path, &[]).await?;
        info!("Initialized empty stats file at {}", path.display());

        Ok(Self {
            path,
            records: RwLock::new(Vec::new()),
        })
    }

    /// Replaces the cached records with the file's current contents
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let fresh = read_file(&self.path).await?;
        *self.records.write().await = fresh;
        Ok(())
    }
}

async fn read_file(path: &Path) -> Result<Vec<GameServerRecord>, StoreError> {
    let contents = tokio::fs::read(path).await?;
    let file: StatsFile = serde_json::from_slice(&contents)?;
    Ok(file.stats)
}

async fn write_file(path: &Path, records: &[GameServerRecord]) -> Result<(), StoreError> {
    let file = StatsFile {
        stats: records.to_vec(),
    };
    let data = serde_json::to_vec_pretty(&file)?;

    // Readers in other processes only ever see a complete file
    let staging = staging_path(path);
    tokio::fs::write(&staging, data).await?;
    if let Err(e) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }
    Ok(())
}

/// Sibling of `path` unique to this write, so the rename stays on one filesystem
fn staging_path(path: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stats.json".to_string());
    let seq = NEXT.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), seq))
}

#[async_trait]
impl StatsStore for JsonFileStats {
    async fn get_by_id(&self, id: &str) -> Option<GameServerRecord> {
        let records = self.records.read().await;
        records.iter().find(|r| r.id == id).cloned()
    }

    async fn get_all(&self) -> Result<Vec<GameServerRecord>, StoreError> {
        Ok(self.records.read().await.clone())
    }

    async fn get_servers_by_utilization(
        &self,
        max_load: f32,
    ) -> Result<Vec<GameServerRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(rank_by_utilization(records.iter(), max_load))
    }

    async fn update(&self, record: GameServerRecord) -> Result<(), StoreError> {
        // Hold the write lock across the file write so concurrent updates land in order
        let mut records = self.records.write().await;

        // Other processes write the same file; merge into their latest view
        match read_file(&self.path).await {
            Ok(fresh) => *records = fresh,
            Err(e) => debug!("Updating from cached stats, reread failed: {}", e),
        }

        debug!("Persisting {}", record);
        upsert(&mut records, record);
        write_file(&self.path, &records).await
    }

    async fn get_total_connection_stats(&self) -> ConnectionStats {
        let records = self.records.read().await;
        total_connections(records.iter())
    }

    async fn get_server_count(&self) -> usize {
        self.records.read().await.len()
    }

    async fn run(&self, cancel: CancelToken) {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stats refresh loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        error!("Failed to refresh stats from {}: {}", self.path.display(), e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::GameServerState;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "matchmaking-stats-{}-{}.json",
            name,
            std::process::id()
        ))
    }

    #[tokio::test]
    async fn test_updates_are_written_to_file() {
        let path = temp_path("write");
        let store = JsonFileStats::create_empty(&path).await.unwrap();

        let mut record = GameServerRecord::new("7", "0.0.0.0", 4242);
        record.state = GameServerState::Ready;
        store.update(record.clone()).await.unwrap();

        let reopened = JsonFileStats::open(&path).await.unwrap();
        assert_eq!(reopened.get_by_id("7").await, Some(record));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_refresh_sees_other_writers() {
        let path = temp_path("refresh");
        let reader = JsonFileStats::create_empty(&path).await.unwrap();
        let writer = JsonFileStats::open(&path).await.unwrap();

        writer
            .update(GameServerRecord::new("other", "127.0.0.1", 1))
            .await
            .unwrap();
        assert_eq!(reader.get_server_count().await, 0);

        reader.refresh().await.unwrap();
        assert_eq!(reader.get_server_count().await, 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_readers_never_see_partial_writes() {
        let path = temp_path("atomic");
        let writer = std::sync::Arc::new(JsonFileStats::create_empty(&path).await.unwrap());

        let writes = {
            let writer = writer.clone();
            tokio::spawn(async move {
                for i in 0..200u16 {
                    let record = GameServerRecord::new(i.to_string(), "127.0.0.1", 10_000 + i);
                    writer.update(record).await.unwrap();
                }
            })
        };

        // Every read must parse, however it interleaves with the writer
        while !writes.is_finished() {
            let records = read_file(&path).await.unwrap();
            assert!(records.len() <= 200);
            tokio::task::yield_now().await;
        }
        writes.await.unwrap();

        assert_eq!(read_file(&path).await.unwrap().len(), 200);

        // No staging files are left next to the stats file
        let prefix = format!(".{}.", path.file_name().unwrap().to_string_lossy());
        let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().starts_with(&prefix));
        }

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_file() {
        let path = temp_path("corrupt");
        tokio::fs::write(&path, b"not json").await.unwrap();

        assert!(matches!(
            JsonFileStats::open(&path).await,
            Err(StoreError::Serde(_))
        ));

        let _ = std::fs::remove_file(&path);
    }
}
