use super::{
    rank_by_utilization, total_connections, upsert, ConnectionStats, GameServerRecord,
    StatsStore, StoreError,
};
use crate::cancel::CancelToken;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Process-local stats store
#[derive(Debug, Default)]
pub struct MemoryStats {
    records: RwLock<Vec<GameServerRecord>>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<GameServerRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl StatsStore for MemoryStats {
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
        let mut records = self.records.write().await;
        upsert(&mut records, record);
        Ok(())
    }

    async fn get_total_connection_stats(&self) -> ConnectionStats {
        let records = self.records.read().await;
        total_connections(records.iter())
    }

    async fn get_server_count(&self) -> usize {
        self.records.read().await.len()
    }

    async fn run(&self, cancel: CancelToken) {
        cancel.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::GameServerState;

    #[tokio::test]
    async fn test_update_and_lookup() {
        let store = MemoryStats::new();
        assert!(store.get_by_id("s1").await.is_none());

        let mut record = GameServerRecord::new("s1", "127.0.0.1", 9000);
        store.update(record.clone()).await.unwrap();
        assert_eq!(store.get_server_count().await, 1);

        record.state = GameServerState::Ready;
        store.update(record.clone()).await.unwrap();

        assert_eq!(store.get_server_count().await, 1);
        assert_eq!(store.get_by_id("s1").await, Some(record));
    }

    #[tokio::test]
    async fn test_utilization_only_lists_ready() {
        let mut ready = GameServerRecord::new("ready", "127.0.0.1", 9000);
        ready.state = GameServerState::Ready;
        let booting = GameServerRecord::new("booting", "127.0.0.1", 9001);

        let store = MemoryStats::with_records(vec![booting, ready]);
        let servers = store.get_servers_by_utilization(0.9).await.unwrap();

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "ready");
    }
}
