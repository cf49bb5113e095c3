//! Delivery status tracking.
//!
//! The gateway records `pending` when it publishes; workers record `sent` on
//! ack and `failed` when a notification is dead-lettered.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use herald_common::types::{DeliveryStatus, StatusRecord};

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn record(
        &self,
        notification_id: Uuid,
        status: DeliveryStatus,
        error_detail: Option<String>,
    ) -> anyhow::Result<()>;

    async fn get(&self, notification_id: Uuid) -> anyhow::Result<Option<StatusRecord>>;
}

/// Status records in Redis under `notification:status:{id}`, expiring after a TTL.
pub struct RedisStatusStore {
    redis: ConnectionManager,
    ttl_secs: u64,
}

impl RedisStatusStore {
    pub fn new(redis: ConnectionManager, ttl_secs: u64) -> Self {
        Self { redis, ttl_secs }
    }

    fn key(notification_id: Uuid) -> String {
        format!("notification:status:{notification_id}")
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    async fn record(
        &self,
        notification_id: Uuid,
        status: DeliveryStatus,
        error_detail: Option<String>,
    ) -> anyhow::Result<()> {
        let record = StatusRecord {
            notification_id,
            status,
            error_detail,
            updated_at: Utc::now(),
        };
        let mut conn = self.redis.clone();
        let _: () = conn
            .set_ex(Self::key(notification_id), serde_json::to_string(&record)?, self.ttl_secs)
            .await?;

        tracing::debug!(
            notification_id = %notification_id,
            status = %status,
            "Recorded delivery status"
        );
        Ok(())
    }

    async fn get(&self, notification_id: Uuid) -> anyhow::Result<Option<StatusRecord>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(Self::key(notification_id)).await?;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }
}

/// In-process status store for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<Uuid, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn record(
        &self,
        notification_id: Uuid,
        status: DeliveryStatus,
        error_detail: Option<String>,
    ) -> anyhow::Result<()> {
        self.records.lock().insert(
            notification_id,
            StatusRecord {
                notification_id,
                status,
                error_detail,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, notification_id: Uuid) -> anyhow::Result<Option<StatusRecord>> {
        Ok(self.records.lock().get(&notification_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::redis_pool::create_redis_pool;

    #[tokio::test]
    async fn test_memory_store_overwrites_status() {
        let store = MemoryStatusStore::new();
        let id = Uuid::new_v4();
        assert!(store.get(id).await.unwrap().is_none());

        store.record(id, DeliveryStatus::Pending, None).await.unwrap();
        store
            .record(id, DeliveryStatus::Failed, Some("provider down".into()))
            .await
            .unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.error_detail.as_deref(), Some("provider down"));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_store_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let store = RedisStatusStore::new(create_redis_pool(&url).await.unwrap(), 60);
        let id = Uuid::new_v4();

        store.record(id, DeliveryStatus::Sent, None).await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.notification_id, id);
        assert_eq!(record.status, DeliveryStatus::Sent);
    }
}
