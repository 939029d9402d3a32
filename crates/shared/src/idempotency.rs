//! 幂等账本
//!
//! 记录已成功处理的 event_id，消费方据此丢弃重复投递。
//! 写入是“不存在才插入”的比较交换，从不覆盖；记录由存储层 TTL 自动过期。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::cache::{Cache, CacheKey};
use crate::config::IdempotencyConfig;
use crate::error::Result;

/// 幂等记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub event_id: Uuid,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(event_id: Uuid, event_type: &str) -> Self {
        Self {
            event_id,
            event_type: event_type.to_string(),
            processed_at: Utc::now(),
        }
    }
}

/// 幂等账本接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn has_processed(&self, event_id: &Uuid) -> Result<bool>;

    /// 插入记录；已存在时返回 false
    async fn mark_processed(&self, event_id: &Uuid, event_type: &str) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// RedisLedger
// ---------------------------------------------------------------------------

/// Redis 幂等账本，键为 `{prefix}:{consumer}:{event_id}`
pub struct RedisLedger {
    cache: Cache,
    consumer_name: String,
    key_prefix: String,
    ttl: Duration,
}

impl RedisLedger {
    pub fn new(cache: Cache, consumer_name: &str, config: &IdempotencyConfig) -> Self {
        Self {
            cache,
            consumer_name: consumer_name.to_string(),
            key_prefix: config.key_prefix.clone(),
            ttl: config.ttl(),
        }
    }

    fn key(&self, event_id: &Uuid) -> String {
        CacheKey::processed_event(&self.key_prefix, &self.consumer_name, &event_id.to_string())
    }

    /// 读取记录详情，用于排查
    pub async fn get_record(&self, event_id: &Uuid) -> Result<Option<IdempotencyRecord>> {
        self.cache.get(&self.key(event_id)).await
    }
}

#[async_trait]
impl IdempotencyLedger for RedisLedger {
    async fn has_processed(&self, event_id: &Uuid) -> Result<bool> {
        self.cache.exists(&self.key(event_id)).await
    }

    async fn mark_processed(&self, event_id: &Uuid, event_type: &str) -> Result<bool> {
        let record = IdempotencyRecord::new(*event_id, event_type);
        let inserted = self.cache.set_nx(&self.key(event_id), &record, self.ttl).await?;
        if !inserted {
            debug!(%event_id, "幂等记录已存在");
        }
        Ok(inserted)
    }

    async fn health_check(&self) -> Result<()> {
        self.cache.health_check().await
    }
}

// ---------------------------------------------------------------------------
// MemoryLedger
// ---------------------------------------------------------------------------

struct MemoryEntry {
    record: IdempotencyRecord,
    expires_at: Instant,
}

/// 进程内幂等账本
///
/// 过期记录视为不存在，插入时直接覆盖。
#[derive(Clone)]
pub struct MemoryLedger {
    entries: Arc<DashMap<Uuid, MemoryEntry>>,
    ttl: Duration,
}

impl MemoryLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&self, event_id: &Uuid) -> Option<IdempotencyRecord> {
        self.entries
            .get(event_id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.record.clone())
    }

    /// 清理过期记录，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(IdempotencyConfig::default().ttl())
    }
}

#[async_trait]
impl IdempotencyLedger for MemoryLedger {
    async fn has_processed(&self, event_id: &Uuid) -> Result<bool> {
        Ok(self.record(event_id).is_some())
    }

    async fn mark_processed(&self, event_id: &Uuid, event_type: &str) -> Result<bool> {
        let now = Instant::now();
        let fresh = MemoryEntry {
            record: IdempotencyRecord::new(*event_id, event_type),
            expires_at: now + self.ttl,
        };

        match self.entries.entry(*event_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(false);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
