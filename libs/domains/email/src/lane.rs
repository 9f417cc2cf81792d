//! Ephemeral fast-path queue lane.
//!
//! The lane carries message ids only; message content always lives in the
//! durable log, which stays authoritative. Entries in the lane can be lost
//! on restart without losing the email itself, because a lane failure
//! re-arms the message in the durable queue.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{EmailError, EmailResult};

const LANE_KEY: &str = "email:lane:immediate";

/// Fast-path lane for messages that should be picked up on the next tick,
/// ahead of the durable claim scan.
#[async_trait]
pub trait EphemeralLane: Send + Sync {
    /// Push a message id onto the lane.
    async fn push(&self, message_id: Uuid) -> EmailResult<()>;

    /// Pop up to `max` message ids, oldest first.
    async fn drain(&self, max: usize) -> EmailResult<Vec<Uuid>>;

    /// Current lane depth.
    async fn len(&self) -> EmailResult<u64>;
}

/// Redis-backed lane using a list. LPUSH/RPOP keeps FIFO order.
#[derive(Clone)]
pub struct RedisLane {
    redis: ConnectionManager,
}

impl RedisLane {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl EphemeralLane for RedisLane {
    async fn push(&self, message_id: Uuid) -> EmailResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(LANE_KEY)
            .arg(message_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn drain(&self, max: usize) -> EmailResult<Vec<Uuid>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        // RPOP with COUNT returns nil when the list is empty.
        let raw: Option<Vec<String>> = redis::cmd("RPOP")
            .arg(LANE_KEY)
            .arg(max)
            .query_async(&mut conn)
            .await?;

        let mut ids = Vec::new();
        for value in raw.unwrap_or_default() {
            match value.parse::<Uuid>() {
                Ok(id) => ids.push(id),
                Err(_) => {
                    tracing::warn!(value = %value, "Dropping malformed lane entry");
                }
            }
        }
        Ok(ids)
    }

    async fn len(&self) -> EmailResult<u64> {
        let mut conn = self.redis.clone();
        let depth: u64 = redis::cmd("LLEN")
            .arg(LANE_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(depth)
    }
}

/// In-memory lane for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryLane {
    entries: Mutex<VecDeque<Uuid>>,
}

impl InMemoryLane {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EmailResult<std::sync::MutexGuard<'_, VecDeque<Uuid>>> {
        self.entries
            .lock()
            .map_err(|_| EmailError::Queue("lane mutex poisoned".to_string()))
    }
}

#[async_trait]
impl EphemeralLane for InMemoryLane {
    async fn push(&self, message_id: Uuid) -> EmailResult<()> {
        self.lock()?.push_back(message_id);
        Ok(())
    }

    async fn drain(&self, max: usize) -> EmailResult<Vec<Uuid>> {
        let mut entries = self.lock()?;
        let take = max.min(entries.len());
        Ok(entries.drain(..take).collect())
    }

    async fn len(&self) -> EmailResult<u64> {
        Ok(self.lock()?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_lane_fifo() {
        let lane = InMemoryLane::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        lane.push(first).await.unwrap();
        lane.push(second).await.unwrap();
        lane.push(third).await.unwrap();
        assert_eq!(lane.len().await.unwrap(), 3);

        let drained = lane.drain(2).await.unwrap();
        assert_eq!(drained, vec![first, second]);
        assert_eq!(lane.len().await.unwrap(), 1);

        let rest = lane.drain(10).await.unwrap();
        assert_eq!(rest, vec![third]);
        assert!(lane.drain(10).await.unwrap().is_empty());
    }
}
