//! Redis-backed task broker.
//!
//! A reliable-queue pair of lists gives at-least-once delivery without a
//! real message bus: tasks are LPUSHed onto the pending list, moved
//! atomically to a processing list when a consumer reserves them, and
//! removed only after the consumer finishes. Tasks stranded on the
//! processing list by a crashed consumer are pushed back onto pending at
//! startup.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

const QUEUE_PENDING: &str = "autoapply:tasks:pending";
const QUEUE_PROCESSING: &str = "autoapply:tasks:processing";

/// One unit of dispatch work. `attempt` is informational (logging and
/// redelivery diagnostics); the authoritative retry counter lives on the
/// application row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub application_id: Uuid,
    pub attempt: u32,
}

#[derive(Clone)]
pub struct Broker {
    conn: ConnectionManager,
}

impl Broker {
    /// Opens a managed connection and verifies it with a PING. A broker
    /// that cannot answer the probe is treated as absent so the dispatcher
    /// starts in direct mode instead of failing requests later.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to Redis")?;
        let broker = Self { conn };
        broker.ping().await.context("Redis did not answer PING")?;
        Ok(broker)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .context("Redis PING failed")?;
        Ok(())
    }

    pub async fn enqueue(&self, task: &TaskEnvelope) -> Result<()> {
        let payload = serde_json::to_string(task).context("failed to serialize task")?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lpush(QUEUE_PENDING, payload)
            .await
            .context("failed to enqueue task")?;
        Ok(())
    }

    /// Moves the oldest pending task to the processing list and hands it
    /// to the caller. Returns `None` when the queue is empty. A payload
    /// that fails to parse is dropped from the processing list with a
    /// warning; redelivering it forever would wedge the consumer.
    pub async fn reserve(&self) -> Result<Option<TaskEnvelope>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(QUEUE_PENDING)
            .arg(QUEUE_PROCESSING)
            .query_async(&mut conn)
            .await
            .context("failed to reserve task")?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<TaskEnvelope>(&payload) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                warn!("Dropping malformed task payload {payload:?}: {e}");
                let _: i64 = conn
                    .lrem(QUEUE_PROCESSING, 1, &payload)
                    .await
                    .context("failed to drop malformed task")?;
                Ok(None)
            }
        }
    }

    /// Acknowledges a reserved task. The envelope serializes identically
    /// to how it was enqueued, so LREM matches the exact list entry.
    pub async fn complete(&self, task: &TaskEnvelope) -> Result<()> {
        let payload = serde_json::to_string(task).context("failed to serialize task")?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lrem(QUEUE_PROCESSING, 1, payload)
            .await
            .context("failed to acknowledge task")?;
        Ok(())
    }

    /// Moves every task stranded on the processing list back to pending.
    /// Called once at startup; anything still on that list belongs to a
    /// consumer that no longer exists.
    pub async fn requeue_orphans(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut moved = 0u64;
        loop {
            let payload: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(QUEUE_PROCESSING)
                .arg(QUEUE_PENDING)
                .query_async(&mut conn)
                .await
                .context("failed to requeue orphaned task")?;
            if payload.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            warn!("Requeued {moved} orphaned task(s) from a previous run");
        }
        Ok(moved)
    }

    /// (pending, processing) list depths for the health endpoint.
    pub async fn depths(&self) -> Result<(i64, i64)> {
        let mut conn = self.conn.clone();
        let pending: i64 = conn
            .llen(QUEUE_PENDING)
            .await
            .context("failed to read pending depth")?;
        let processing: i64 = conn
            .llen(QUEUE_PROCESSING)
            .await
            .context("failed to read processing depth")?;
        Ok((pending, processing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_format_is_stable() {
        // complete() relies on re-serialization matching the enqueued
        // bytes exactly, so the field order must never drift.
        let task = TaskEnvelope {
            application_id: Uuid::parse_str("6f2c86e8-9f63-4b1a-b1a0-9a4f0c2d7e42").unwrap(),
            attempt: 2,
        };
        let json = serde_json::to_string(&task).unwrap();
        assert_eq!(
            json,
            r#"{"application_id":"6f2c86e8-9f63-4b1a-b1a0-9a4f0c2d7e42","attempt":2}"#
        );
        let back: TaskEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }
}
