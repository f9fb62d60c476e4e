//! Durable block queue backed by a Redis stream with a consumer group.
//!
//! Entries are delivered at least once: a claimed entry stays pending until
//! it is acknowledged, and long-idle pending entries can be transferred to
//! another consumer with [`WorkQueue::reclaim`].

use std::time::Duration;

use async_trait::async_trait;
use error_stack::{report, Result, ResultExt};
use redis::{
    aio::ConnectionManager,
    streams::{
        StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamMaxlen, StreamReadOptions,
        StreamReadReply,
    },
    AsyncCommands,
};

use crate::core::Slot;

const BLOCK_STREAM_KEY: &str = "indexer:block_stream";
const GROUP_NAME: &str = "block_processor";
const LAST_SEEN_BLOCK_KEY: &str = "last_seen_block";
const BLOCK_FIELD: &str = "block";

// Enough retention to sustain two weeks of processor downtime.
const MAX_STREAM_LEN: usize = 2_000_000;

#[derive(Debug)]
pub enum QueueError {
    Connection,
    Command,
    Decode,
}

impl error_stack::Context for QueueError {}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Connection => f.write_str("failed to connect to redis"),
            QueueError::Command => f.write_str("queue command failed"),
            QueueError::Decode => f.write_str("failed to decode queue entry"),
        }
    }
}

/// A delivered stream entry. The `id` is opaque and only meaningful to
/// [`WorkQueue::ack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: String,
    pub slot: Slot,
}

/// Work queue operations used by the harvester and the processors.
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Append one entry per slot.
    async fn enqueue(&self, slots: &[Slot]) -> Result<(), QueueError>;

    /// Deliver up to `count` never-delivered entries to `consumer`,
    /// blocking up to `block_for` when the stream is empty.
    async fn claim(
        &self,
        consumer: &str,
        count: usize,
        block_for: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Transfer entries pending for at least `min_idle` to `consumer`.
    async fn reclaim(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Remove entries from the pending set. Unknown ids are ignored.
    async fn ack(&self, entry_ids: &[String]) -> Result<(), QueueError>;

    /// Persist the harvester cursor.
    async fn set_cursor(&self, slot: Slot) -> Result<(), QueueError>;

    /// Read the harvester cursor. An absent cursor reads as zero.
    async fn cursor(&self) -> Result<Slot, QueueError>;
}

#[derive(Clone)]
pub struct BlockQueue {
    conn: ConnectionManager,
}

impl BlockQueue {
    /// Connect and verify the server responds to PING.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)
            .change_context(QueueError::Connection)
            .attach_printable_lazy(|| format!("url: {url}"))?;

        let mut conn = ConnectionManager::new(client)
            .await
            .change_context(QueueError::Connection)
            .attach_printable_lazy(|| format!("url: {url}"))?;

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .change_context(QueueError::Connection)
            .attach_printable("redis ping failed")?;

        Ok(Self { conn })
    }

    /// Create the consumer group. Safe to call on every start.
    pub async fn initialize(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        let created: std::result::Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(BLOCK_STREAM_KEY, GROUP_NAME, "0")
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err)
                .change_context(QueueError::Command)
                .attach_printable("failed to create consumer group"),
        }
    }
}

#[async_trait]
impl WorkQueue for BlockQueue {
    /// Trims the stream to its approximate maximum length on every append.
    async fn enqueue(&self, slots: &[Slot]) -> Result<(), QueueError> {
        if slots.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for slot in slots {
            pipe.xadd_maxlen(
                BLOCK_STREAM_KEY,
                StreamMaxlen::Approx(MAX_STREAM_LEN),
                "*",
                &[(BLOCK_FIELD, slot.to_string())],
            )
            .ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .change_context(QueueError::Command)
            .attach_printable("failed to enqueue blocks")?;

        Ok(())
    }

    async fn claim(
        &self,
        consumer: &str,
        count: usize,
        block_for: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let options = StreamReadOptions::default()
            .group(GROUP_NAME, consumer)
            .count(count)
            .block(block_for.as_millis() as usize);

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[BLOCK_STREAM_KEY], &[">"], &options)
            .await
            .change_context(QueueError::Command)
            .attach_printable("failed to read block stream")?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let Some(key) = reply.keys.into_iter().find(|key| key.key == BLOCK_STREAM_KEY) else {
            return Err(report!(QueueError::Decode))
                .attach_printable("no items from the subscribed stream");
        };

        key.ids.into_iter().map(entry_from_stream_id).collect()
    }

    /// Resets the idle time of the transferred entries.
    async fn reclaim(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let options = StreamAutoClaimOptions::default().count(count);

        let mut conn = self.conn.clone();
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                BLOCK_STREAM_KEY,
                GROUP_NAME,
                consumer,
                min_idle.as_millis() as usize,
                "0",
                options,
            )
            .await
            .change_context(QueueError::Command)
            .attach_printable("failed to claim stale entries")?;

        reply.claimed.into_iter().map(entry_from_stream_id).collect()
    }

    async fn ack(&self, entry_ids: &[String]) -> Result<(), QueueError> {
        if entry_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let _: u64 = conn
            .xack(BLOCK_STREAM_KEY, GROUP_NAME, entry_ids)
            .await
            .change_context(QueueError::Command)
            .attach_printable("failed to acknowledge entries")?;

        Ok(())
    }

    async fn set_cursor(&self, slot: Slot) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(LAST_SEEN_BLOCK_KEY, slot.to_string())
            .await
            .change_context(QueueError::Command)
            .attach_printable("failed to save cursor")?;

        Ok(())
    }

    async fn cursor(&self) -> Result<Slot, QueueError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(LAST_SEEN_BLOCK_KEY)
            .await
            .change_context(QueueError::Command)
            .attach_printable("failed to read cursor")?;

        match value {
            None => Ok(0),
            Some(raw) => raw
                .parse::<Slot>()
                .change_context(QueueError::Decode)
                .attach_printable_lazy(|| format!("cursor value: {raw}")),
        }
    }
}

fn entry_from_stream_id(id: StreamId) -> Result<QueueEntry, QueueError> {
    let slot = id
        .get::<Slot>(BLOCK_FIELD)
        .ok_or(QueueError::Decode)
        .attach_printable_lazy(|| format!("entry: {}", id.id))?;

    Ok(QueueEntry { id: id.id, slot })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_from_stream_id() {
        let mut id = StreamId::default();
        id.id = "1518951480106-0".to_string();
        id.map.insert(
            BLOCK_FIELD.to_string(),
            redis::Value::BulkString(b"1003".to_vec()),
        );

        let entry = entry_from_stream_id(id).unwrap();
        assert_eq!(entry.id, "1518951480106-0");
        assert_eq!(entry.slot, 1003);
    }

    #[test]
    fn test_entry_without_block_field_is_an_error() {
        let mut id = StreamId::default();
        id.id = "1-0".to_string();

        assert!(entry_from_stream_id(id).is_err());
    }
}
