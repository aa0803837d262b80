//! Redis Streams consumer-group source.
//!
//! Entries are read in batches with `XREADGROUP ... BLOCK` and buffered
//! locally. An entry is acknowledged when the pipeline dequeues it, so a
//! crash loses at most the entries sitting in the local buffer, and those
//! stay pending in the group. On start the consumer first drains its own
//! pending entries (id `0`) before reading new ones (id `>`).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::RedisResult;
use redis::aio::ConnectionManager;
use relay_worker::{ItemSource, RelayError, WorkItem};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Field holding the document in each stream entry.
pub const PAYLOAD_FIELD: &str = "payload";

type StreamReply = Vec<(String, Vec<(String, Vec<(String, String)>)>)>;

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub stream_name: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub block: Duration,
    pub batch_size: usize,
}

/// A stream entry waiting in the local buffer.
#[derive(Debug, Clone, PartialEq)]
struct Entry {
    id: String,
    payload: Option<String>,
}

pub struct RedisStreamSource {
    conn: ConnectionManager,
    settings: StreamSettings,
    buffer: VecDeque<Entry>,
    /// Reading our own pending entries before new ones
    recovering: bool,
}

impl RedisStreamSource {
    pub fn new(conn: ConnectionManager, settings: StreamSettings) -> Self {
        Self {
            conn,
            settings,
            buffer: VecDeque::new(),
            recovering: true,
        }
    }

    pub async fn connect(client: redis::Client, settings: StreamSettings) -> RedisResult<Self> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, settings))
    }

    /// Create the consumer group if it doesn't exist
    pub async fn init_consumer_group(&mut self) -> Result<(), RelayError> {
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.settings.stream_name)
            .arg(&self.settings.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.settings.stream_name,
                    group = %self.settings.consumer_group,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(
                    stream = %self.settings.stream_name,
                    group = %self.settings.consumer_group,
                    "Consumer group already exists"
                );
                Ok(())
            }
            Err(e) => Err(RelayError::Source(e.to_string())),
        }
    }

    async fn fill(&mut self) -> Result<(), RelayError> {
        let start = if self.recovering { "0" } else { ">" };

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.settings.consumer_group)
            .arg(&self.settings.consumer_name);
        if !self.recovering {
            cmd.arg("BLOCK").arg(self.settings.block.as_millis() as u64);
        }
        cmd.arg("COUNT")
            .arg(self.settings.batch_size)
            .arg("STREAMS")
            .arg(&self.settings.stream_name)
            .arg(start);

        let result: RedisResult<Option<StreamReply>> = cmd.query_async(&mut self.conn).await;
        let entries = match result {
            Ok(reply) => entries_from_reply(reply.unwrap_or_default()),
            Err(e) if e.to_string().contains("NOGROUP") => {
                warn!(group = %self.settings.consumer_group, "Consumer group missing, recreating");
                self.init_consumer_group().await?;
                return Ok(());
            }
            Err(e) => return Err(RelayError::Source(e.to_string())),
        };

        if self.recovering {
            if entries.is_empty() {
                self.recovering = false;
                debug!(stream = %self.settings.stream_name, "No pending entries left");
            } else {
                info!(count = entries.len(), "Recovering pending entries");
            }
        }
        self.buffer.extend(entries);
        Ok(())
    }

    async fn ack(&mut self, id: &str) -> Result<(), RelayError> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.settings.stream_name)
            .arg(&self.settings.consumer_group)
            .arg(id)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| RelayError::Source(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ItemSource for RedisStreamSource {
    async fn next_item(&mut self) -> Result<Option<WorkItem>, RelayError> {
        loop {
            // Ack before popping so a cancelled call leaves the entry buffered
            let Some(entry) = self.buffer.front().cloned() else {
                self.fill().await?;
                continue;
            };
            self.ack(&entry.id).await?;
            self.buffer.pop_front();

            let Some(payload) = entry.payload else {
                warn!(stream_id = %entry.id, "Missing '{PAYLOAD_FIELD}' field, skipping entry");
                continue;
            };

            let mut item = WorkItem::new(entry.id, payload.into_bytes());
            if let Some(at) = entry_timestamp(&item.id) {
                item.received_at = at;
            }
            return Ok(Some(item));
        }
    }

    fn name(&self) -> &str {
        "redis-stream"
    }
}

/// One-off PING over a fresh connection, for startup gating.
pub async fn ping(client: &redis::Client) -> bool {
    let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
        return false;
    };
    let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
    pong.is_ok()
}

fn entries_from_reply(reply: StreamReply) -> Vec<Entry> {
    reply
        .into_iter()
        .flat_map(|(_stream, entries)| entries)
        .map(|(id, fields)| Entry {
            id,
            payload: fields
                .into_iter()
                .find(|(k, _)| k == PAYLOAD_FIELD)
                .map(|(_, v)| v),
        })
        .collect()
}

/// Milliseconds part of a stream id (`<ms>-<seq>`).
fn entry_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = id.split('-').next()?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_from_reply() {
        let reply: StreamReply = vec![(
            "switch:transactions".to_string(),
            vec![
                (
                    "1700000000000-0".to_string(),
                    vec![("payload".to_string(), "<Document/>".to_string())],
                ),
                (
                    "1700000000000-1".to_string(),
                    vec![("other".to_string(), "x".to_string())],
                ),
            ],
        )];

        let entries = entries_from_reply(reply);
        assert_eq!(
            entries,
            vec![
                Entry {
                    id: "1700000000000-0".into(),
                    payload: Some("<Document/>".into()),
                },
                Entry {
                    id: "1700000000000-1".into(),
                    payload: None,
                },
            ]
        );
    }

    #[test]
    fn test_entry_timestamp() {
        let at = entry_timestamp("1700000000123-4").unwrap();
        assert_eq!(at.timestamp_millis(), 1_700_000_000_123);
        assert!(entry_timestamp("not-an-id").is_none());
    }
}
