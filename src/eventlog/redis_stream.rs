//! Redis Streams event log
//!
//! XADD with approximate MAXLEN trimming on append, XREADGROUP/XACK for the
//! fan-out consumer group, XAUTOCLAIM to take over entries left pending by a
//! consumer that went away.

use super::{EventLog, LogEntry, ReadCursor, PAYLOAD_FIELD};
use anyhow::{bail, Context, Result};
use redis::aio::ConnectionManager;
use redis::streams::StreamReadReply;
use redis::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
pub struct RedisStreamLog {
    /// Appends, acks, claims and pings
    conn: ConnectionManager,
    /// XREADGROUP only. A BLOCK holds its connection until it returns.
    reader: ConnectionManager,
    stream_key: String,
}

impl RedisStreamLog {
    /// Open the managed connections. The managers reconnect on their own after this.
    pub async fn connect(redis_url: &str, stream_key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("invalid redis url {}", redis_url))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect to redis")?;
        let reader = ConnectionManager::new(client)
            .await
            .context("failed to open redis read connection")?;

        let stream_key = stream_key.into();
        info!(stream = %stream_key, "redis_stream_connected");

        Ok(Self {
            conn,
            reader,
            stream_key,
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }
}

/// `[cursor, [[id, [field, value, ...]] | nil, ...], deleted?]`
fn parse_autoclaim(reply: Value) -> Result<Vec<LogEntry>> {
    let Value::Bulk(parts) = reply else {
        bail!("unexpected XAUTOCLAIM reply: {:?}", reply);
    };
    let Some(Value::Bulk(claimed)) = parts.get(1) else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::with_capacity(claimed.len());
    for item in claimed {
        // Deleted entries come back as nil on older servers
        let Value::Bulk(pair) = item else {
            continue;
        };
        let Some(id_value) = pair.first() else {
            continue;
        };
        let id: String = redis::from_redis_value(id_value).context("invalid claimed entry id")?;
        let fields: HashMap<String, String> = pair
            .get(1)
            .and_then(|v| redis::from_redis_value(v).ok())
            .unwrap_or_default();
        entries.push(LogEntry::new(id, fields.get(PAYLOAD_FIELD).cloned()));
    }
    Ok(entries)
}

#[async_trait::async_trait]
impl EventLog for RedisStreamLog {
    async fn append(&self, payload: &str, max_len: usize) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async::<_, String>(&mut conn)
            .await
            .context("XADD failed")?;
        Ok(id)
    }

    async fn ensure_group(&self, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<_, ()>(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(stream = %self.stream_key, group = %group, "consumer_group_created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %self.stream_key, group = %group, "consumer_group_exists");
                Ok(())
            }
            Err(e) => Err(e).context("XGROUP CREATE failed"),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let mut conn = self.reader.clone();
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count);
        // Pending reads return immediately; blocking only applies to new entries
        if cursor == ReadCursor::New && !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS")
            .arg(&self.stream_key)
            .arg(cursor.as_stream_id());

        // Nil when the block times out
        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .context("XREADGROUP failed")?;

        let entries = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|entry| {
                        let payload = entry.get::<String>(PAYLOAD_FIELD);
                        LogEntry::new(entry.id, payload)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(entries)
    }

    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .context("XAUTOCLAIM failed")?;
        parse_autoclaim(reply)
    }

    async fn ack(&self, group: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(group)
            .arg(ids)
            .query_async::<_, u64>(&mut conn)
            .await
            .context("XACK failed")?;
        Ok(acked)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .context("PING failed")?;
        Ok(())
    }
}
