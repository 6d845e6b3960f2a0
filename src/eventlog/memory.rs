//! In-process event log
//!
//! Same consumer-group semantics as the Redis stream: ordered entries, a
//! per-group delivery cursor, per-consumer pending lists and trimming on
//! append. Used by tests and for running the pipeline without Redis.

use super::{EventLog, LogEntry, ReadCursor};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct StoredEntry {
    seq: u64,
    id: String,
    payload: String,
}

struct PendingEntry {
    seq: u64,
    id: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct GroupState {
    /// Sequence number of the last entry handed out by a `New` read
    last_delivered: u64,
    /// consumer -> delivered but not acknowledged, in sequence order
    pending: HashMap<String, Vec<PendingEntry>>,
}

#[derive(Default)]
struct LogState {
    entries: VecDeque<StoredEntry>,
    groups: HashMap<String, GroupState>,
    next_seq: u64,
    last_ms: i64,
    ms_seq: u64,
}

impl LogState {
    fn next_id(&mut self) -> String {
        let now = chrono::Utc::now().timestamp_millis();
        if now > self.last_ms {
            self.last_ms = now;
            self.ms_seq = 0;
        } else {
            self.ms_seq += 1;
        }
        format!("{}-{}", self.last_ms, self.ms_seq)
    }

}

fn payload_of(entries: &VecDeque<StoredEntry>, seq: u64) -> Option<String> {
    entries
        .iter()
        .find(|e| e.seq == seq)
        .map(|e| e.payload.clone())
}

#[derive(Default)]
pub struct MemoryEventLog {
    state: Mutex<LogState>,
    appended: Notify,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries currently retained
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivered-but-unacknowledged entries across all consumers of `group`
    pub fn pending_count(&self, group: &str) -> usize {
        self.state
            .lock()
            .groups
            .get(group)
            .map(|g| g.pending.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Payloads currently retained, oldest first
    pub fn payloads(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| e.payload.clone())
            .collect()
    }

    fn try_read(
        &self,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut state = self.state.lock();

        if !state.groups.contains_key(group) {
            bail!("NOGROUP no such consumer group '{}'", group);
        }

        match cursor {
            ReadCursor::Pending => {
                let entries: Vec<LogEntry> = state
                    .groups
                    .get(group)
                    .and_then(|g| g.pending.get(consumer))
                    .map(|list| {
                        list.iter()
                            .take(count)
                            .map(|p| LogEntry::new(p.id.clone(), payload_of(&state.entries, p.seq)))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(entries)
            }
            ReadCursor::New => {
                let last_delivered = state
                    .groups
                    .get(group)
                    .map(|g| g.last_delivered)
                    .unwrap_or(0);

                let fresh: Vec<(u64, String, String)> = state
                    .entries
                    .iter()
                    .filter(|e| e.seq > last_delivered)
                    .take(count)
                    .map(|e| (e.seq, e.id.clone(), e.payload.clone()))
                    .collect();

                if let Some((last_seq, _, _)) = fresh.last() {
                    let last_seq = *last_seq;
                    let now = Instant::now();
                    if let Some(g) = state.groups.get_mut(group) {
                        g.last_delivered = last_seq;
                        let list = g.pending.entry(consumer.to_string()).or_default();
                        list.extend(fresh.iter().map(|(seq, id, _)| PendingEntry {
                            seq: *seq,
                            id: id.clone(),
                            delivered_at: now,
                        }));
                    }
                }

                Ok(fresh
                    .into_iter()
                    .map(|(_, id, payload)| LogEntry::new(id, Some(payload)))
                    .collect())
            }
        }
    }

    fn try_claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        let mut state = self.state.lock();
        let LogState { entries, groups, .. } = &mut *state;
        let Some(g) = groups.get_mut(group) else {
            bail!("NOGROUP no such consumer group '{}'", group);
        };

        let now = Instant::now();
        let mut candidates: Vec<(u64, String)> = g
            .pending
            .iter()
            .flat_map(move |(owner, list)| {
                list.iter()
                    .filter(move |p| now.duration_since(p.delivered_at) >= min_idle)
                    .map(move |p| (p.seq, owner.clone()))
            })
            .collect();
        candidates.sort_by_key(|(seq, _)| *seq);
        candidates.truncate(count);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (seq, owner) in candidates {
            let Some(list) = g.pending.get_mut(&owner) else {
                continue;
            };
            if let Some(pos) = list.iter().position(|p| p.seq == seq) {
                claimed.push(list.remove(pos));
            }
        }

        let mut result = Vec::with_capacity(claimed.len());
        let mut moved = Vec::with_capacity(claimed.len());
        for mut p in claimed {
            // Trimmed entries leave the pending list for good
            let Some(payload) = payload_of(entries, p.seq) else {
                continue;
            };
            result.push(LogEntry::new(p.id.clone(), Some(payload)));
            p.delivered_at = now;
            moved.push(p);
        }

        if !moved.is_empty() {
            let list = g.pending.entry(consumer.to_string()).or_default();
            list.extend(moved);
            list.sort_by_key(|p| p.seq);
        }
        g.pending.retain(|_, list| !list.is_empty());

        Ok(result)
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, payload: &str, max_len: usize) -> Result<String> {
        let id = {
            let mut state = self.state.lock();
            state.next_seq += 1;
            let seq = state.next_seq;
            let id = state.next_id();
            state.entries.push_back(StoredEntry {
                seq,
                id: id.clone(),
                payload: payload.to_string(),
            });
            while state.entries.len() > max_len.max(1) {
                state.entries.pop_front();
            }
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, group: &str) -> Result<()> {
        let mut state = self.state.lock();
        let start = state.next_seq;
        // New groups start at the current tail, like `XGROUP CREATE ... $`
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: start,
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + block;

        loop {
            // Register interest before checking so an append in between is not missed
            let notified = self.appended.notified();

            let entries = self.try_read(group, consumer, cursor, count)?;
            if !entries.is_empty() || cursor == ReadCursor::Pending || block.is_zero() {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>> {
        self.try_claim(group, consumer, min_idle, count)
    }

    async fn ack(&self, group: &str, ids: &[String]) -> Result<u64> {
        let mut state = self.state.lock();
        let Some(g) = state.groups.get_mut(group) else {
            return Ok(0);
        };

        let mut acked = 0u64;
        for list in g.pending.values_mut() {
            let before = list.len();
            list.retain(|p| !ids.contains(&p.id));
            acked += (before - list.len()) as u64;
        }
        g.pending.retain(|_, list| !list.is_empty());

        Ok(acked)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
