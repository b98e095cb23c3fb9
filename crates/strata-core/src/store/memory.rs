//! In-process implementations of `LogStore` and `KvStore`.
//!
//! Complete enough to run the queue and saga subsystems without any external
//! service: consumer-group delivery bookkeeping, pending/claim semantics and
//! TTL expiry all behave like the production backend. Used by tests and by
//! single-process embeddings.

use super::{DeliveredMessage, GroupInfo, KvStore, LogStore, PendingEntry, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    fields: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    /// Highest sequence number handed out to any consumer of this group.
    last_delivered: u64,
    /// message id -> delivery bookkeeping, insertion-ordered by seq.
    pending: BTreeMap<u64, Pending>,
    consumers: HashSet<String>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: VecDeque<Entry>,
    next_seq: u64,
    groups: HashMap<String, Group>,
}

fn message_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_seq(message_id: &str) -> Option<u64> {
    message_id.split('-').next()?.parse().ok()
}

/// In-memory append-only log with consumer groups.
#[derive(Default)]
pub struct MemoryLogStore {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stream<T>(&self, stream: &str, f: impl FnOnce(&mut Stream) -> T) -> T {
        let mut streams = self.streams.lock().unwrap();
        f(streams.entry(stream.to_string()).or_default())
    }

    /// One non-blocking read pass over the streams, in the order given.
    fn try_read(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
    ) -> Result<Vec<(String, Vec<DeliveredMessage>)>, StoreError> {
        let mut all = self.streams.lock().unwrap();
        let mut out = Vec::new();
        let mut remaining = count;

        for name in streams {
            if remaining == 0 {
                break;
            }
            let Some(stream) = all.get_mut(name) else {
                continue;
            };
            let Some(grp) = stream.groups.get_mut(group) else {
                return Err(StoreError::UnknownGroup {
                    stream: name.clone(),
                    group: group.to_string(),
                });
            };
            grp.consumers.insert(consumer.to_string());

            let mut delivered = Vec::new();
            for entry in stream.entries.iter() {
                if delivered.len() >= remaining {
                    break;
                }
                if entry.seq > grp.last_delivered {
                    grp.last_delivered = entry.seq;
                    grp.pending.insert(
                        entry.seq,
                        Pending {
                            consumer: consumer.to_string(),
                            delivered_at: Instant::now(),
                            deliveries: 1,
                        },
                    );
                    delivered.push((message_id(entry.seq), entry.fields.clone()));
                }
            }
            if !delivered.is_empty() {
                remaining -= delivered.len();
                out.push((name.clone(), delivered));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(
        &self,
        stream: &str,
        fields: HashMap<String, String>,
        max_len: Option<u64>,
    ) -> Result<String, StoreError> {
        let id = self.with_stream(stream, |s| {
            s.next_seq += 1;
            let seq = s.next_seq;
            s.entries.push_back(Entry { seq, fields });
            if let Some(cap) = max_len {
                while s.entries.len() as u64 > cap {
                    s.entries.pop_front();
                }
            }
            message_id(seq)
        });
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        self.with_stream(stream, |s| {
            s.groups.entry(group.to_string()).or_default();
        });
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, Vec<DeliveredMessage>)>, StoreError> {
        let first = self.try_read(group, consumer, streams, count)?;
        if !first.is_empty() || block_ms == 0 {
            return Ok(first);
        }
        // Wait for an append, then look once more. A notification racing the
        // wait start can be missed; callers poll in a loop, so the worst case
        // is one extra block interval.
        let _ = tokio::time::timeout(Duration::from_millis(block_ms), self.appended.notified())
            .await;
        self.try_read(group, consumer, streams, count)
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<u64, StoreError> {
        let Some(seq) = parse_seq(message_id) else {
            return Ok(0);
        };
        Ok(self.with_stream(stream, |s| {
            s.groups
                .get_mut(group)
                .map(|g| if g.pending.remove(&seq).is_some() { 1 } else { 0 })
                .unwrap_or(0)
        }))
    }

    async fn del(&self, stream: &str, message_id: &str) -> Result<u64, StoreError> {
        let Some(seq) = parse_seq(message_id) else {
            return Ok(0);
        };
        Ok(self.with_stream(stream, |s| {
            let before = s.entries.len();
            s.entries.retain(|e| e.seq != seq);
            (before - s.entries.len()) as u64
        }))
    }

    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        min: &str,
        max: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let now = Instant::now();
        let lo = if min == "-" { 0 } else { parse_seq(min).unwrap_or(0) };
        let hi = if max == "+" {
            u64::MAX
        } else {
            parse_seq(max).unwrap_or(u64::MAX)
        };
        Ok(self.with_stream(stream, |s| {
            s.groups
                .get(group)
                .map(|g| {
                    g.pending
                        .range(lo..=hi)
                        .take(count)
                        .map(|(seq, p)| PendingEntry {
                            message_id: message_id(*seq),
                            consumer: p.consumer.clone(),
                            idle_ms: now.duration_since(p.delivered_at).as_millis() as u64,
                            deliveries: p.deliveries,
                        })
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        message_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self.with_stream(stream, |s| {
            let Some(grp) = s.groups.get_mut(group) else {
                return Vec::new();
            };
            let mut claimed = Vec::new();
            for id in message_ids {
                let Some(seq) = parse_seq(id) else { continue };
                if let Some(p) = grp.pending.get_mut(&seq) {
                    let idle = now.duration_since(p.delivered_at).as_millis() as u64;
                    if idle >= min_idle_ms {
                        p.consumer = consumer.to_string();
                        p.delivered_at = now;
                        p.deliveries += 1;
                        claimed.push(id.clone());
                    }
                }
            }
            grp.consumers.insert(consumer.to_string());
            claimed
        }))
    }

    async fn len(&self, stream: &str) -> Result<u64, StoreError> {
        Ok(self
            .streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn group_info(&self, stream: &str, group: &str) -> Result<GroupInfo, StoreError> {
        Ok(self
            .streams
            .lock()
            .unwrap()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| GroupInfo {
                pending: g.pending.len() as u64,
                consumers: g.consumers.len() as u64,
            })
            .unwrap_or_default())
    }
}

/// In-memory TTL key/value store.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(entry) = self.entries.get(key) {
            if Instant::now() < entry.1 {
                return Ok(Some(entry.0.clone()));
            }
        }
        // Expired entries are evicted on the read path.
        self.entries
            .remove_if(key, |_, (_, expires)| Instant::now() >= *expires);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let expires = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(v: &str) -> HashMap<String, String> {
        HashMap::from([("data".to_string(), v.to_string())])
    }

    #[tokio::test]
    async fn delivers_in_stream_order_and_acks() {
        let store = MemoryLogStore::new();
        store.ensure_group("s1", "g").await.unwrap();
        store.append("s1", fields("a"), None).await.unwrap();
        store.append("s1", fields("b"), None).await.unwrap();

        let read = store
            .read_group("g", "w1", &["s1".to_string()], 10, 0)
            .await
            .unwrap();
        let msgs = &read[0].1;
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].1["data"], "a");
        assert_eq!(msgs[1].1["data"], "b");

        assert_eq!(store.ack("s1", "g", &msgs[0].0).await.unwrap(), 1);
        assert_eq!(store.ack("s1", "g", &msgs[0].0).await.unwrap(), 0);
        let info = store.group_info("s1", "g").await.unwrap();
        assert_eq!(info.pending, 1);
    }

    #[tokio::test]
    async fn earlier_streams_win() {
        let store = MemoryLogStore::new();
        for s in ["hi", "lo"] {
            store.ensure_group(s, "g").await.unwrap();
        }
        store.append("lo", fields("low"), None).await.unwrap();
        store.append("hi", fields("high"), None).await.unwrap();

        let read = store
            .read_group("g", "w1", &["hi".to_string(), "lo".to_string()], 1, 0)
            .await
            .unwrap();
        assert_eq!(read[0].0, "hi");
        assert_eq!(read[0].1[0].1["data"], "high");
    }

    #[tokio::test]
    async fn claim_requires_idle() {
        let store = MemoryLogStore::new();
        store.ensure_group("s", "g").await.unwrap();
        store.append("s", fields("x"), None).await.unwrap();
        let read = store
            .read_group("g", "w1", &["s".to_string()], 1, 0)
            .await
            .unwrap();
        let id = read[0].1[0].0.clone();

        // Freshly delivered: not idle enough to claim.
        let claimed = store
            .claim("s", "g", "w2", 60_000, &[id.clone()])
            .await
            .unwrap();
        assert!(claimed.is_empty());

        let claimed = store.claim("s", "g", "w2", 0, &[id.clone()]).await.unwrap();
        assert_eq!(claimed, vec![id.clone()]);
        let pending = store.pending_range("s", "g", "-", "+", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "w2");
        assert_eq!(pending[0].deliveries, 2);
    }

    #[tokio::test]
    async fn max_len_trims_from_front() {
        let store = MemoryLogStore::new();
        for i in 0..5 {
            store
                .append("s", fields(&i.to_string()), Some(3))
                .await
                .unwrap();
        }
        assert_eq!(store.len("s").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn kv_ttl_expires() {
        let kv = MemoryKvStore::new();
        kv.set_ex("k", "v", 3600).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        kv.set_ex("gone", "v", 0).await.unwrap();
        assert_eq!(kv.get("gone").await.unwrap(), None);
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
