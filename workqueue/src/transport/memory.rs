//! 内存版流式传输（InMemoryTransport）
//!
//! 在进程内模拟带消费组的持久化流，满足 `StreamTransport` 协议：
//! - `append`：分配单调递增的消息 ID 并按裁剪策略限制流长度；
//! - `read_group`：按消费组推进读取位点，记录待处理（未确认）条目，支持阻塞等待；
//! - `ack`：将条目移出待处理集合；
//! - `reclaim`：把空闲超过可见性超时的待处理条目转交给调用方消费者。
//!
//! 注意：数据只存在于内存中，进程退出即丢失；典型用途为测试、示例与本地开发。

use super::{FieldMap, MessageId, StartPosition, StreamMessage, StreamTransport, StreamTrim};
use crate::context::deadline_after;
use crate::error::{QueueError, QueueResult as Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<MessageId, FieldMap>,
    last_id: MessageId,
    groups: HashMap<String, GroupState>,
}

struct GroupState {
    last_delivered: MessageId,
    pending: BTreeMap<MessageId, PendingEntry>,
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

/// 内存流式传输
#[derive(Default)]
pub struct InMemoryTransport {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 流中当前保留的条目数
    pub async fn len(&self, stream: &str) -> usize {
        let streams = self.streams.lock().await;
        streams.get(stream).map_or(0, |s| s.entries.len())
    }

    /// 消费组中尚未确认的条目数
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// 某条待处理条目被投递的次数
    pub async fn delivery_count(&self, stream: &str, group: &str, id: &MessageId) -> Option<u32> {
        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(id))
            .map(|p| p.deliveries)
    }

    /// 某条待处理条目当前归属的消费者
    pub async fn pending_owner(&self, stream: &str, group: &str, id: &MessageId) -> Option<String> {
        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .and_then(|g| g.pending.get(id))
            .map(|p| p.consumer.clone())
    }

    fn no_group(stream: &str, group: &str) -> QueueError {
        QueueError::transport(format!("NOGROUP no such consumer group {group} for stream {stream}"))
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn append(&self, stream: &str, fields: FieldMap, trim: StreamTrim) -> Result<MessageId> {
        let id = {
            let mut streams = self.streams.lock().await;
            let state = streams.entry(stream.to_string()).or_default();

            let now_millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
            let id = state.last_id.next(now_millis);
            state.last_id = id;
            state.entries.insert(id, fields);

            // 内存中裁剪成本很低，近似与精确上限按同一方式处理
            let max_len = match trim {
                StreamTrim::None => None,
                StreamTrim::Approximate(n) | StreamTrim::Exact(n) => Some(n),
            };
            if let Some(max_len) = max_len {
                while state.entries.len() > max_len {
                    state.entries.pop_first();
                }
            }

            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: StartPosition) -> Result<()> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        let last_id = state.last_id;

        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: match start {
                    StartPosition::Latest => last_id,
                    StartPosition::Beginning => MessageId::ZERO,
                },
                pending: BTreeMap::new(),
            });

        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>> {
        let deadline = deadline_after(block);

        loop {
            // 先登记唤醒，再检查数据，避免在两者之间追加的消息被错过
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            {
                let mut streams = self.streams.lock().await;
                let state = streams
                    .get_mut(stream)
                    .ok_or_else(|| Self::no_group(stream, group))?;
                let group_state = state
                    .groups
                    .get_mut(group)
                    .ok_or_else(|| Self::no_group(stream, group))?;

                let now = Instant::now();
                let messages: Vec<StreamMessage> = state
                    .entries
                    .range((Bound::Excluded(group_state.last_delivered), Bound::Unbounded))
                    .take(count.max(1))
                    .map(|(id, fields)| StreamMessage {
                        id: *id,
                        stream: stream.to_string(),
                        fields: fields.clone(),
                    })
                    .collect();

                if let Some(last) = messages.last() {
                    group_state.last_delivered = last.id;
                    for m in &messages {
                        group_state.pending.insert(
                            m.id,
                            PendingEntry {
                                consumer: consumer.to_string(),
                                delivered_at: now,
                                deliveries: 1,
                            },
                        );
                    }
                    return Ok(messages);
                }
            }

            if block.is_zero() || tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> Result<()> {
        let mut streams = self.streams.lock().await;
        let group_state = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| Self::no_group(stream, group))?;

        // 重复确认不是错误
        group_state.pending.remove(id);
        Ok(())
    }

    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let mut streams = self.streams.lock().await;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_group(stream, group))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| Self::no_group(stream, group))?;

        let now = Instant::now();
        let idle: Vec<MessageId> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .take(count.max(1))
            .collect();

        let mut claimed = Vec::with_capacity(idle.len());
        for id in idle {
            match state.entries.get(&id) {
                Some(fields) => {
                    if let Some(p) = group_state.pending.get_mut(&id) {
                        p.consumer = consumer.to_string();
                        p.delivered_at = now;
                        p.deliveries += 1;
                    }
                    claimed.push(StreamMessage {
                        id,
                        stream: stream.to_string(),
                        fields: fields.clone(),
                    });
                }
                // 条目已被裁剪，待处理记录随之丢弃
                None => {
                    group_state.pending.remove(&id);
                }
            }
        }

        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn fields(n: u64) -> FieldMap {
        let mut m = FieldMap::new();
        m.insert("n".into(), Value::String(n.to_string()));
        m
    }

    #[tokio::test]
    async fn group_starts_at_latest_and_tracks_pending() {
        let t = InMemoryTransport::new();
        t.append("s", fields(0), StreamTrim::None).await.unwrap();
        t.ensure_group("s", "g", StartPosition::Latest).await.unwrap();
        let id = t.append("s", fields(1), StreamTrim::None).await.unwrap();

        let got = t
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, id);
        assert_eq!(got[0].fields["n"], json!("1"));
        assert_eq!(t.pending_count("s", "g").await, 1);

        // 同组的其他消费者不会再读到已投递的条目
        let none = t
            .read_group("s", "g", "c2", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(none.is_empty());

        t.ack("s", "g", &id).await.unwrap();
        t.ack("s", "g", &id).await.unwrap();
        assert_eq!(t.pending_count("s", "g").await, 0);
    }

    #[tokio::test]
    async fn beginning_position_sees_existing_entries() {
        let t = InMemoryTransport::new();
        t.append("s", fields(0), StreamTrim::None).await.unwrap();
        t.ensure_group("s", "g", StartPosition::Beginning)
            .await
            .unwrap();
        let got = t.read_group("s", "g", "c", 10, Duration::ZERO).await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn missing_group_is_a_transport_error() {
        let t = InMemoryTransport::new();
        let err = t
            .read_group("s", "g", "c", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Transport { .. }));
        assert!(t.ack("s", "g", &MessageId::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn trimming_bounds_stream_length() {
        let t = InMemoryTransport::new();
        for n in 0..10 {
            t.append("s", fields(n), StreamTrim::Approximate(4))
                .await
                .unwrap();
        }
        assert_eq!(t.len("s").await, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_read_wakes_on_append() {
        let t = Arc::new(InMemoryTransport::new());
        t.ensure_group("s", "g", StartPosition::Latest).await.unwrap();

        let reader = {
            let t = t.clone();
            tokio::spawn(async move {
                t.read_group("s", "g", "c", 1, Duration::from_secs(5)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        t.append("s", fields(7), StreamTrim::None).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader should wake")
            .unwrap()
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unbounded_block_still_wakes_on_append() {
        let t = Arc::new(InMemoryTransport::new());
        t.ensure_group("s", "g", StartPosition::Latest).await.unwrap();

        let reader = {
            let t = t.clone();
            tokio::spawn(async move { t.read_group("s", "g", "c", 1, Duration::MAX).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        t.append("s", fields(3), StreamTrim::None).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader should wake")
            .unwrap()
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty() {
        let t = InMemoryTransport::new();
        t.ensure_group("s", "g", StartPosition::Latest).await.unwrap();
        let got = t
            .read_group("s", "g", "c", 1, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn reclaim_hands_idle_entries_to_another_consumer() {
        let t = InMemoryTransport::new();
        t.ensure_group("s", "g", StartPosition::Latest).await.unwrap();
        let id = t.append("s", fields(1), StreamTrim::None).await.unwrap();
        t.read_group("s", "g", "c1", 1, Duration::ZERO).await.unwrap();

        let early = t
            .reclaim("s", "g", "c2", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let claimed = t
            .reclaim("s", "g", "c2", Duration::from_millis(10), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(t.delivery_count("s", "g", &id).await, Some(2));
        assert_eq!(t.pending_owner("s", "g", &id).await.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn reclaim_drops_pending_entries_that_were_trimmed() {
        let t = InMemoryTransport::new();
        t.ensure_group("s", "g", StartPosition::Latest).await.unwrap();
        t.append("s", fields(1), StreamTrim::None).await.unwrap();
        t.read_group("s", "g", "c1", 1, Duration::ZERO).await.unwrap();
        t.append("s", fields(2), StreamTrim::Exact(1)).await.unwrap();

        let claimed = t.reclaim("s", "g", "c2", Duration::ZERO, 10).await.unwrap();
        assert!(claimed.is_empty());
        assert_eq!(t.pending_count("s", "g").await, 0);
    }
}
