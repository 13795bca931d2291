//! 流式传输（StreamTransport）协议
//!
//! 描述工作队列所依赖的持久化流：按流追加、消费组竞争消费、
//! 基于可见性超时的回收重投以及阻塞读取。生产实现（如 Redis Streams）
//! 由外部提供；`memory` 特性下附带一个内存实现，供测试与本地开发使用。
//!
use crate::error::{QueueError, QueueResult as Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::{fmt, str::FromStr, time::Duration};

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "memory")]
pub use memory::InMemoryTransport;

/// 传输层的扁平字段表（键为字符串，线上值均为字符串）
pub type FieldMap = Map<String, Value>;

/// 传输层分配的消息 ID：`<毫秒>-<序号>`，全序且单调递增
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    millis: u64,
    seq: u64,
}

impl MessageId {
    pub const ZERO: MessageId = MessageId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    pub fn millis(&self) -> u64 {
        self.millis
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// 给定当前毫秒时间，生成严格大于 `self` 的下一个 ID
    pub fn next(&self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for MessageId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || QueueError::InvalidMessageId(s.to_string());

        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        let millis = millis.parse().map_err(|_| invalid())?;
        let seq = seq.parse().map_err(|_| invalid())?;

        Ok(Self { millis, seq })
    }
}

/// 一条已投递的流消息
#[derive(Clone, Debug)]
pub struct StreamMessage {
    pub id: MessageId,
    pub stream: String,
    pub fields: FieldMap,
}

/// 追加时的长度裁剪策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamTrim {
    None,
    /// 近似上限：允许短暂超过，由传输层择机裁剪
    Approximate(usize),
    Exact(usize),
}

/// 新建消费组的起始位置
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// 仅消费建组之后追加的消息
    #[default]
    Latest,
    /// 从流的起始处消费
    Beginning,
}

/// 流式传输：追加、消费组读取、确认与回收
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// 追加一条消息，返回传输层分配的 ID
    async fn append(&self, stream: &str, fields: FieldMap, trim: StreamTrim) -> Result<MessageId>;

    /// 确保消费组存在；已存在时不做任何修改
    async fn ensure_group(&self, stream: &str, group: &str, start: StartPosition) -> Result<()>;

    /// 以消费者身份读取新消息，最多阻塞 `block`；超时返回空集合
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>>;

    /// 确认消息已处理，将其移出待处理集合
    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> Result<()>;

    /// 认领空闲超过 `min_idle` 的待处理消息并转交给 `consumer`
    async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>>;
}
