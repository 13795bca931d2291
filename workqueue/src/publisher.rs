//! 事件发布（Publisher）
//!
//! 将平台事件编码为信封并追加到类别对应的流中。发布不做本地重试，
//! 传输层错误原样返回给调用方（通常是入站 HTTP 层）。
//!
use crate::category::EventCategory;
use crate::envelope::Envelope;
use crate::error::QueueResult as Result;
use crate::transport::{MessageId, StreamTransport, StreamTrim};
use async_trait::async_trait;
use bon::Builder;
use std::sync::Arc;

/// 发布协议，供入站层依赖
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// 发布一个事件
    ///
    /// - `event_ts`：平台侧事件时间（秒）
    /// - `event_id`：平台分配的事件 ID
    /// - `request_id`：入站请求 ID
    /// - `payload`：序列化后的平台事件
    async fn publish(
        &self,
        category: EventCategory,
        event_ts: i64,
        event_id: &str,
        request_id: &str,
        payload: &[u8],
    ) -> Result<MessageId>;
}

/// 发布配置
#[derive(Clone, Copy, Debug)]
pub struct PublisherConfig {
    /// 每个流保留的最大条目数
    pub max_len: usize,
    /// 是否允许传输层近似裁剪
    pub approximate: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_len: 1024,
            approximate: true,
        }
    }
}

impl PublisherConfig {
    pub fn trim(&self) -> StreamTrim {
        if self.approximate {
            StreamTrim::Approximate(self.max_len)
        } else {
            StreamTrim::Exact(self.max_len)
        }
    }
}

/// 基于 `StreamTransport` 的发布实现
#[derive(Builder, Clone)]
pub struct Publisher {
    transport: Arc<dyn StreamTransport>,
    #[builder(default)]
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            transport,
            config: PublisherConfig::default(),
        }
    }
}

#[async_trait]
impl EventPublisher for Publisher {
    async fn publish(
        &self,
        category: EventCategory,
        event_ts: i64,
        event_id: &str,
        request_id: &str,
        payload: &[u8],
    ) -> Result<MessageId> {
        let (stream, fields) = Envelope::encode(category, event_ts, event_id, request_id, payload)?;
        let id = self
            .transport
            .append(stream, fields, self.config.trim())
            .await?;

        tracing::debug!(stream, message_id = %id, event_id, request_id, "event published");
        Ok(id)
    }
}
