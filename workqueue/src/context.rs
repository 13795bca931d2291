//! 分发上下文（DispatchContext）
//!
//! 每次分发新建一个上下文，承载事件元数据、截止时间、取消信号与处理器日志 span，
//! 处理器返回后立即取消并丢弃。
//!
//! 取消是协作式的：截止时间到达时上下文被取消，但处理器不会被强制终止。
//! 编写处理器时应当：
//! - 对外部调用（如聊天平台 API）使用 [`DispatchContext::run`] 包裹，取消后尽快放弃；
//! - 在长循环中检查 [`DispatchContext::is_cancelled`]；
//! - 派生的后台任务持有 [`DispatchContext::child_token`]。
//!
//! 忽略取消的处理器最终返回的结果仍按常规规则归类，不存在单独的“超时”结局。
//!
//! 上下文只承载单条事件的信息。聊天平台客户端、机器人自身用户、频道缓存等共享依赖
//! 由处理器自行持有，通常在注册时以 `Arc` 捕获进闭包或作为处理器结构体字段。
//!
use crate::error::{QueueError, QueueResult as Result};
use crate::transport::MessageId;
use bon::Builder;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// 远期时间点，与 tokio 内部的 `far_future` 一致（约 30 年）
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`，溢出时取远期时间点；`Duration::MAX` 可表示“不设超时”
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// 事件元数据：由信封与传输层消息 ID 派生的只读视图
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
pub struct EventMetadata {
    event_id: String,
    request_id: String,
    /// 平台侧事件时间
    event_time: DateTime<Utc>,
    /// 入队时间
    enqueue_time: DateTime<Utc>,
    message_id: MessageId,
    stream: String,
}

impl EventMetadata {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }

    pub fn enqueue_time(&self) -> DateTime<Utc> {
        self.enqueue_time
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }
}

/// 单次分发的上下文
#[derive(Clone, Debug)]
pub struct DispatchContext {
    metadata: Arc<EventMetadata>,
    deadline: Instant,
    token: CancellationToken,
    span: Span,
}

impl DispatchContext {
    pub(crate) fn new(metadata: EventMetadata, timeout: Duration, span: Span) -> Self {
        Self {
            metadata: Arc::new(metadata),
            deadline: deadline_after(timeout),
            token: CancellationToken::new(),
            span,
        }
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// 距截止时间的剩余时长，已过期时为零
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待上下文被取消（截止时间到达或处理器已返回）
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// 供处理器派生的子任务使用，随上下文一同取消
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// 处理器范围的日志 span，字段包含流、消息 ID、事件 ID 与时间
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// 在上下文约束下执行一次调用；上下文先被取消时放弃该调用
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(QueueError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}
