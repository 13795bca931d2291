//! 工作队列统一错误定义
//!
//! 覆盖信封解析、载荷反序列化、处理器失败、传输层与调用方约定等最小必要集合。
//! 解析阶段的错误在分发边界被吸收（记录日志并确认），只有可重试的处理器失败
//! 会以 `Handler` 的形式向上传递给投递循环。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum QueueError {
    // --- 信封/载荷 ---
    #[error("malformed envelope: field={field}, reason={reason}")]
    MalformedEnvelope { field: &'static str, reason: String },
    #[error("payload decode error: {source}")]
    PayloadDecode {
        #[from]
        source: serde_json::Error,
    },
    #[error("invalid payload: {reason}")]
    InvalidPayload { reason: String },

    // --- 处理器 ---
    #[error("handler failed: stream={stream}, message_id={message_id}, reason={source}")]
    Handler {
        stream: String,
        message_id: String,
        source: anyhow::Error,
    },
    #[error("handler not found: stream={stream}")]
    HandlerNotFound { stream: String },
    #[error("deadline exceeded")]
    DeadlineExceeded,

    // --- 传输层 ---
    #[error("transport error: {reason}")]
    Transport { reason: String },
    #[error("invalid message id: {0}")]
    InvalidMessageId(String),

    // --- 调用方约定 ---
    #[error("unknown event category: {0}")]
    UnknownCategory(String),
}

impl QueueError {
    pub fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            field,
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type QueueResult<T> = Result<T, QueueError>;
