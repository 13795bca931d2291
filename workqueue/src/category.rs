//! 事件类别（EventCategory）
//!
//! 平台事件按类别划分到固定的流中，类别到流名的映射是封闭且完备的。
//! 从外部输入（标签、频道类型、原始事件载荷）推断类别可能失败，
//! 失败以 `UnknownCategory` 表示，与传输层错误区分开。
//!
use crate::error::{QueueError, QueueResult as Result};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// 事件类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventCategory {
    /// 公开频道消息（channel_type = channel）
    MessagePublic,
    /// 私有形态的消息：私有频道、单聊、多人单聊与 App Home
    MessagePrivate,
    /// 新成员加入工作区
    TeamJoin,
    /// 成员加入频道
    ChannelJoin,
}

impl EventCategory {
    pub const ALL: [EventCategory; 4] = [
        EventCategory::MessagePublic,
        EventCategory::MessagePrivate,
        EventCategory::TeamJoin,
        EventCategory::ChannelJoin,
    ];

    /// 类别对应的流名称
    pub fn stream_name(&self) -> &'static str {
        match self {
            EventCategory::MessagePublic => "slack_message_public",
            EventCategory::MessagePrivate => "slack_message_private",
            EventCategory::TeamJoin => "slack_team_join",
            EventCategory::ChannelJoin => "slack_channel_join",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EventCategory::MessagePublic => "message.public",
            EventCategory::MessagePrivate => "message.private",
            EventCategory::TeamJoin => "team.join",
            EventCategory::ChannelJoin => "channel.join",
        }
    }

    /// 日志中使用的处理器名称
    pub fn handler_name(&self) -> &'static str {
        match self {
            EventCategory::MessagePublic | EventCategory::MessagePrivate => "message",
            EventCategory::TeamJoin => "team_join",
            EventCategory::ChannelJoin => "channel_join",
        }
    }

    pub fn from_stream(stream: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.stream_name() == stream)
    }

    /// 按消息事件的 channel_type 归类
    pub fn from_channel_type(channel_type: &str) -> Result<Self> {
        match channel_type {
            "channel" => Ok(EventCategory::MessagePublic),
            "group" | "im" | "mpim" | "app_home" => Ok(EventCategory::MessagePrivate),
            other => Err(QueueError::UnknownCategory(format!(
                "message with channel_type {other:?}"
            ))),
        }
    }

    /// 根据平台回调中的内层事件推断类别
    ///
    /// 接受 `event_callback` 外层对象（取其 `event` 字段）或内层事件本身。
    pub fn from_event_payload(payload: &Value) -> Result<Self> {
        let event = payload.get("event").unwrap_or(payload);

        let Some(event_type) = event.get("type").and_then(Value::as_str) else {
            return Err(QueueError::UnknownCategory("event without type".into()));
        };

        match event_type {
            "message" => {
                let channel_type = event
                    .get("channel_type")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Self::from_channel_type(channel_type)
            }
            "team_join" => Ok(EventCategory::TeamJoin),
            "member_joined_channel" => Ok(EventCategory::ChannelJoin),
            other => Err(QueueError::UnknownCategory(other.to_string())),
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EventCategory {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.label() == s)
            .ok_or_else(|| QueueError::UnknownCategory(s.to_string()))
    }
}
