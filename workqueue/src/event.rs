//! 平台事件载荷
//!
//! 处理器收到的强类型事件，字段名与平台回调保持一致。可选字段缺省，
//! 未知字段忽略，以便平台新增字段时无需同步升级。
//!
use serde::{Deserialize, Serialize};

/// 消息事件（公开频道、私有频道、单聊、多人单聊与 App Home 共用）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: Option<String>,
    pub user: String,
    pub bot_id: Option<String>,
    pub text: String,
    pub ts: String,
    pub thread_ts: Option<String>,
    pub channel: String,
    pub channel_type: String,
    pub event_ts: String,
}

impl MessageEvent {
    /// 是否为机器人发出的消息
    pub fn is_bot_message(&self) -> bool {
        self.bot_id.is_some() || self.subtype.as_deref() == Some("bot_message")
    }

    pub fn is_thread_reply(&self) -> bool {
        self.thread_ts.as_deref().is_some_and(|t| t != self.ts)
    }
}

/// 工作区成员资料（team_join 中携带）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub team_id: String,
    pub name: String,
    pub real_name: String,
    pub deleted: bool,
    pub is_bot: bool,
    pub tz: Option<String>,
}

/// 新成员加入工作区
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TeamJoinEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub user: User,
    #[serde(default)]
    pub event_ts: String,
}

/// 成员加入频道
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberJoinedChannelEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub user: String,
    pub channel: String,
    #[serde(default)]
    pub channel_type: String,
    #[serde(default)]
    pub team: String,
    pub inviter: Option<String>,
    #[serde(default)]
    pub event_ts: String,
}
