//! 消息信封（Envelope）编解码
//!
//! 信封是写入流中的最小单元，以扁平字段表的形式保存：
//!
//! | 字段         | 含义                                   |
//! |--------------|----------------------------------------|
//! | `request_id` | 关联的入站请求                          |
//! | `event_id`   | 平台分配的事件 ID（重投或平台重试时可能重复） |
//! | `event_ts`   | 事件在平台侧发生的时间（秒）              |
//! | `gateway_ts` | 信封入队时间（毫秒），编码时打点，不由调用方提供 |
//! | `json`       | 不透明的领域载荷                         |
//!
//! 五个字段均为必填，线上值全部为字符串；缺失或类型错误一律返回
//! `MalformedEnvelope` 并指明字段名。
//!
use crate::category::EventCategory;
use crate::error::{QueueError, QueueResult as Result};
use crate::transport::FieldMap;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub const REQUEST_ID: &str = "request_id";
pub const EVENT_ID: &str = "event_id";
pub const EVENT_TS: &str = "event_ts";
pub const GATEWAY_TS: &str = "gateway_ts";
pub const JSON: &str = "json";

/// 解码后的信封
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    request_id: String,
    event_id: String,
    event_time: DateTime<Utc>,
    enqueue_time: DateTime<Utc>,
    json: String,
}

impl Envelope {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// 平台侧事件时间，秒级精度
    pub fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }

    /// 入队时间，毫秒级精度
    pub fn enqueue_time(&self) -> DateTime<Utc> {
        self.enqueue_time
    }

    pub fn json(&self) -> &str {
        &self.json
    }

    /// 编码为字段表，返回目标流名称
    ///
    /// `gateway_ts` 取编码时刻的墙钟时间。
    ///
    /// 载荷须为合法 UTF-8：`json` 字段在线上是字符串，非 UTF-8 字节无法原样承载，
    /// 因此在触达传输层之前以 `InvalidPayload` 拒绝，而不是按不透明字节透传。
    pub fn encode(
        category: EventCategory,
        event_ts: i64,
        event_id: &str,
        request_id: &str,
        payload: &[u8],
    ) -> Result<(&'static str, FieldMap)> {
        let json = std::str::from_utf8(payload).map_err(|e| QueueError::InvalidPayload {
            reason: format!("payload is not valid UTF-8: {e}"),
        })?;

        let mut fields = FieldMap::new();
        fields.insert(REQUEST_ID.into(), Value::String(request_id.to_string()));
        fields.insert(
            GATEWAY_TS.into(),
            Value::String(Utc::now().timestamp_millis().to_string()),
        );
        fields.insert(EVENT_TS.into(), Value::String(event_ts.to_string()));
        fields.insert(EVENT_ID.into(), Value::String(event_id.to_string()));
        fields.insert(JSON.into(), Value::String(json.to_string()));

        Ok((category.stream_name(), fields))
    }

    /// 从字段表解码
    pub fn decode(fields: &FieldMap) -> Result<Self> {
        // 先检查存在性，再检查类型
        let event_ts = required(fields, EVENT_TS)?;
        let gateway_ts = required(fields, GATEWAY_TS)?;
        let event_id = required(fields, EVENT_ID)?;
        let json = required(fields, JSON)?;
        let request_id = required(fields, REQUEST_ID)?;

        let json = as_str(json, JSON)?;
        let event_id = as_str(event_id, EVENT_ID)?;
        let request_id = as_str(request_id, REQUEST_ID)?;
        let event_ts = parse_int(as_str(event_ts, EVENT_TS)?, EVENT_TS)?;
        let gateway_ts = parse_int(as_str(gateway_ts, GATEWAY_TS)?, GATEWAY_TS)?;

        let event_time = DateTime::from_timestamp(event_ts, 0)
            .ok_or_else(|| QueueError::malformed(EVENT_TS, format!("{event_ts} out of range")))?;
        let enqueue_time = from_unix_millis(gateway_ts)
            .ok_or_else(|| QueueError::malformed(GATEWAY_TS, format!("{gateway_ts} out of range")))?;

        Ok(Self {
            request_id: request_id.to_string(),
            event_id: event_id.to_string(),
            event_time,
            enqueue_time,
            json: json.to_string(),
        })
    }
}

impl TryFrom<&FieldMap> for Envelope {
    type Error = QueueError;

    fn try_from(fields: &FieldMap) -> Result<Self> {
        Self::decode(fields)
    }
}

fn required<'a>(fields: &'a FieldMap, field: &'static str) -> Result<&'a Value> {
    fields
        .get(field)
        .ok_or_else(|| QueueError::malformed(field, "not present"))
}

fn as_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| QueueError::malformed(field, "not a string"))
}

fn parse_int(raw: &str, field: &'static str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|e| QueueError::malformed(field, format!("failed to parse {raw:?}: {e}")))
}

/// 毫秒拆分为整秒与余数纳秒
fn from_unix_millis(millis: i64) -> Option<DateTime<Utc>> {
    let secs = millis.div_euclid(1000);
    let nanos = u32::try_from(millis.rem_euclid(1000) * 1_000_000).ok()?;
    DateTime::from_timestamp(secs, nanos)
}
