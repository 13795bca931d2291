//! 分发包装（Dispatcher）
//!
//! 对每条投递到的流消息同步执行一次完整流水线：
//! 1. 解码信封；格式错误永远无法通过重试恢复，记录后确认，不调用处理器；
//! 2. 按类别的领域类型解码 `json` 载荷；失败同样记录后确认；
//! 3. 构建分发上下文：元数据、截止时间、取消信号与处理器日志 span；
//! 4. 调用处理器并计时；截止时间到达时取消上下文，但继续等待处理器自行返回；
//! 5. 归类结果：成功、丢弃、永久失败均确认；仅可重试失败以 `Err` 返回，
//!    由投递循环保留消息等待重投。
//!
//! 分发器只持有只读的注册表，可被多个投递 worker 并发调用。
//!
use crate::category::EventCategory;
use crate::context::{DispatchContext, EventMetadata};
use crate::envelope::Envelope;
use crate::error::{QueueError, QueueResult as Result};
use crate::registry::{HandlerRegistry, HandlerResult};
use crate::transport::StreamMessage;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, error, field, info, warn};

/// 单次分发的结局；`Ok` 中的所有结局都意味着应当确认消息
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 处理器成功返回
    Success,
    /// 处理器标记为丢弃的预期内失败
    Discarded,
    /// 不可重试的处理器失败（事件就此丢失）
    Failed,
    /// 信封或载荷无法解析，处理器未被调用
    Unprocessable,
}

/// 分发器
#[derive(Clone, Debug)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// 分发一条消息
    ///
    /// 返回 `Ok` 时调用方应确认消息；返回 `Err` 时消息应保留在待处理集合中：
    /// 可重试的处理器失败为 `QueueError::Handler`，未注册该流为 `QueueError::HandlerNotFound`。
    pub async fn dispatch(&self, message: &StreamMessage) -> Result<DispatchOutcome> {
        let Some(registration) =
            EventCategory::from_stream(&message.stream).and_then(|c| self.registry.get(c))
        else {
            return Err(QueueError::HandlerNotFound {
                stream: message.stream.clone(),
            });
        };

        let span = tracing::info_span!(
            "dispatch",
            handler = registration.category.handler_name(),
            stream = %message.stream,
            message_id = %message.id,
            event_id = field::Empty,
            event_time = field::Empty,
            enqueued_time = field::Empty,
        );

        let start = Instant::now();

        async move {
            let envelope = match Envelope::decode(&message.fields) {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!(error = %err, duration = ?start.elapsed(), "failed to parse message from gateway");
                    return Ok(DispatchOutcome::Unprocessable);
                }
            };

            let span = tracing::Span::current();
            span.record("event_id", envelope.event_id());
            span.record("event_time", field::display(envelope.event_time()));
            span.record("enqueued_time", field::display(envelope.enqueue_time()));

            let call = match registration.prepare(envelope.json()) {
                Ok(call) => call,
                Err(err) => {
                    let err = QueueError::from(err);
                    error!(error = %err, duration = ?start.elapsed(), "failed to parse message JSON");
                    return Ok(DispatchOutcome::Unprocessable);
                }
            };

            let metadata = EventMetadata::builder()
                .event_id(envelope.event_id().to_string())
                .request_id(envelope.request_id().to_string())
                .event_time(envelope.event_time())
                .enqueue_time(envelope.enqueue_time())
                .message_id(message.id)
                .stream(message.stream.clone())
                .build();
            let ctx = DispatchContext::new(metadata, registration.timeout, span);

            let handler_start = Instant::now();
            let result = run_until_returned(&ctx, call(ctx.clone())).await;
            let handler_duration = handler_start.elapsed();

            // 处理器返回即释放其派生的所有调用
            ctx.cancel();

            classify(message, result, handler_duration, start)
        }
        .instrument(span)
        .await
    }
}

/// 截止时间到达时只取消上下文，处理器仍需自行返回
async fn run_until_returned(
    ctx: &DispatchContext,
    mut handler: futures_util::future::BoxFuture<'static, HandlerResult>,
) -> HandlerResult {
    tokio::select! {
        result = &mut handler => result,
        _ = tokio::time::sleep_until(ctx.deadline()) => {
            ctx.cancel();
            warn!("handler deadline exceeded, context cancelled");
            handler.await
        }
    }
}

fn classify(
    message: &StreamMessage,
    result: HandlerResult,
    handler_duration: std::time::Duration,
    start: Instant,
) -> Result<DispatchOutcome> {
    let err = match result {
        Ok(()) => {
            info!(?handler_duration, duration = ?start.elapsed(), "complete");
            return Ok(DispatchOutcome::Success);
        }
        Err(err) => err,
    };

    // 丢弃优先于重试
    if err.discarded() {
        warn!(error = %err, ?handler_duration, duration = ?start.elapsed(), "discarded event");
        return Ok(DispatchOutcome::Discarded);
    }

    error!(
        error = %err,
        should_retry = err.should_retry(),
        ?handler_duration,
        duration = ?start.elapsed(),
        "handler failed"
    );

    if err.should_retry() {
        return Err(QueueError::Handler {
            stream: message.stream.clone(),
            message_id: message.id.to_string(),
            source: err.into_source(),
        });
    }

    Ok(DispatchOutcome::Failed)
}
