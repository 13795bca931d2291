//! 处理器注册表（HandlerRegistry）
//!
//! 每个事件类别绑定一个强类型处理器及其单次执行超时。注册表在启动阶段通过
//! `&mut self` 装配，随后移交给 `Dispatcher`，此后只读，因此注册与分发不会并发。
//!
//! 处理器通过返回值告知队列如何处置消息：
//! - `Ok(())`：成功，确认消息；
//! - `Err(e)` 且 `e.discarded()`：预期内可忽略的情况，确认且不重投；
//! - `Err(e)` 且 `e.should_retry()`：保留为待处理，可见性超时后重投；
//! - 其余错误：永久失败，仍然确认（接受丢失该事件）。
//!
use crate::category::EventCategory;
use crate::context::DispatchContext;
use crate::event::{MemberJoinedChannelEvent, MessageEvent, TeamJoinEvent};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// 处理器返回值
pub type HandlerResult = Result<(), HandlerError>;

/// 处理器错误：源错误加上重试/丢弃两个标记
///
/// 任何可转换为 `anyhow::Error` 的错误都可以通过 `?` 转为不可重试的失败。
#[derive(Debug)]
pub struct HandlerError {
    source: anyhow::Error,
    should_retry: bool,
    discarded: bool,
}

impl HandlerError {
    /// 永久失败：记录错误并确认
    pub fn fail(err: impl Into<anyhow::Error>) -> Self {
        Self {
            source: err.into(),
            should_retry: false,
            discarded: false,
        }
    }

    /// 可重试失败：保留消息等待重投
    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        Self::fail(err).with_retry(true)
    }

    /// 丢弃：预期内的情况（例如机器人应忽略的频道），以较低级别记录并确认
    pub fn discard(err: impl Into<anyhow::Error>) -> Self {
        Self::fail(err).with_discarded(true)
    }

    pub fn with_retry(mut self, should_retry: bool) -> Self {
        self.should_retry = should_retry;
        self
    }

    pub fn with_discarded(mut self, discarded: bool) -> Self {
        self.discarded = discarded;
        self
    }

    pub fn should_retry(&self) -> bool {
        self.should_retry
    }

    pub fn discarded(&self) -> bool {
        self.discarded
    }

    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }

    pub fn into_source(self) -> anyhow::Error {
        self.source
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.source)
    }
}

impl<E> From<E> for HandlerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::fail(err)
    }
}

/// 事件处理器：处理某一类别解码后的载荷
#[async_trait]
pub trait EventHandler<E>: Send + Sync
where
    E: Send + 'static,
{
    async fn handle(&self, ctx: DispatchContext, event: E) -> HandlerResult;
}

/// 允许直接以异步闭包作为处理器
#[async_trait]
impl<E, F, Fut> EventHandler<E> for F
where
    E: Send + 'static,
    F: Fn(DispatchContext, E) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: DispatchContext, event: E) -> HandlerResult {
        (self)(ctx, event).await
    }
}

/// 载荷解码后的待执行调用
pub(crate) type PreparedCall = Box<dyn FnOnce(DispatchContext) -> BoxFuture<'static, HandlerResult> + Send>;

type PrepareFn = Arc<dyn Fn(&str) -> serde_json::Result<PreparedCall> + Send + Sync>;

/// 单个类别的注册项
#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) category: EventCategory,
    pub(crate) timeout: Duration,
    prepare: PrepareFn,
}

impl Registration {
    /// 按该类别的领域类型解码 `json` 载荷
    pub(crate) fn prepare(&self, json: &str) -> serde_json::Result<PreparedCall> {
        (self.prepare)(json)
    }
}

/// 处理器注册表
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_category: HashMap<EventCategory, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 公开频道消息
    pub fn register_public_messages<H>(&mut self, timeout: Duration, handler: H) -> &mut Self
    where
        H: EventHandler<MessageEvent> + 'static,
    {
        self.register(EventCategory::MessagePublic, timeout, handler)
    }

    /// 私有频道、单聊、多人单聊与 App Home 消息
    pub fn register_private_messages<H>(&mut self, timeout: Duration, handler: H) -> &mut Self
    where
        H: EventHandler<MessageEvent> + 'static,
    {
        self.register(EventCategory::MessagePrivate, timeout, handler)
    }

    pub fn register_team_joins<H>(&mut self, timeout: Duration, handler: H) -> &mut Self
    where
        H: EventHandler<TeamJoinEvent> + 'static,
    {
        self.register(EventCategory::TeamJoin, timeout, handler)
    }

    pub fn register_channel_joins<H>(&mut self, timeout: Duration, handler: H) -> &mut Self
    where
        H: EventHandler<MemberJoinedChannelEvent> + 'static,
    {
        self.register(EventCategory::ChannelJoin, timeout, handler)
    }

    /// 绑定任意可反序列化的载荷类型；重复注册会替换旧的处理器
    pub(crate) fn register<E, H>(
        &mut self,
        category: EventCategory,
        timeout: Duration,
        handler: H,
    ) -> &mut Self
    where
        E: DeserializeOwned + Send + 'static,
        H: EventHandler<E> + 'static,
    {
        let handler = Arc::new(handler);

        let prepare: PrepareFn = Arc::new(move |json: &str| -> serde_json::Result<PreparedCall> {
            let event: E = serde_json::from_str(json)?;
            let handler = handler.clone();

            Ok(Box::new(move |ctx: DispatchContext| {
                async move { handler.handle(ctx, event).await }.boxed()
            }))
        });

        let registration = Registration {
            category,
            timeout,
            prepare,
        };

        if self.by_category.insert(category, registration).is_some() {
            tracing::debug!(category = %category, "replaced previously registered handler");
        }

        self
    }

    /// 已注册的类别，按固定顺序返回
    pub fn categories(&self) -> Vec<EventCategory> {
        let mut categories: Vec<EventCategory> = self.by_category.keys().copied().collect();
        categories.sort();
        categories
    }

    pub fn timeout(&self, category: EventCategory) -> Option<Duration> {
        self.by_category.get(&category).map(|r| r.timeout)
    }

    pub fn is_empty(&self) -> bool {
        self.by_category.is_empty()
    }

    pub(crate) fn get(&self, category: EventCategory) -> Option<&Registration> {
        self.by_category.get(&category)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.categories().into_iter().map(|c| (c, self.timeout(c))))
            .finish()
    }
}
