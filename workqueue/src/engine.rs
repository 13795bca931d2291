//! 消费引擎（ConsumerEngine）
//!
//! 统一编排“拉取 → 回收 → 分发处理 → 确认”的长驻任务：
//! - 每个已注册类别一个拉取循环：确保消费组存在后阻塞读取新消息；
//! - 周期回收空闲超过可见性超时的待处理消息，重新投入分发；
//! - 分发循环在有界通道上并发执行，成功归类后确认，可重试失败保留待重投；
//! - 提供关闭与等待的 `EngineHandle`。
//!
use crate::category::EventCategory;
use crate::dispatch::Dispatcher;
use crate::registry::HandlerRegistry;
use crate::transport::{StartPosition, StreamMessage, StreamTransport};
use bon::Builder;
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// 导入由 bon::Builder 生成的 typestate 模块与状态转换别名
use self::consumer_engine_builder::{IsUnset, SetDispatcher, State as BuilderState};

/// ConsumerEngine：
/// - 从传输层拉取与回收消息，交给 `Dispatcher` 处理
/// - 按分发结果确认或保留消息
#[derive(Builder)]
pub struct ConsumerEngine {
    transport: Arc<dyn StreamTransport>,
    #[builder(setters(vis = "pub(crate)"))]
    dispatcher: Dispatcher,
    #[builder(default)]
    config: ConsumerConfig,
}

// 仅当 `dispatcher` 尚未设置时可调用，注册表在此处冻结为只读
impl<S: BuilderState> ConsumerEngineBuilder<S> {
    pub fn registry(self, registry: HandlerRegistry) -> ConsumerEngineBuilder<SetDispatcher<S>>
    where
        <S as BuilderState>::Dispatcher: IsUnset,
    {
        self.dispatcher(Dispatcher::new(registry))
    }
}

impl ConsumerEngine {
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// 启动消费引擎，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> EngineHandle {
        let token = CancellationToken::new();
        let categories = self.dispatcher.registry().categories();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(categories.len() + 2);
        let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));

        if categories.is_empty() {
            warn!("no handlers registered, consumer engine is idle");
        }

        // poll worker（每个类别一个长循环）
        for category in categories.iter().copied() {
            tasks.push(tokio::spawn(self.clone().poll_loop(
                category,
                tx.clone(),
                token.clone(),
            )));
        }

        // reclaim worker（周期任务）
        {
            let engine = self.clone();
            let tx = tx.clone();
            let categories = categories.clone();
            let reclaim_token = token.clone();
            let interval = self.config.reclaim_interval;

            tasks.push(Self::spawn_periodic(token.clone(), interval, move || {
                let engine = engine.clone();
                let tx = tx.clone();
                let categories = categories.clone();
                let token = reclaim_token.clone();
                async move { engine.reclaim_once(&categories, &tx, &token).await }
            }));
        }

        // 所有发送端随拉取与回收任务退出而释放，分发循环据此排空并结束
        drop(tx);

        // dispatch worker（长循环）
        tasks.push(tokio::spawn(self.clone().dispatch_loop(rx)));

        info!(
            consumer = %self.config.consumer_name,
            group = %self.config.consumer_group,
            streams = categories.len(),
            "consumer engine started"
        );

        EngineHandle { token, tasks }
    }

    fn spawn_periodic<F, Fut>(
        token: CancellationToken,
        interval: Duration,
        mut f: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        // 零间隔会令 interval 构造 panic
        let interval = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            // 首次执行推迟一个周期，给拉取循环建组留出时间
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }

    async fn poll_loop(
        self: Arc<Self>,
        category: EventCategory,
        tx: mpsc::Sender<StreamMessage>,
        token: CancellationToken,
    ) {
        let stream = category.stream_name();
        let cfg = &self.config;

        loop {
            let ensured = tokio::select! {
                _ = token.cancelled() => return,
                r = self.transport.ensure_group(stream, &cfg.consumer_group, cfg.start_position) => r,
            };

            match ensured {
                Ok(()) => break,
                Err(err) => {
                    error!(stream, group = %cfg.consumer_group, error = %err, "failed to ensure consumer group");
                    if !Self::backoff(&token, cfg.error_backoff).await {
                        return;
                    }
                }
            }
        }

        debug!(stream, group = %cfg.consumer_group, consumer = %cfg.consumer_name, "polling stream");

        loop {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                r = self.transport.read_group(
                    stream,
                    &cfg.consumer_group,
                    &cfg.consumer_name,
                    cfg.buffer_size.max(1),
                    cfg.blocking_timeout,
                ) => r,
            };

            match read {
                Ok(messages) => {
                    if !Self::forward(&tx, &token, messages).await {
                        break;
                    }
                }
                Err(err) => {
                    error!(stream, error = %err, "failed to read from stream");
                    if !Self::backoff(&token, cfg.error_backoff).await {
                        break;
                    }
                }
            }
        }

        debug!(stream, "poll loop stopped");
    }

    async fn reclaim_once(
        &self,
        categories: &[EventCategory],
        tx: &mpsc::Sender<StreamMessage>,
        token: &CancellationToken,
    ) {
        let cfg = &self.config;

        for category in categories {
            let stream = category.stream_name();
            let reclaimed = self
                .transport
                .reclaim(
                    stream,
                    &cfg.consumer_group,
                    &cfg.consumer_name,
                    cfg.visibility_timeout,
                    cfg.buffer_size.max(1),
                )
                .await;

            match reclaimed {
                Ok(messages) if messages.is_empty() => {}
                Ok(messages) => {
                    info!(stream, count = messages.len(), "reclaimed idle messages");
                    if !Self::forward(tx, token, messages).await {
                        return;
                    }
                }
                Err(err) => {
                    warn!(stream, error = %err, "failed to reclaim idle messages");
                }
            }
        }
    }

    /// 投入分发通道；引擎关闭或通道关闭时返回 `false`，未投入的消息留待回收
    async fn forward(
        tx: &mpsc::Sender<StreamMessage>,
        token: &CancellationToken,
        messages: Vec<StreamMessage>,
    ) -> bool {
        for message in messages {
            let sent = tokio::select! {
                _ = token.cancelled() => false,
                r = tx.send(message) => r.is_ok(),
            };
            if !sent {
                return false;
            }
        }
        true
    }

    async fn backoff(token: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = time::sleep(delay) => true,
        }
    }

    async fn dispatch_loop(self: Arc<Self>, rx: mpsc::Receiver<StreamMessage>) {
        let concurrency = self.config.concurrency.max(1);

        ReceiverStream::new(rx)
            .for_each_concurrent(Some(concurrency), |message| {
                let engine = self.clone();
                async move {
                    let stream = message.stream.clone();
                    let message_id = message.id;

                    // 独立任务中执行，处理器 panic 不会拖垮分发循环
                    if let Err(err) = tokio::spawn(async move { engine.process(message).await }).await {
                        error!(%stream, %message_id, error = %err, "dispatch task aborted, message left pending");
                    }
                }
            })
            .await;

        debug!("dispatch loop drained");
    }

    async fn process(&self, message: StreamMessage) {
        let group = &self.config.consumer_group;

        match self.dispatcher.dispatch(&message).await {
            Ok(_) => {
                if let Err(err) = self.transport.ack(&message.stream, group, &message.id).await {
                    error!(
                        stream = %message.stream,
                        message_id = %message.id,
                        error = %err,
                        "failed to ack message"
                    );
                }
            }
            Err(err) => {
                debug!(
                    stream = %message.stream,
                    message_id = %message.id,
                    error = %err,
                    "message left pending for redelivery"
                );
            }
        }
    }
}

/// 消费引擎配置
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// 消费者名称，默认取 `$HOSTNAME`
    pub consumer_name: String,
    pub consumer_group: String,
    /// 未确认消息被回收重投前的空闲时长
    pub visibility_timeout: Duration,
    /// 单次读取的最长阻塞时间
    pub blocking_timeout: Duration,
    pub reclaim_interval: Duration,
    /// 单次读取条数与分发通道容量
    pub buffer_size: usize,
    /// 同时进行的分发数
    pub concurrency: usize,
    /// 传输层出错后的重试间隔
    pub error_backoff: Duration,
    /// 新建消费组的起始位置
    pub start_position: StartPosition,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_name: std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "localhost".to_string()),
            consumer_group: "workqueue".to_string(),
            visibility_timeout: Duration::from_secs(10),
            blocking_timeout: Duration::from_secs(10),
            reclaim_interval: Duration::from_secs(1),
            buffer_size: 1,
            concurrency: 2,
            error_backoff: Duration::from_secs(1),
            start_position: StartPosition::Latest,
        }
    }
}

/// 引擎运行句柄：用于优雅关闭与等待任务结束
pub struct EngineHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// 停止拉取与回收；已进入分发通道的消息仍会处理完毕
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            if let Err(err) = t.await {
                error!(error = %err, "engine task terminated abnormally");
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
