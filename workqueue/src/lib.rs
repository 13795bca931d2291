//! 聊天事件工作队列（workqueue）
//!
//! 在入站网关与业务处理器之间提供持久化、可重投的事件队列：
//! - 发布（`publisher`）：将平台事件编码为信封（`envelope`），按类别（`category`）写入对应的流；
//! - 注册（`registry`）：每个类别绑定一个强类型处理器与单次执行超时；
//! - 分发（`dispatch`）：解码、构建上下文（`context`）、调用处理器并归类结果；
//! - 引擎（`engine`）：拉取、回收、并发分发与确认的长驻任务；
//! - 传输（`transport`）：消费组语义的流式传输协议，`memory` 特性下附带内存实现。
//!
//! 投递语义为至少一次：处理器可能收到重复事件，需自行保证幂等。
//!
//! 典型用法：
//! 1. 构建 `HandlerRegistry` 并注册各类别处理器；
//! 2. 以传输层与注册表构建 `ConsumerEngine`，调用 `start` 获得 `EngineHandle`；
//! 3. 入站层通过 `EventCategory::from_event_payload` 判定类别后调用 `Publisher::publish`；
//! 4. 退出时调用 `EngineHandle::shutdown` 并等待 `join`。
//!
pub mod category;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod event;
pub mod publisher;
pub mod registry;
pub mod transport;

pub use category::EventCategory;
pub use context::{DispatchContext, EventMetadata};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use engine::{ConsumerConfig, ConsumerEngine, EngineHandle};
pub use envelope::Envelope;
pub use error::{QueueError, QueueResult};
pub use publisher::{EventPublisher, Publisher, PublisherConfig};
pub use registry::{EventHandler, HandlerError, HandlerRegistry, HandlerResult};
