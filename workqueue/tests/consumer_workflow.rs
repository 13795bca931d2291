use anyhow::{Result as AnyResult, anyhow};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use ulid::Ulid;
use workqueue::event::{MemberJoinedChannelEvent, MessageEvent, TeamJoinEvent};
use workqueue::transport::{FieldMap, InMemoryTransport, StartPosition, StreamTransport, StreamTrim};
use workqueue::{
    ConsumerConfig, ConsumerEngine, DispatchContext, EventCategory, EventPublisher, HandlerError,
    HandlerRegistry, HandlerResult, Publisher,
};

const GROUP: &str = "workflow";

fn config() -> ConsumerConfig {
    ConsumerConfig {
        consumer_name: "worker-1".into(),
        consumer_group: GROUP.into(),
        visibility_timeout: Duration::from_millis(100),
        blocking_timeout: Duration::from_millis(50),
        reclaim_interval: Duration::from_millis(20),
        error_backoff: Duration::from_millis(10),
        start_position: StartPosition::Beginning,
        ..Default::default()
    }
}

fn engine(transport: Arc<InMemoryTransport>, registry: HandlerRegistry) -> Arc<ConsumerEngine> {
    Arc::new(
        ConsumerEngine::builder()
            .transport(transport)
            .registry(registry)
            .config(config())
            .build(),
    )
}

async fn publish(
    publisher: &Publisher,
    payload: serde_json::Value,
) -> AnyResult<EventCategory> {
    let category = EventCategory::from_event_payload(&payload)?;
    let event_id = format!("Ev{}", Ulid::new());
    let request_id = Ulid::new().to_string();
    publisher
        .publish(
            category,
            1_700_000_000,
            &event_id,
            &request_id,
            payload.to_string().as_bytes(),
        )
        .await?;
    Ok(category)
}

/// 使用 timeout + 条件轮询，避免固定 sleep
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if check().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test(flavor = "multi_thread")]
async fn published_message_is_handled_and_acked() -> AnyResult<()> {
    let transport = Arc::new(InMemoryTransport::new());
    let publisher = Publisher::new(transport.clone());
    let handled = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    {
        let handled = handled.clone();
        registry.register_private_messages(
            Duration::from_secs(1),
            move |ctx: DispatchContext, m: MessageEvent| {
                let handled = handled.clone();
                async move {
                    if m.text != "hello" || ctx.metadata().stream() != "slack_message_private" {
                        return Err(HandlerError::fail(anyhow!("unexpected event")));
                    }
                    handled.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            },
        );
    }

    let category = publish(
        &publisher,
        serde_json::json!({
            "type": "message", "channel_type": "im", "channel": "D1", "user": "U1", "text": "hello", "ts": "1.0"
        }),
    )
    .await?;
    assert_eq!(category, EventCategory::MessagePrivate);

    let handle = engine(transport.clone(), registry).start();
    let done = eventually(|| {
        let transport = transport.clone();
        let handled = handled.clone();
        async move {
            handled.load(Ordering::Relaxed) == 1
                && transport.pending_count("slack_message_private", GROUP).await == 0
        }
    })
    .await;
    handle.shutdown();
    handle.join().await;

    assert!(done, "message was not handled and acked in time");
    assert_eq!(transport.len("slack_message_private").await, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn retryable_failure_is_redelivered_then_acked() -> AnyResult<()> {
    let transport = Arc::new(InMemoryTransport::new());
    let publisher = Publisher::new(transport.clone());
    let attempts = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    {
        let attempts = attempts.clone();
        registry.register_team_joins(
            Duration::from_secs(1),
            move |_ctx: DispatchContext, tj: TeamJoinEvent| {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::Relaxed) == 0 {
                        return Err(HandlerError::retry(anyhow!(
                            "profile lookup for {} unavailable",
                            tj.user.id
                        )));
                    }
                    HandlerResult::Ok(())
                }
            },
        );
    }

    publish(
        &publisher,
        serde_json::json!({"type": "team_join", "user": {"id": "U7", "name": "bea"}}),
    )
    .await?;

    let handle = engine(transport.clone(), registry).start();
    let done = eventually(|| {
        let transport = transport.clone();
        let attempts = attempts.clone();
        async move {
            attempts.load(Ordering::Relaxed) >= 2
                && transport.pending_count("slack_team_join", GROUP).await == 0
        }
    })
    .await;
    handle.shutdown();
    handle.join().await;

    assert!(done, "retryable failure was not redelivered and acked in time");
    assert_eq!(attempts.load(Ordering::Relaxed), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn discarded_failed_and_malformed_messages_are_acked() -> AnyResult<()> {
    let transport = Arc::new(InMemoryTransport::new());
    let publisher = Publisher::new(transport.clone());
    let discarded = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    {
        let failed = failed.clone();
        registry.register_channel_joins(
            Duration::from_secs(1),
            move |_ctx: DispatchContext, cj: MemberJoinedChannelEvent| {
                let failed = failed.clone();
                async move {
                    failed.fetch_add(1, Ordering::Relaxed);
                    Err::<(), _>(HandlerError::fail(anyhow!(
                        "channel {} is archived",
                        cj.channel
                    )))
                }
            },
        );
    }
    {
        let discarded = discarded.clone();
        registry.register_team_joins(
            Duration::from_secs(1),
            move |_ctx: DispatchContext, tj: TeamJoinEvent| {
                let discarded = discarded.clone();
                async move {
                    discarded.fetch_add(1, Ordering::Relaxed);
                    Err::<(), _>(
                        HandlerError::discard(anyhow!("bot account {} ignored", tj.user.id))
                            .with_retry(true),
                    )
                }
            },
        );
    }

    // 缺少 event_ts 的条目先于正常事件入队
    let mut malformed = FieldMap::new();
    malformed.insert("event_id".into(), "Ev0".into());
    malformed.insert("json".into(), "{}".into());
    transport
        .append("slack_team_join", malformed, StreamTrim::None)
        .await?;
    publish(
        &publisher,
        serde_json::json!({"type": "team_join", "user": {"id": "B1", "is_bot": true}}),
    )
    .await?;
    publish(
        &publisher,
        serde_json::json!({"type": "member_joined_channel", "user": "U1", "channel": "C9"}),
    )
    .await?;

    let handle = engine(transport.clone(), registry).start();
    let done = eventually(|| {
        let transport = transport.clone();
        let discarded = discarded.clone();
        let failed = failed.clone();
        async move {
            discarded.load(Ordering::Relaxed) == 1
                && failed.load(Ordering::Relaxed) == 1
                && transport.pending_count("slack_team_join", GROUP).await == 0
                && transport.pending_count("slack_channel_join", GROUP).await == 0
        }
    })
    .await;

    // 超过可见性超时后仍无重投
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown();
    handle.join().await;

    assert!(done, "settled messages were not acked in time");
    assert_eq!(discarded.load(Ordering::Relaxed), 1);
    assert_eq!(failed.load(Ordering::Relaxed), 1);
    assert_eq!(transport.pending_count("slack_team_join", GROUP).await, 0);
    assert_eq!(transport.pending_count("slack_channel_join", GROUP).await, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_in_flight_dispatch() -> AnyResult<()> {
    let transport = Arc::new(InMemoryTransport::new());
    let publisher = Publisher::new(transport.clone());
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::new();
    {
        let started = started.clone();
        let finished = finished.clone();
        registry.register_public_messages(
            Duration::from_secs(1),
            move |_ctx: DispatchContext, _m: MessageEvent| {
                let started = started.clone();
                let finished = finished.clone();
                async move {
                    started.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    finished.fetch_add(1, Ordering::Relaxed);
                    HandlerResult::Ok(())
                }
            },
        );
    }

    publish(
        &publisher,
        serde_json::json!({"type": "message", "channel_type": "channel", "channel": "C1", "text": "hi"}),
    )
    .await?;

    let handle = engine(transport.clone(), registry).start();
    let in_flight = eventually(|| {
        let started = started.clone();
        async move { started.load(Ordering::Relaxed) == 1 }
    })
    .await;
    assert!(in_flight, "handler never started");

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(2), handle.join()).await?;

    assert_eq!(finished.load(Ordering::Relaxed), 1);
    assert_eq!(transport.pending_count("slack_message_public", GROUP).await, 0);
    Ok(())
}

#[tokio::test]
async fn unknown_category_is_rejected_before_publish() {
    let transport = Arc::new(InMemoryTransport::new());
    let err = EventCategory::from_event_payload(&serde_json::json!({"type": "reaction_added"}))
        .unwrap_err();
    assert!(matches!(err, workqueue::QueueError::UnknownCategory(_)));

    for category in EventCategory::ALL {
        assert_eq!(transport.len(category.stream_name()).await, 0);
    }
}
