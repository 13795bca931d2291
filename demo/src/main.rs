use anyhow::{Result as AnyResult, anyhow};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Level, info};
use tracing_subscriber::EnvFilter;
use ulid::Ulid;
use workqueue::event::{MemberJoinedChannelEvent, MessageEvent, TeamJoinEvent};
use workqueue::transport::{InMemoryTransport, StartPosition};
use workqueue::{
    ConsumerConfig, ConsumerEngine, DispatchContext, EventCategory, EventPublisher, HandlerError,
    HandlerRegistry, HandlerResult, Publisher,
};

/// 模拟一次聊天平台 API 调用
async fn post_reply(channel: &str, text: &str) -> AnyResult<()> {
    tokio::time::sleep(Duration::from_millis(30)).await;
    info!(channel, text, "reply posted");
    Ok(())
}

async fn on_message(ctx: DispatchContext, m: MessageEvent) -> HandlerResult {
    if m.is_bot_message() {
        return Err(HandlerError::discard(anyhow!("ignoring bot message in {}", m.channel)));
    }

    let reply = format!("echo: {}", m.text);
    ctx.run(post_reply(&m.channel, &reply).instrument(ctx.span().clone()))
        .await
        .map_err(HandlerError::retry)?
        .map_err(HandlerError::retry)
}

async fn on_team_join(ctx: DispatchContext, tj: TeamJoinEvent) -> HandlerResult {
    let _entered = ctx.span().enter();
    info!(user = %tj.user.id, name = %tj.user.name, "welcome new member");
    Ok(())
}

async fn on_channel_join(ctx: DispatchContext, cj: MemberJoinedChannelEvent) -> HandlerResult {
    let _entered = ctx.span().enter();
    info!(user = %cj.user, channel = %cj.channel, "member joined channel");
    Ok(())
}

/// 入站层：判定类别后发布
async fn ingest(publisher: &Publisher, payload: Value) -> AnyResult<()> {
    let category = EventCategory::from_event_payload(&payload)?;
    let event = payload.get("event").unwrap_or(&payload);
    let event_ts = payload
        .get("event_time")
        .and_then(Value::as_i64)
        .unwrap_or_default();
    let event_id = payload
        .get("event_id")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let id = publisher
        .publish(
            category,
            event_ts,
            event_id,
            &Ulid::new().to_string(),
            event.to_string().as_bytes(),
        )
        .await?;
    info!(%category, message_id = %id, "event enqueued");
    Ok(())
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("workqueue=debug".parse()?),
        )
        .init();

    let transport = Arc::new(InMemoryTransport::new());
    let publisher = Publisher::new(transport.clone());

    let mut registry = HandlerRegistry::new();
    registry
        .register_public_messages(Duration::from_secs(2), on_message)
        .register_private_messages(Duration::from_secs(2), on_message)
        .register_team_joins(Duration::from_secs(1), on_team_join)
        .register_channel_joins(Duration::from_secs(1), on_channel_join);

    let engine = Arc::new(
        ConsumerEngine::builder()
            .transport(transport)
            .registry(registry)
            .config(ConsumerConfig {
                start_position: StartPosition::Beginning,
                ..Default::default()
            })
            .build(),
    );
    let handle = engine.start();

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs() as i64;
    let inbound = [
        json!({"event_id": "Ev01", "event_time": now, "event": {"type": "message", "channel_type": "channel", "channel": "C1", "user": "U1", "text": "hello", "ts": "1.0"}}),
        json!({"event_id": "Ev02", "event_time": now, "event": {"type": "message", "channel_type": "im", "channel": "D1", "user": "U2", "text": "psst", "ts": "2.0"}}),
        json!({"event_id": "Ev03", "event_time": now, "event": {"type": "message", "channel_type": "channel", "channel": "C1", "bot_id": "B1", "text": "beep", "ts": "3.0"}}),
        json!({"event_id": "Ev04", "event_time": now, "event": {"type": "team_join", "user": {"id": "U3", "name": "cat"}}}),
        json!({"event_id": "Ev05", "event_time": now, "event": {"type": "member_joined_channel", "user": "U3", "channel": "C1"}}),
        json!({"event_id": "Ev06", "event_time": now, "event": {"type": "reaction_added"}}),
    ];

    for payload in inbound {
        if let Err(err) = ingest(&publisher, payload).await {
            tracing::warn!(error = %err, "event rejected");
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    handle.shutdown();
    handle.join().await;
    Ok(())
}
