use crate::config::QueueConfig;
use crate::db::{
    self, claim_outbox_batch, mark_outbox_delivered, mark_outbox_failed, DbKind, OutboxRecord,
};
use crate::types::{MessagePayload, MessageRecord};
use crate::AppState;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use sqlx::AnyPool;
use tokio::time::sleep;
use tracing::{debug, warn};

const OUTBOX_POLL_SECONDS: u64 = 2;
const OUTBOX_BATCH: i64 = 25;
const OUTBOX_MAX_RETRIES: i32 = 10;

pub fn compute_backoff(retry_count: i32) -> Duration {
    let exponent = (retry_count.max(1) - 1).min(8) as u32;
    let base = 2_i64.pow(exponent);
    Duration::seconds((base * 5).min(300))
}

/// Cross-service notification for a message entering a conversation.
pub fn notification_payload(record: &MessageRecord, thread_id: Option<&str>) -> Value {
    let (from, to, subject, content) = match &record.payload {
        MessagePayload::Email(email) => (
            json!(email.from),
            json!(email.to),
            Some(email.subject.clone()),
            json!(email.content),
        ),
        MessagePayload::Sms(sms) => (json!(sms.src), json!(sms.dst), None, json!(sms.text)),
    };
    json!({
        "organization_id": record.organization_id,
        "message_id": record.id,
        "channel": record.channel(),
        "inbound": record.inbound,
        "thread_id": thread_id,
        "from": from,
        "to": to,
        "subject": subject,
        "content": content,
        "status": record.current_status,
        "sent_at": record.send_at,
        "received_at": record.received_at,
    })
}

/// Queues a notification for the outbox worker. A no-op when no queue is configured.
pub async fn publish(state: &AppState, record: &MessageRecord, thread_id: Option<&str>) -> anyhow::Result<()> {
    if state.config.queue.publish_url.is_none() {
        debug!("queue not configured; dropping notification for {}", record.id);
        return Ok(());
    }
    let event = if record.inbound { "message.received" } else { "message.sent" };
    let payload = json!({
        "event": event,
        "data": notification_payload(record, thread_id),
    });
    db::insert_outbox(
        &state.pool,
        state.db_kind,
        &state.config.queue.topic,
        payload,
        Utc::now(),
    )
    .await?;
    Ok(())
}

pub async fn start_outbox_worker(pool: AnyPool, queue: QueueConfig, db_kind: DbKind, client: Client) {
    if queue.publish_url.is_none() {
        return;
    }

    loop {
        let now = Utc::now();
        if let Ok(batch) = claim_outbox_batch(&pool, db_kind, now, OUTBOX_BATCH).await {
            for row in batch {
                if let Err(err) = dispatch_row(&client, &queue, &pool, db_kind, &row).await {
                    let retry = row.retry_count + 1;
                    warn!("notification {} failed (attempt {retry}): {err:#}", row.id);
                    let next = if retry >= OUTBOX_MAX_RETRIES {
                        now + Duration::seconds(3600)
                    } else {
                        Utc::now() + compute_backoff(retry)
                    };
                    let _ = mark_outbox_failed(&pool, db_kind, &row.id, retry, next, &err.to_string()).await;
                }
            }
        }
        sleep(std::time::Duration::from_secs(OUTBOX_POLL_SECONDS)).await;
    }
}

async fn dispatch_row(
    client: &Client,
    queue: &QueueConfig,
    pool: &AnyPool,
    db_kind: DbKind,
    row: &OutboxRecord,
) -> anyhow::Result<()> {
    let url = queue
        .publish_url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("queue publish_url missing"))?;
    let mut req = client.post(url).json(&json!({
        "topic": row.topic,
        "payload": row.payload,
    }));
    if let Some(token) = queue.api_token.as_ref() {
        req = req.bearer_auth(token);
    }

    let resp = req.send().await?;
    if resp.status().is_success() {
        mark_outbox_delivered(pool, db_kind, &row.id).await?;
        return Ok(());
    }

    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow::anyhow!("queue publish failed: {} {}", status, body))
}
