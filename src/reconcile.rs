use crate::error::{ApiError, ApiResult};
use crate::types::{is_internal_batch_id, AuthUser, Channel, EmailStatistics, MessageStatus};
use crate::{db, AppState};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub updated: bool,
}

/// Maps a Plivo delivery status onto ours.
pub fn sms_status_from_provider(raw: &str) -> Option<MessageStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "queued" => Some(MessageStatus::Queued),
        "sent" => Some(MessageStatus::Sent),
        "delivered" => Some(MessageStatus::Delivered),
        "failed" | "undelivered" | "rejected" => Some(MessageStatus::Failed),
        _ => None,
    }
}

fn sms_rank(status: MessageStatus) -> Option<u8> {
    match status {
        MessageStatus::Queued => Some(0),
        MessageStatus::Sent => Some(1),
        MessageStatus::Delivered | MessageStatus::Failed => Some(2),
        _ => None,
    }
}

/// Forward-only SMS state machine: queued -> sent -> {delivered, failed}.
pub fn sms_transition(current: MessageStatus, incoming: MessageStatus) -> ApiResult<MessageStatus> {
    let illegal = || {
        ApiError::IllegalTransition(format!(
            "sms status {} cannot move to {}",
            current.as_str(),
            incoming.as_str()
        ))
    };
    if incoming == MessageStatus::Queued {
        return Err(illegal());
    }
    let to = sms_rank(incoming).ok_or_else(illegal)?;
    let from = sms_rank(current).ok_or_else(illegal)?;
    if to <= from {
        return Err(illegal());
    }
    Ok(incoming)
}

pub async fn apply_sms_status(
    state: &AppState,
    correlation_id: &str,
    raw_status: &str,
) -> ApiResult<ReconcileOutcome> {
    let Some(incoming) = sms_status_from_provider(raw_status) else {
        debug!("ignoring sms status {raw_status} for {correlation_id}");
        return Ok(ReconcileOutcome { updated: false });
    };
    let record = db::find_record_by_correlation(&state.pool, state.db_kind, correlation_id)
        .await?
        .filter(|r| r.channel() == Channel::Sms)
        .ok_or_else(|| ApiError::not_found(format!("no sms with id {correlation_id}")))?;

    let next = sms_transition(record.current_status, incoming)?;
    let mark_sent = matches!(next, MessageStatus::Sent | MessageStatus::Delivered);
    let moved = db::transition_record_status(
        &state.pool,
        state.db_kind,
        &record.id,
        record.current_status,
        next,
        mark_sent,
    )
    .await?;
    if !moved {
        return Err(ApiError::IllegalTransition(format!(
            "sms {correlation_id} changed concurrently"
        )));
    }
    db::patch_entry_status_by_correlation(&state.pool, state.db_kind, correlation_id, next).await?;
    info!("sms {correlation_id} -> {next}");
    Ok(ReconcileOutcome { updated: true })
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmailEvent {
    pub event: String,
    pub timestamp: i64,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

impl EmailEvent {
    /// `None` when the timestamp is outside chrono's range.
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}

/// SendGrid appends routing data after a `.` in event message ids.
pub fn normalize_message_id(raw: &str) -> &str {
    raw.split('.').next().unwrap_or(raw)
}

fn stats(flags: [bool; 9]) -> EmailStatistics {
    let [processed, delivered, opened, clicked, soft_bounced, hard_bounced, unsubscribed, failed, spamed] =
        flags;
    EmailStatistics {
        processed,
        delivered,
        opened,
        clicked,
        soft_bounced,
        hard_bounced,
        unsubscribed,
        failed,
        spamed,
    }
}

/// Statistics snapshot and status for a provider event. `None` for events we do
/// not track.
pub fn email_event_effect(event: &str, kind: Option<&str>) -> Option<(EmailStatistics, MessageStatus)> {
    const T: bool = true;
    const F: bool = false;
    let effect = match event {
        "processed" => (stats([T, F, F, F, F, F, F, F, F]), MessageStatus::Processing),
        "delivered" => (stats([T, T, F, F, F, F, F, F, F]), MessageStatus::Delivered),
        "deferred" | "dropped" => (stats([T, F, F, F, F, F, F, T, F]), MessageStatus::Failed),
        "open" => (stats([T, T, T, F, F, F, F, F, F]), MessageStatus::Opened),
        "click" => (stats([T, T, T, T, F, F, F, F, F]), MessageStatus::Clicked),
        "bounce" => match kind {
            Some("blocked") => (stats([T, F, F, F, F, T, F, T, F]), MessageStatus::HardBounced),
            _ => (stats([T, F, F, F, T, F, F, T, F]), MessageStatus::SoftBounced),
        },
        "unsubscribed" => (stats([T, F, F, F, F, F, T, T, F]), MessageStatus::Unsubscribed),
        "spamreport" => (stats([T, T, F, F, F, F, T, F, T]), MessageStatus::SpamReport),
        _ => return None,
    };
    Some(effect)
}

/// Latest event per normalized message id. Ties keep the later position in the
/// delivered batch; events with unusable timestamps are dropped.
pub fn latest_events(mut events: Vec<EmailEvent>) -> Vec<(String, EmailEvent)> {
    events.sort_by_key(|e| e.timestamp);
    let mut latest: HashMap<String, EmailEvent> = HashMap::new();
    for event in events {
        let Some(raw) = event.sg_message_id.as_deref() else {
            continue;
        };
        if event.occurred_at().is_none() {
            continue;
        }
        let id = normalize_message_id(raw).to_string();
        if id.is_empty() {
            continue;
        }
        latest.insert(id, event);
    }
    let mut out: Vec<(String, EmailEvent)> = latest.into_iter().collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmailBatchOutcome {
    pub applied: usize,
    pub ignored: usize,
}

pub async fn apply_email_events(state: &AppState, events: Vec<EmailEvent>) -> ApiResult<EmailBatchOutcome> {
    let mut outcome = EmailBatchOutcome::default();
    for (correlation_id, event) in latest_events(events) {
        match apply_email_event(state, &correlation_id, &event).await {
            Ok(ReconcileOutcome { updated: true }) => outcome.applied += 1,
            Ok(_) => outcome.ignored += 1,
            Err(ApiError::NotFound(_)) | Err(ApiError::IllegalTransition(_)) => {
                debug!("email event {} for {correlation_id} ignored", event.event);
                outcome.ignored += 1;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(outcome)
}

pub async fn apply_email_event(
    state: &AppState,
    correlation_id: &str,
    event: &EmailEvent,
) -> ApiResult<ReconcileOutcome> {
    let Some((statistics, status)) = email_event_effect(&event.event, event.kind.as_deref()) else {
        return Ok(ReconcileOutcome { updated: false });
    };
    let Some(occurred_at) = event.occurred_at() else {
        warn!("email event {} for {correlation_id} has bad timestamp {}", event.event, event.timestamp);
        return Ok(ReconcileOutcome { updated: false });
    };
    let record = db::find_record_by_correlation(&state.pool, state.db_kind, correlation_id)
        .await?
        .filter(|r| r.channel() == Channel::Email)
        .ok_or_else(|| ApiError::not_found(format!("no email with id {correlation_id}")))?;

    if record.last_event_at.is_some_and(|last| last > occurred_at) {
        return Err(ApiError::IllegalTransition(format!(
            "email {correlation_id} already has a newer event"
        )));
    }
    let applied = db::apply_email_event(
        &state.pool,
        state.db_kind,
        &record.id,
        statistics,
        status,
        statistics.delivered,
        occurred_at,
    )
    .await?;
    if !applied {
        return Err(ApiError::IllegalTransition(format!(
            "email {correlation_id} not updatable"
        )));
    }
    db::patch_entry_status_by_correlation(&state.pool, state.db_kind, correlation_id, status).await?;
    info!("email {correlation_id} -> {status}");
    Ok(ReconcileOutcome { updated: true })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub canceled: u64,
}

/// Cancels every record of a batch and the thread entries mirroring them.
/// Provider batches (no internal prefix) are canceled at SendGrid first.
pub async fn cancel_batch(
    state: &AppState,
    channel: Channel,
    batch_id: &str,
    actor: &AuthUser,
) -> ApiResult<CancelOutcome> {
    let batch_id = batch_id.trim();
    if batch_id.is_empty() {
        return Err(ApiError::validation("batch_id is required"));
    }
    let internal = is_internal_batch_id(batch_id);
    if channel == Channel::Sms && !internal {
        return Err(ApiError::validation("unknown sms batch id"));
    }

    let records: Vec<_> = db::list_records_by_batch(&state.pool, state.db_kind, batch_id)
        .await?
        .into_iter()
        .filter(|r| r.channel() == channel)
        .collect();
    if records.is_empty() {
        return Err(ApiError::not_found(format!("no scheduled messages in batch {batch_id}")));
    }
    if records.iter().any(|r| r.organization_id != actor.organization_id) {
        return Err(ApiError::Authorization(
            "batch belongs to another organization".to_string(),
        ));
    }

    if !internal {
        state
            .email
            .cancel_batch(batch_id)
            .await
            .map_err(|err| ApiError::ProviderTransport(format!("{err:#}")))?;
    }

    let canceled = db::cancel_records_by_batch(&state.pool, state.db_kind, batch_id, &actor.id).await?;
    let entries = db::cancel_entries_by_batch(&state.pool, state.db_kind, batch_id, &actor.id).await?;
    if canceled == 0 {
        warn!("batch {batch_id} had no records left to cancel");
    }
    info!("batch {batch_id} canceled by {}: {canceled} records, {entries} entries", actor.id);
    Ok(CancelOutcome { canceled })
}
