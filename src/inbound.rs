use crate::channels::plivo::normalize_number;
use crate::channels::sendgrid::observer_notification;
use crate::error::{ApiError, ApiResult};
use crate::types::{
    Channel, Contact, ContentPart, EmailAddress, EmailAttachment, EmailPayload, MessagePayload,
    MessageRecord, MessageStatus, SmsPayload,
};
use crate::{db, outbox, thread, AppState};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{error, info};

/// Fields of a SendGrid inbound-parse post that correlation needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundEmail {
    pub headers: String,
    pub subject: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<EmailAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundSms {
    pub from: String,
    pub to: String,
    pub text: String,
    pub message_uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationOutcome {
    pub thread_id: String,
    pub record_id: String,
    pub created_thread: bool,
}

fn header_regex(name: &str) -> Regex {
    Regex::new(&format!(r"(?im)^{name}:\s*<([^>]*)>")).expect("valid header regex")
}

/// Provider message id referenced by a reply: `References` first, then
/// `In-Reply-To`, keeping only the part before `@`.
pub fn referenced_message_id(headers: &str) -> Option<String> {
    static REFERENCES: OnceLock<Regex> = OnceLock::new();
    static IN_REPLY_TO: OnceLock<Regex> = OnceLock::new();
    let references = REFERENCES.get_or_init(|| header_regex("references"));
    let in_reply_to = IN_REPLY_TO.get_or_init(|| header_regex("in-reply-to"));

    let raw = references
        .captures(headers)
        .or_else(|| in_reply_to.captures(headers))?
        .get(1)?
        .as_str();
    let id = raw.split('@').next().unwrap_or(raw).trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Mirror of `prior` travelling the other way.
fn reply_record(prior: &MessageRecord, payload: MessagePayload, correlation_id: Option<String>) -> MessageRecord {
    let now = Utc::now();
    MessageRecord {
        id: uuid::Uuid::new_v4().to_string(),
        organization_id: prior.organization_id.clone(),
        contact_id: prior.contact_id.clone(),
        inbound: true,
        batch_id: None,
        correlation_id,
        sender: prior.recipient.clone(),
        recipient: prior.sender.clone(),
        payload,
        send_at: None,
        received_at: Some(now),
        is_scheduled: false,
        canceled_schedule: false,
        canceled_by: None,
        is_tried: true,
        is_sent: false,
        current_status: MessageStatus::Received,
        statistics: None,
        last_event_at: None,
        created_at: now,
        updated_at: now,
    }
}

async fn contact_for(state: &AppState, prior: &MessageRecord) -> ApiResult<Contact> {
    let contact_id = prior
        .contact_id
        .as_deref()
        .ok_or_else(|| ApiError::not_found("prior message has no contact"))?;
    db::get_contact(&state.pool, state.db_kind, contact_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("contact {contact_id} not found")))
}

pub async fn correlate_email(state: &AppState, inbound: InboundEmail) -> ApiResult<CorrelationOutcome> {
    let reference = referenced_message_id(&inbound.headers)
        .ok_or_else(|| ApiError::not_found("reply carries no message reference"))?;
    let prior = db::find_record_by_correlation(&state.pool, state.db_kind, &reference)
        .await?
        .filter(|r| !r.inbound)
        .ok_or_else(|| ApiError::not_found(format!("no outbound email {reference}")))?;
    let MessagePayload::Email(prior_email) = &prior.payload else {
        return Err(ApiError::not_found(format!("{reference} is not an email")));
    };
    let contact = contact_for(state, &prior).await?;

    let content = match (inbound.html, inbound.text) {
        (Some(html), _) if !html.trim().is_empty() => ContentPart {
            mime_type: "text/html".to_string(),
            value: html,
        },
        (_, text) => ContentPart {
            mime_type: "text/plain".to_string(),
            value: text.unwrap_or_default(),
        },
    };
    let payload = MessagePayload::Email(EmailPayload {
        to: prior_email.from.clone(),
        from: prior_email.to.clone(),
        subject: inbound
            .subject
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("Re: {}", prior_email.subject)),
        content: vec![content],
        attachments: inbound.attachments,
    });
    let record = reply_record(&prior, payload, None);
    let seeds = vec![prior.clone()];
    finish(state, &prior, &seeds, record, contact).await
}

pub async fn correlate_sms(state: &AppState, inbound: InboundSms) -> ApiResult<CorrelationOutcome> {
    let from = normalize_number(&inbound.from);
    let to = normalize_number(&inbound.to);

    if let Some(uuid) = inbound.message_uuid.as_deref() {
        if let Some(existing) = db::find_record_by_correlation(&state.pool, state.db_kind, uuid).await? {
            let thread = db::find_conversation(
                &state.pool,
                state.db_kind,
                &existing.organization_id,
                existing.contact_id.as_deref().unwrap_or_default(),
            )
            .await?;
            return Ok(CorrelationOutcome {
                thread_id: thread.map(|t| t.id).unwrap_or_default(),
                record_id: existing.id,
                created_thread: false,
            });
        }
    }

    let mut priors = db::find_prior_sms(&state.pool, state.db_kind, &to, &from, Utc::now()).await?;
    if priors.is_empty() {
        return Err(ApiError::not_found(format!("no sms sent from {to} to {from}")));
    }
    priors.reverse();
    let Some(latest) = priors.last().cloned() else {
        return Err(ApiError::not_found("no prior sms"));
    };
    let contact = contact_for(state, &latest).await?;

    let payload = MessagePayload::Sms(SmsPayload {
        src: from,
        dst: to,
        text: inbound.text,
    });
    let record = reply_record(&latest, payload, inbound.message_uuid);
    finish(state, &latest, &priors, record, contact).await
}

async fn finish(
    state: &AppState,
    prior: &MessageRecord,
    seeds: &[MessageRecord],
    record: MessageRecord,
    contact: Contact,
) -> ApiResult<CorrelationOutcome> {
    db::insert_record(&state.pool, state.db_kind, &record).await?;
    let merged = thread::merge(
        &state.pool,
        state.db_kind,
        &prior.organization_id,
        &contact,
        seeds,
        &record,
    )
    .await?;
    info!(
        "inbound {} {} joined thread {} (new: {})",
        record.channel(),
        record.id,
        merged.conversation.id,
        merged.created
    );

    if merged.created {
        if let Some(correlation_id) = prior.correlation_id.clone() {
            let reply = reply_text(&record);
            tokio::spawn(notify_observers(state.clone(), correlation_id, contact, reply));
        }
    }

    if let Err(err) = outbox::publish(state, &record, Some(&merged.conversation.id)).await {
        error!("notification for {} not queued: {err:?}", record.id);
    }

    Ok(CorrelationOutcome {
        thread_id: merged.conversation.id,
        record_id: record.id,
        created_thread: merged.created,
    })
}

fn reply_text(record: &MessageRecord) -> String {
    match &record.payload {
        MessagePayload::Email(email) => email
            .content
            .first()
            .map(|part| part.value.clone())
            .unwrap_or_default(),
        MessagePayload::Sms(sms) => sms.text.clone(),
    }
}

/// Mails workflow observers of the original message. Failures are only logged.
async fn notify_observers(state: AppState, correlation_id: String, contact: Contact, reply: String) {
    let observers =
        match db::find_workflow_observers(&state.pool, state.db_kind, &correlation_id).await {
            Ok(observers) if !observers.is_empty() => observers,
            Ok(_) => return,
            Err(err) => {
                error!("observer lookup for {correlation_id} failed: {err:?}");
                return;
            }
        };

    let name = contact.first_name.clone().unwrap_or_else(|| "Contact".to_string());
    let address = contact
        .address(Channel::Email)
        .or_else(|| contact.address(Channel::Sms))
        .unwrap_or_default()
        .to_string();
    let from = EmailAddress {
        email: state.config.observers.from_email.clone(),
        name: Some(state.config.observers.from_name.clone()),
    };
    let message = observer_notification(from, &observers, &name, &address, &reply);
    match state.email.send(&message).await {
        Ok(id) => info!("observers of {correlation_id} notified ({id})"),
        Err(err) => error!("observer notification for {correlation_id} failed: {err:#}"),
    }
}
