use crate::channels::{EmailMessage, SmsMessage};
use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::types::{
    new_internal_batch_id, AuthUser, Channel, Contact, ContentPart, EmailAddress,
    EmailAttachment, EmailPayload, MessagePayload, MessageRecord, MessageStatus, SmsPayload,
};
use crate::{db, outbox, thread, AppState};
use chrono::{DateTime, Duration, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{error, info, warn};

pub const SMS_OPT_OUT_FOOTER: &str =
    "\nTo stop receiving messages, reply with STOP. To restart SMS service, reply with START.";
pub const SMS_MAX_CHARS: usize = 1600;

pub(crate) const PATH_SEGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'/').add(b'?').add(b'#').add(b'%');

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
    })
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("valid phone regex"))
}

pub fn validate_email_address(address: &str) -> bool {
    email_regex().is_match(address)
}

/// E.164 with the leading `+`.
pub fn validate_phone_number(number: &str) -> bool {
    phone_regex().is_match(number)
}

pub fn validate_sms_text(text: &str) -> ApiResult<()> {
    if text.trim().is_empty() {
        return Err(ApiError::validation("text is required"));
    }
    if text.chars().count() > SMS_MAX_CHARS {
        return Err(ApiError::validation(format!(
            "text exceeds {SMS_MAX_CHARS} characters"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendEmailRequest {
    pub to: EmailAddress,
    pub from: EmailAddress,
    pub subject: String,
    pub content: Vec<ContentPart>,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
    #[serde(default)]
    pub send_at: Option<DateTime<Utc>>,
}

impl SendEmailRequest {
    pub fn validate(&self) -> ApiResult<()> {
        if !validate_email_address(&self.to.email) {
            return Err(ApiError::validation("invalid recipient email address"));
        }
        if !validate_email_address(&self.from.email) {
            return Err(ApiError::validation("invalid sender email address"));
        }
        if self.subject.trim().is_empty() {
            return Err(ApiError::validation("subject is required"));
        }
        if self.content.is_empty() {
            return Err(ApiError::validation("content is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendSmsRequest {
    pub src: String,
    pub dst: String,
    pub text: String,
    #[serde(default)]
    pub send_at: Option<DateTime<Utc>>,
}

impl SendSmsRequest {
    pub fn validate(&self) -> ApiResult<()> {
        if !validate_phone_number(&self.src) {
            return Err(ApiError::validation("invalid sender phone number"));
        }
        if !validate_phone_number(&self.dst) {
            return Err(ApiError::validation("invalid recipient phone number"));
        }
        validate_sms_text(&self.text)
    }
}

pub async fn send_email(
    state: &AppState,
    user: &AuthUser,
    req: SendEmailRequest,
) -> ApiResult<MessageRecord> {
    req.validate()?;
    let contact = db::find_contact_by_address(
        &state.pool,
        state.db_kind,
        &user.organization_id,
        Channel::Email,
        &req.to.email,
    )
    .await?
    .ok_or_else(|| ApiError::not_found("no contact with this email address"))?;
    if contact.dnd_email {
        return Err(ApiError::RecipientOptedOut(
            "contact has unsubscribed from email".to_string(),
        ));
    }

    let payload = MessagePayload::Email(EmailPayload {
        to: req.to,
        from: req.from,
        subject: req.subject,
        content: req.content,
        attachments: req.attachments,
    });
    let record = MessageRecord::outbound(
        &user.organization_id,
        &contact.id,
        user.snapshot(),
        contact.snapshot(),
        payload,
        req.send_at,
    );
    dispatch_record(state, record, &contact).await
}

pub async fn send_sms(
    state: &AppState,
    user: &AuthUser,
    req: SendSmsRequest,
) -> ApiResult<MessageRecord> {
    req.validate()?;
    let contact = db::find_contact_by_address(
        &state.pool,
        state.db_kind,
        &user.organization_id,
        Channel::Sms,
        &req.dst,
    )
    .await?
    .ok_or_else(|| ApiError::not_found("no contact with this phone number"))?;
    if contact.dnd_sms {
        return Err(ApiError::RecipientOptedOut(
            "contact has opted out of SMS".to_string(),
        ));
    }

    let payload = MessagePayload::Sms(SmsPayload {
        src: req.src,
        dst: req.dst,
        text: req.text,
    });
    let record = MessageRecord::outbound(
        &user.organization_id,
        &contact.id,
        user.snapshot(),
        contact.snapshot(),
        payload,
        req.send_at,
    );
    dispatch_record(state, record, &contact).await
}

pub fn unsubscribe_url(public_url: &str, contact_id: &str) -> String {
    format!(
        "{}/api/email-sms/unsubscribe-email/{}",
        public_url.trim_end_matches('/'),
        utf8_percent_encode(contact_id, PATH_SEGMENT)
    )
}

pub fn append_unsubscribe_link(email: &mut EmailPayload, public_url: &str, contact_id: &str) {
    let html = format!(
        "<p><br>Click <a href=\"{}\">here</a> to unsubscribe</p>",
        unsubscribe_url(public_url, contact_id)
    );
    match email.content.first_mut() {
        Some(part) => part.value.push_str(&html),
        None => email.content.push(ContentPart {
            mime_type: "text/html".to_string(),
            value: html,
        }),
    }
}

pub fn status_callback_url(config: &Config) -> String {
    format!(
        "{}{}",
        config.server.public_url.trim_end_matches('/'),
        config.plivo.status_callback_path
    )
}

/// Sends `record` now, or records it as scheduled when `send_at` is in the future.
/// The record is persisted before any provider call.
pub async fn dispatch_record(
    state: &AppState,
    mut record: MessageRecord,
    contact: &Contact,
) -> ApiResult<MessageRecord> {
    match &mut record.payload {
        MessagePayload::Email(email) => {
            append_unsubscribe_link(email, &state.config.server.public_url, &contact.id);
        }
        MessagePayload::Sms(sms) => {
            if !db::sms_destination_seen(&state.pool, state.db_kind, &sms.dst).await? {
                sms.text.push_str(SMS_OPT_OUT_FOOTER);
            }
        }
    }

    let due = record.send_at.map_or(true, |at| at <= Utc::now());
    if due {
        send_now(state, record, contact).await
    } else {
        schedule(state, record, contact).await
    }
}

fn sent_status(channel: Channel) -> MessageStatus {
    match channel {
        Channel::Email => MessageStatus::Sent,
        Channel::Sms => MessageStatus::Queued,
    }
}

async fn transmit(state: &AppState, record: &MessageRecord) -> anyhow::Result<String> {
    match &record.payload {
        MessagePayload::Email(email) => state.email.send(&EmailMessage::from_payload(email)).await,
        MessagePayload::Sms(sms) => {
            let callback = status_callback_url(&state.config);
            state.sms.send(&SmsMessage::from_payload(sms, Some(callback))).await
        }
    }
}

async fn send_now(
    state: &AppState,
    mut record: MessageRecord,
    contact: &Contact,
) -> ApiResult<MessageRecord> {
    let channel = record.channel();
    record.is_scheduled = false;
    if record.send_at.is_none() {
        record.send_at = Some(Utc::now());
    }
    record.current_status = match channel {
        Channel::Email => MessageStatus::Processing,
        Channel::Sms => MessageStatus::Queued,
    };
    db::insert_record(&state.pool, state.db_kind, &record).await?;

    match transmit(state, &record).await {
        Ok(correlation_id) => {
            let status = sent_status(channel);
            db::mark_record_dispatched(&state.pool, state.db_kind, &record.id, &correlation_id, status)
                .await?;
            info!("{channel} {} dispatched as {correlation_id}", record.id);
            record.correlation_id = Some(correlation_id);
            record.is_tried = true;
            record.current_status = status;
        }
        Err(err) => {
            db::mark_record_failed(&state.pool, state.db_kind, &record.id).await?;
            warn!("{channel} {} transport failed: {err:#}", record.id);
            return Err(ApiError::ProviderTransport(format!("{err:#}")));
        }
    }

    let thread_id = mirror_into_thread(state, &record, contact).await;
    if let Err(err) = outbox::publish(state, &record, thread_id.as_deref()).await {
        error!("notification for {} not queued: {err:?}", record.id);
    }
    Ok(record)
}

fn natively_schedulable(config: &Config, record: &MessageRecord) -> bool {
    let Some(send_at) = record.send_at else {
        return false;
    };
    config.sendgrid.native_scheduling
        && record.channel() == Channel::Email
        && record.batch_id.is_none()
        && send_at - Utc::now() <= Duration::hours(config.sendgrid.native_schedule_window_hours)
}

async fn schedule(
    state: &AppState,
    mut record: MessageRecord,
    contact: &Contact,
) -> ApiResult<MessageRecord> {
    record.is_scheduled = true;
    record.current_status = match record.channel() {
        Channel::Email => MessageStatus::Scheduled,
        Channel::Sms => MessageStatus::Queued,
    };

    if natively_schedulable(&state.config, &record) {
        let batch_id = state
            .email
            .create_batch()
            .await
            .map_err(|err| ApiError::ProviderTransport(format!("{err:#}")))?;
        record.batch_id = Some(batch_id.clone());
        db::insert_record(&state.pool, state.db_kind, &record).await?;

        let MessagePayload::Email(email) = &record.payload else {
            return Err(ApiError::Internal(anyhow::anyhow!("native scheduling needs email")));
        };
        let mut message = EmailMessage::from_payload(email);
        message.send_at = record.send_at;
        message.batch_id = Some(batch_id);
        match state.email.send(&message).await {
            Ok(correlation_id) => {
                db::mark_record_dispatched(
                    &state.pool,
                    state.db_kind,
                    &record.id,
                    &correlation_id,
                    MessageStatus::Scheduled,
                )
                .await?;
                record.correlation_id = Some(correlation_id);
                record.is_tried = true;
            }
            Err(err) => {
                db::mark_record_failed(&state.pool, state.db_kind, &record.id).await?;
                return Err(ApiError::ProviderTransport(format!("{err:#}")));
            }
        }
    } else {
        if record.batch_id.is_none() {
            record.batch_id = Some(new_internal_batch_id());
        }
        db::insert_record(&state.pool, state.db_kind, &record).await?;
    }

    info!(
        "{} {} scheduled for {:?} in batch {:?}",
        record.channel(),
        record.id,
        record.send_at,
        record.batch_id
    );
    mirror_into_thread(state, &record, contact).await;
    Ok(record)
}

/// Thread bookkeeping never fails a send that already reached the provider.
async fn mirror_into_thread(state: &AppState, record: &MessageRecord, contact: &Contact) -> Option<String> {
    match thread::append_to_existing(
        &state.pool,
        state.db_kind,
        &record.organization_id,
        &contact.id,
        record,
    )
    .await
    {
        Ok(conversation) => conversation.map(|c| c.id),
        Err(err) => {
            error!("thread append for {} failed: {err:?}", record.id);
            None
        }
    }
}

pub const OPT_OUT_ACTOR: &str = "recipient_opt_out";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DueOutcome {
    pub attempted: usize,
    pub sent: Vec<String>,
    pub failed: Vec<String>,
    pub opted_out: Vec<String>,
}

/// The contact may have opted out (or been removed) since the record was scheduled.
async fn still_reachable(state: &AppState, record: &MessageRecord) -> ApiResult<bool> {
    let Some(contact_id) = record.contact_id.as_deref() else {
        return Ok(true);
    };
    let contact = db::get_contact(&state.pool, state.db_kind, contact_id).await?;
    Ok(contact.is_some_and(|c| !c.is_deleted && !c.opted_out(record.channel())))
}

/// Sends the organization's locally scheduled records whose time has come. Each
/// record is claimed first, so overlapping pollers never send twice.
pub async fn dispatch_due(
    state: &AppState,
    organization_id: &str,
    now: DateTime<Utc>,
    limit: i64,
) -> ApiResult<DueOutcome> {
    let mut outcome = DueOutcome::default();
    let records = db::list_due_records(&state.pool, state.db_kind, organization_id, now, limit).await?;
    for mut record in records {
        if !db::claim_record(&state.pool, state.db_kind, &record.id).await? {
            continue;
        }
        outcome.attempted += 1;
        if !still_reachable(state, &record).await? {
            warn!("scheduled {} withdrawn: recipient opted out", record.id);
            db::cancel_record(&state.pool, state.db_kind, &record.id, OPT_OUT_ACTOR).await?;
            db::cancel_entries_by_message(&state.pool, state.db_kind, &record.id, OPT_OUT_ACTOR).await?;
            outcome.opted_out.push(record.id);
            continue;
        }
        match transmit(state, &record).await {
            Ok(correlation_id) => {
                let status = sent_status(record.channel());
                db::mark_record_dispatched(&state.pool, state.db_kind, &record.id, &correlation_id, status)
                    .await?;
                db::patch_entry_dispatch(
                    &state.pool,
                    state.db_kind,
                    &record.id,
                    Some(&correlation_id),
                    status,
                )
                .await?;
                record.correlation_id = Some(correlation_id);
                record.is_tried = true;
                record.current_status = status;

                let thread_id = match record.contact_id.as_deref() {
                    Some(contact_id) => db::find_conversation(
                        &state.pool,
                        state.db_kind,
                        &record.organization_id,
                        contact_id,
                    )
                    .await?
                    .map(|c| c.id),
                    None => None,
                };
                if let Err(err) = outbox::publish(state, &record, thread_id.as_deref()).await {
                    error!("notification for {} not queued: {err:?}", record.id);
                }
                outcome.sent.push(record.id);
            }
            Err(err) => {
                warn!("scheduled {} failed: {err:#}", record.id);
                db::mark_record_failed(&state.pool, state.db_kind, &record.id).await?;
                db::patch_entry_dispatch(
                    &state.pool,
                    state.db_kind,
                    &record.id,
                    None,
                    MessageStatus::Failed,
                )
                .await?;
                outcome.failed.push(record.id);
            }
        }
    }
    Ok(outcome)
}
