//! Expansion of one template and a recipient list into per-contact message records.
//!
//! Drip waves are computed from the start instant each time (`start + k * step`),
//! so month steps clamp to the end of shorter months without drifting.

use crate::dispatch::{self, validate_email_address, validate_phone_number};
use crate::error::{ApiError, ApiResult};
use crate::types::{
    new_internal_batch_id, AuthUser, Channel, Contact, ContentPart, EmailAddress,
    EmailAttachment, EmailPayload, MessagePayload, MessageRecord, SmsPayload,
};
use crate::{db, AppState};
use chrono::{DateTime, Days, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatUnit {
    Hours,
    Days,
    Months,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DripPolicy {
    pub start_date_time: DateTime<Utc>,
    pub end_date_time: DateTime<Utc>,
    pub batch_quantity: usize,
    pub repeat_after_type: RepeatUnit,
    pub repeat_after_value: u32,
}

/// Calendar-aware `start + steps * unit`. `None` on overflow.
pub fn advance(start: DateTime<Utc>, unit: RepeatUnit, steps: u32) -> Option<DateTime<Utc>> {
    match unit {
        RepeatUnit::Hours => start.checked_add_signed(Duration::hours(i64::from(steps))),
        RepeatUnit::Days => start.checked_add_days(Days::new(u64::from(steps))),
        RepeatUnit::Months => start.checked_add_months(Months::new(steps)),
    }
}

impl DripPolicy {
    pub fn validate(&self) -> ApiResult<()> {
        if self.batch_quantity == 0 {
            return Err(ApiError::validation("batch_quantity must be greater than zero"));
        }
        if self.repeat_after_value == 0 {
            return Err(ApiError::validation("repeat_after_value must be greater than zero"));
        }
        if self.end_date_time < self.start_date_time {
            return Err(ApiError::validation("end_date_time precedes start_date_time"));
        }
        Ok(())
    }

    pub fn wave_time(&self, index: usize) -> Option<DateTime<Utc>> {
        let steps = u32::try_from(index).ok()?.checked_mul(self.repeat_after_value)?;
        advance(self.start_date_time, self.repeat_after_type, steps)
    }

    pub fn waves<'a, T>(&'a self, recipients: &'a [T]) -> Waves<'a, T> {
        Waves {
            policy: self,
            remaining: recipients,
            index: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wave<'a, T> {
    pub index: usize,
    pub send_at: DateTime<Utc>,
    pub recipients: &'a [T],
}

/// Lazy wave iterator. Stops when recipients run out or the next wave would fall
/// after `end_date_time`; whatever is left stays in [`Waves::remaining`].
#[derive(Debug)]
pub struct Waves<'a, T> {
    policy: &'a DripPolicy,
    remaining: &'a [T],
    index: usize,
}

impl<'a, T> Waves<'a, T> {
    pub fn remaining(&self) -> &'a [T] {
        self.remaining
    }
}

impl<'a, T> Iterator for Waves<'a, T> {
    type Item = Wave<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        let take = self.policy.batch_quantity.min(self.remaining.len());
        if take == 0 {
            return None;
        }
        let send_at = self.policy.wave_time(self.index)?;
        if send_at > self.policy.end_date_time {
            return None;
        }
        let (head, tail) = self.remaining.split_at(take);
        self.remaining = tail;
        let wave = Wave {
            index: self.index,
            send_at,
            recipients: head,
        };
        self.index += 1;
        Some(wave)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    AllAtOnce,
    AtScheduleTime,
    Drip,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryMode {
    AllAtOnce,
    AtScheduleTime(DateTime<Utc>),
    Drip(DripPolicy),
}

impl DeliveryMode {
    pub fn from_request(
        operation: OperationType,
        scheduled_date_time: Option<DateTime<Utc>>,
        batch_schedule: Option<DripPolicy>,
    ) -> ApiResult<Self> {
        match operation {
            OperationType::AllAtOnce => Ok(DeliveryMode::AllAtOnce),
            OperationType::AtScheduleTime => scheduled_date_time
                .map(DeliveryMode::AtScheduleTime)
                .ok_or_else(|| ApiError::validation("scheduled_date_time is required")),
            OperationType::Drip => {
                let policy = batch_schedule
                    .ok_or_else(|| ApiError::validation("batch_schedule is required for drip mode"))?;
                policy.validate()?;
                Ok(DeliveryMode::Drip(policy))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageTemplate {
    Email {
        from: EmailAddress,
        subject: String,
        content: Vec<ContentPart>,
        attachments: Vec<EmailAttachment>,
    },
    Sms {
        src: String,
        text: String,
    },
}

impl MessageTemplate {
    pub fn channel(&self) -> Channel {
        match self {
            MessageTemplate::Email { .. } => Channel::Email,
            MessageTemplate::Sms { .. } => Channel::Sms,
        }
    }

    pub fn validate(&self) -> ApiResult<()> {
        match self {
            MessageTemplate::Email { from, subject, content, .. } => {
                if !validate_email_address(&from.email) {
                    return Err(ApiError::validation("invalid sender email address"));
                }
                if subject.trim().is_empty() {
                    return Err(ApiError::validation("subject is required"));
                }
                if content.is_empty() {
                    return Err(ApiError::validation("content is required"));
                }
            }
            MessageTemplate::Sms { src, text } => {
                if !validate_phone_number(src) {
                    return Err(ApiError::validation("invalid sender phone number"));
                }
                dispatch::validate_sms_text(text)?;
            }
        }
        Ok(())
    }

    fn render(&self, contact: &Contact, address: &str) -> MessagePayload {
        match self {
            MessageTemplate::Email {
                from,
                subject,
                content,
                attachments,
            } => MessagePayload::Email(EmailPayload {
                to: EmailAddress {
                    email: address.to_string(),
                    name: contact.first_name.clone(),
                },
                from: from.clone(),
                subject: subject.clone(),
                content: content.clone(),
                attachments: attachments.clone(),
            }),
            MessageTemplate::Sms { src, text } => MessagePayload::Sms(SmsPayload {
                src: src.clone(),
                dst: address.to_string(),
                text: text.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRecipient {
    pub contact_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkOutcome {
    pub batch_id: String,
    pub waves: usize,
    pub succeeded: Vec<String>,
    pub skipped: Vec<SkippedRecipient>,
}

/// Creates one record per recipient under a shared batch id. Recipients that
/// cannot be messaged are reported in `skipped`; they never abort the run.
pub async fn expand(
    state: &AppState,
    user: &AuthUser,
    recipients: &[String],
    template: &MessageTemplate,
    mode: &DeliveryMode,
) -> ApiResult<BulkOutcome> {
    if recipients.is_empty() {
        return Err(ApiError::validation("at least one recipient is required"));
    }
    template.validate()?;

    let mut outcome = BulkOutcome {
        batch_id: new_internal_batch_id(),
        waves: 0,
        succeeded: Vec::new(),
        skipped: Vec::new(),
    };

    match mode {
        DeliveryMode::AllAtOnce => {
            outcome.waves = 1;
            for contact_id in recipients {
                deliver(state, user, template, contact_id, Utc::now(), &mut outcome).await;
            }
        }
        DeliveryMode::AtScheduleTime(send_at) => {
            outcome.waves = 1;
            for contact_id in recipients {
                deliver(state, user, template, contact_id, *send_at, &mut outcome).await;
            }
        }
        DeliveryMode::Drip(policy) => {
            policy.validate()?;
            let mut waves = policy.waves(recipients);
            for wave in waves.by_ref() {
                outcome.waves += 1;
                for contact_id in wave.recipients {
                    deliver(state, user, template, contact_id, wave.send_at, &mut outcome).await;
                }
            }
            for contact_id in waves.remaining() {
                skip(&mut outcome, contact_id, "outside_schedule_window");
            }
        }
    }

    info!(
        "batch {} expanded: {} waves, {} records, {} skipped",
        outcome.batch_id,
        outcome.waves,
        outcome.succeeded.len(),
        outcome.skipped.len()
    );
    Ok(outcome)
}

fn skip(outcome: &mut BulkOutcome, contact_id: &str, reason: &str) {
    warn!("batch {} skipped contact {contact_id}: {reason}", outcome.batch_id);
    outcome.skipped.push(SkippedRecipient {
        contact_id: contact_id.to_string(),
        reason: reason.to_string(),
    });
}

async fn deliver(
    state: &AppState,
    user: &AuthUser,
    template: &MessageTemplate,
    contact_id: &str,
    send_at: DateTime<Utc>,
    outcome: &mut BulkOutcome,
) {
    let channel = template.channel();
    let contact = match db::get_contact(&state.pool, state.db_kind, contact_id).await {
        Ok(Some(contact)) if !contact.is_deleted => contact,
        Ok(_) => return skip(outcome, contact_id, "contact_not_found"),
        Err(err) => {
            error!("contact lookup {contact_id} failed: {err:?}");
            return skip(outcome, contact_id, "lookup_failed");
        }
    };
    if contact.organization_id != user.organization_id {
        return skip(outcome, contact_id, "foreign_organization");
    }
    let Some(address) = contact.address(channel) else {
        return skip(outcome, contact_id, "missing_address");
    };
    let address_ok = match channel {
        Channel::Email => validate_email_address(address),
        Channel::Sms => validate_phone_number(address),
    };
    if !address_ok {
        return skip(outcome, contact_id, "invalid_address");
    }
    if contact.opted_out(channel) {
        return skip(outcome, contact_id, "opted_out");
    }

    let mut record = MessageRecord::outbound(
        &user.organization_id,
        &contact.id,
        user.snapshot(),
        contact.snapshot(),
        template.render(&contact, address),
        Some(send_at),
    );
    record.batch_id = Some(outcome.batch_id.clone());

    match dispatch::dispatch_record(state, record, &contact).await {
        Ok(record) => outcome.succeeded.push(record.id),
        Err(ApiError::ProviderTransport(_)) => skip(outcome, contact_id, "transport_failed"),
        Err(err) => {
            error!("batch {} record for {contact_id} failed: {err:?}", outcome.batch_id);
            skip(outcome, contact_id, "dispatch_failed");
        }
    }
}
