use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix carried by batch ids minted locally (as opposed to provider batch ids).
pub const INTERNAL_BATCH_PREFIX: &str = "crmb_";

/// Summaries of SMS text are cut at this many characters.
pub const SMS_SUMMARY_CHARS: usize = 56;

pub fn new_internal_batch_id() -> String {
    format!("{}{}", INTERNAL_BATCH_PREFIX, uuid::Uuid::new_v4().simple())
}

pub fn is_internal_batch_id(batch_id: &str) -> bool {
    batch_id.starts_with(INTERNAL_BATCH_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Processing,
    Scheduled,
    Sent,
    Delivered,
    Opened,
    Clicked,
    SoftBounced,
    HardBounced,
    Unsubscribed,
    Failed,
    #[serde(rename = "spamreport")]
    SpamReport,
    Received,
    Queued,
    Canceled,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Processing => "processing",
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Opened => "opened",
            MessageStatus::Clicked => "clicked",
            MessageStatus::SoftBounced => "soft_bounced",
            MessageStatus::HardBounced => "hard_bounced",
            MessageStatus::Unsubscribed => "unsubscribed",
            MessageStatus::Failed => "failed",
            MessageStatus::SpamReport => "spamreport",
            MessageStatus::Received => "received",
            MessageStatus::Queued => "queued",
            MessageStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "processing" => MessageStatus::Processing,
            "scheduled" => MessageStatus::Scheduled,
            "sent" => MessageStatus::Sent,
            "delivered" => MessageStatus::Delivered,
            "opened" => MessageStatus::Opened,
            "clicked" => MessageStatus::Clicked,
            "soft_bounced" => MessageStatus::SoftBounced,
            "hard_bounced" => MessageStatus::HardBounced,
            "unsubscribed" => MessageStatus::Unsubscribed,
            "failed" => MessageStatus::Failed,
            "spamreport" => MessageStatus::SpamReport,
            "received" => MessageStatus::Received,
            "queued" => MessageStatus::Queued,
            "canceled" => MessageStatus::Canceled,
            other => return Err(format!("unknown message status: {other}")),
        };
        Ok(status)
    }
}

/// Snapshot of a sender or recipient, captured when the record is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub id: Option<String>,
    pub first_name: Option<String>,
    pub is_active: Option<bool>,
    pub profile_pic_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub mime_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAttachment {
    /// Base64 encoded body.
    pub content: String,
    pub filename: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: EmailAddress,
    pub from: EmailAddress,
    pub subject: String,
    pub content: Vec<ContentPart>,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsPayload {
    pub src: String,
    pub dst: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum MessagePayload {
    Email(EmailPayload),
    Sms(SmsPayload),
}

impl MessagePayload {
    pub fn channel(&self) -> Channel {
        match self {
            MessagePayload::Email(_) => Channel::Email,
            MessagePayload::Sms(_) => Channel::Sms,
        }
    }

    /// Text shown as a thread's `last_message`.
    pub fn summary(&self) -> String {
        match self {
            MessagePayload::Email(email) => email.subject.clone(),
            MessagePayload::Sms(sms) => summarize_sms(&sms.text),
        }
    }
}

pub fn summarize_sms(text: &str) -> String {
    if text.chars().count() <= SMS_SUMMARY_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(SMS_SUMMARY_CHARS).collect();
    format!("{head}...")
}

/// Delivery counters kept for email records. All flags are cumulative snapshots
/// taken from the latest applied provider event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailStatistics {
    pub processed: bool,
    pub delivered: bool,
    pub opened: bool,
    pub clicked: bool,
    pub soft_bounced: bool,
    pub hard_bounced: bool,
    pub unsubscribed: bool,
    pub failed: bool,
    pub spamed: bool,
}

impl EmailStatistics {
    pub fn cleared() -> Self {
        Self {
            processed: false,
            delivered: false,
            opened: false,
            clicked: false,
            soft_bounced: false,
            hard_bounced: false,
            unsubscribed: false,
            failed: false,
            spamed: false,
        }
    }
}

impl Default for EmailStatistics {
    fn default() -> Self {
        Self {
            processed: true,
            ..Self::cleared()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub organization_id: String,
    pub contact_id: Option<String>,
    pub inbound: bool,
    pub batch_id: Option<String>,
    pub correlation_id: Option<String>,
    pub sender: Party,
    pub recipient: Party,
    pub payload: MessagePayload,
    pub send_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub is_scheduled: bool,
    pub canceled_schedule: bool,
    pub canceled_by: Option<String>,
    pub is_tried: bool,
    pub is_sent: bool,
    pub current_status: MessageStatus,
    pub statistics: Option<EmailStatistics>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    /// A fresh outbound record; dispatch decides status and scheduling flags.
    pub fn outbound(
        organization_id: &str,
        contact_id: &str,
        sender: Party,
        recipient: Party,
        payload: MessagePayload,
        send_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        let statistics = match payload {
            MessagePayload::Email(_) => Some(EmailStatistics::default()),
            MessagePayload::Sms(_) => None,
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.to_string(),
            contact_id: Some(contact_id.to_string()),
            inbound: false,
            batch_id: None,
            correlation_id: None,
            sender,
            recipient,
            payload,
            send_at,
            received_at: None,
            is_scheduled: false,
            canceled_schedule: false,
            canceled_by: None,
            is_tried: false,
            is_sent: false,
            current_status: MessageStatus::Processing,
            statistics,
            last_event_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn channel(&self) -> Channel {
        self.payload.channel()
    }

    /// Moment the message entered the conversation.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.send_at.or(self.received_at).unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadEntry {
    pub id: String,
    pub thread_id: String,
    pub seq: i64,
    pub message_id: String,
    pub inbound: bool,
    pub channel: Channel,
    pub sender: Party,
    pub recipient: Party,
    pub payload: MessagePayload,
    pub send_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub current_status: MessageStatus,
    pub batch_id: Option<String>,
    pub correlation_id: Option<String>,
    pub is_scheduled: bool,
    pub canceled_schedule: bool,
    pub canceled_by: Option<String>,
}

impl ThreadEntry {
    /// Mirrors a record; `thread_id` and `seq` are assigned on append.
    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: String::new(),
            seq: 0,
            message_id: record.id.clone(),
            inbound: record.inbound,
            channel: record.channel(),
            sender: record.sender.clone(),
            recipient: record.recipient.clone(),
            payload: record.payload.clone(),
            send_at: record.send_at,
            received_at: record.received_at,
            current_status: record.current_status,
            batch_id: record.batch_id.clone(),
            correlation_id: record.correlation_id.clone(),
            is_scheduled: record.is_scheduled,
            canceled_schedule: record.canceled_schedule,
            canceled_by: record.canceled_by.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub organization_id: String,
    pub contact_id: String,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub last_message: Option<String>,
    pub last_message_date: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_deleted: bool,
    #[serde(default)]
    pub entries: Vec<ThreadEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub organization_id: String,
    pub first_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub dnd_email: bool,
    #[serde(default)]
    pub dnd_sms: bool,
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Contact {
    pub fn snapshot(&self) -> Party {
        Party {
            id: Some(self.id.clone()),
            first_name: self.first_name.clone(),
            is_active: Some(!self.is_deleted),
            profile_pic_url: None,
        }
    }

    pub fn opted_out(&self, channel: Channel) -> bool {
        match channel {
            Channel::Email => self.dnd_email,
            Channel::Sms => self.dnd_sms,
        }
    }

    pub fn address(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
        }
        .filter(|v| !v.trim().is_empty())
    }
}

/// The caller, as resolved by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub organization_id: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub is_active: bool,
    pub profile_pic_url: Option<String>,
    pub role: Option<String>,
    pub permissions: Vec<String>,
}

impl AuthUser {
    pub fn snapshot(&self) -> Party {
        Party {
            id: Some(self.id.clone()),
            first_name: self.first_name.clone(),
            is_active: Some(self.is_active),
            profile_pic_url: self.profile_pic_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observer {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}
