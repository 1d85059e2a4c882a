pub mod plivo;
pub mod sendgrid;

use crate::types::{ContentPart, EmailAddress, EmailAttachment, EmailPayload, SmsPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub to: Vec<EmailAddress>,
    pub from: EmailAddress,
    pub subject: String,
    pub content: Vec<ContentPart>,
    pub attachments: Vec<EmailAttachment>,
    /// Provider-side delivery time; only set for natively scheduled sends.
    pub send_at: Option<DateTime<Utc>>,
    pub batch_id: Option<String>,
}

impl EmailMessage {
    pub fn from_payload(payload: &EmailPayload) -> Self {
        Self {
            to: vec![payload.to.clone()],
            from: payload.from.clone(),
            subject: payload.subject.clone(),
            content: payload.content.clone(),
            attachments: payload.attachments.clone(),
            send_at: None,
            batch_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmsMessage {
    pub src: String,
    pub dst: String,
    pub text: String,
    pub callback_url: Option<String>,
}

impl SmsMessage {
    pub fn from_payload(payload: &SmsPayload, callback_url: Option<String>) -> Self {
        Self {
            src: payload.src.clone(),
            dst: payload.dst.clone(),
            text: payload.text.clone(),
            callback_url,
        }
    }
}

/// Email provider. `send` returns the provider message id used as correlation id.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<String>;

    /// Reserves a provider batch id for natively scheduled sends.
    async fn create_batch(&self) -> anyhow::Result<String>;

    async fn cancel_batch(&self, batch_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, message: &SmsMessage) -> anyhow::Result<String>;
}

/// Stands in for a provider whose credentials are missing; every call fails.
#[derive(Debug, Clone, Copy)]
pub struct Unconfigured(pub &'static str);

#[async_trait]
impl EmailTransport for Unconfigured {
    async fn send(&self, _message: &EmailMessage) -> anyhow::Result<String> {
        anyhow::bail!("{} is not configured", self.0)
    }

    async fn create_batch(&self) -> anyhow::Result<String> {
        anyhow::bail!("{} is not configured", self.0)
    }

    async fn cancel_batch(&self, _batch_id: &str) -> anyhow::Result<()> {
        anyhow::bail!("{} is not configured", self.0)
    }
}

#[async_trait]
impl SmsTransport for Unconfigured {
    async fn send(&self, _message: &SmsMessage) -> anyhow::Result<String> {
        anyhow::bail!("{} is not configured", self.0)
    }
}
