use super::{EmailMessage, EmailTransport};
use crate::types::{ContentPart, EmailAddress, Observer};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct SendGridClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl SendGridClient {
    pub fn new(http: Client, api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Builds the `/v3/mail/send` body. Open and click tracking are always on so the
/// event webhook can report them.
pub fn build_mail_body(message: &EmailMessage) -> Value {
    let mut body = json!({
        "personalizations": [{ "to": message.to }],
        "from": message.from,
        "subject": message.subject,
        "content": message.content,
        "tracking_settings": {
            "click_tracking": { "enable": true },
            "open_tracking": { "enable": true }
        }
    });
    if !message.attachments.is_empty() {
        body["attachments"] = json!(message.attachments);
    }
    if let Some(send_at) = message.send_at {
        body["send_at"] = json!(send_at.timestamp());
    }
    if let Some(batch_id) = message.batch_id.as_ref() {
        body["batch_id"] = json!(batch_id);
    }
    body
}

#[async_trait]
impl EmailTransport for SendGridClient {
    async fn send(&self, message: &EmailMessage) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/v3/mail/send"))
            .bearer_auth(&self.api_key)
            .json(&build_mail_body(message))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("sendgrid send failed: {} {}", status, body));
        }

        resp.headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| anyhow!("sendgrid response missing X-Message-Id"))
    }

    async fn create_batch(&self) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/v3/mail/batch"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("sendgrid batch create failed: {} {}", status, body));
        }

        let value: Value = resp.json().await?;
        value
            .get("batch_id")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .ok_or_else(|| anyhow!("sendgrid batch response missing batch_id: {}", value))
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/v3/user/scheduled_sends"))
            .bearer_auth(&self.api_key)
            .json(&json!({ "batch_id": batch_id, "status": "cancel" }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("sendgrid batch cancel failed: {} {}", status, body));
        }
        Ok(())
    }
}

/// Reply summary mailed to workflow observers when a contact answers for the
/// first time.
pub fn observer_notification(
    from: EmailAddress,
    observers: &[Observer],
    contact_name: &str,
    contact_address: &str,
    reply_text: &str,
) -> EmailMessage {
    let to = observers
        .iter()
        .map(|o| EmailAddress {
            email: o.email.clone(),
            name: o.name.clone(),
        })
        .collect();
    EmailMessage {
        to,
        from,
        subject: format!("New Customer Reply: {contact_name}-{contact_address}"),
        content: vec![ContentPart {
            mime_type: "text/html".to_string(),
            value: format!(
                "<p>{contact_name} ({contact_address}) replied:</p><blockquote>{reply_text}</blockquote>"
            ),
        }],
        attachments: Vec::new(),
        send_at: None,
        batch_id: None,
    }
}
