use super::{SmsMessage, SmsTransport};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "x-plivo-signature-v2";
pub const NONCE_HEADER: &str = "x-plivo-signature-v2-nonce";

#[derive(Debug, Clone)]
pub struct PlivoClient {
    http: Client,
    auth_id: String,
    auth_token: String,
    base_url: String,
}

impl PlivoClient {
    pub fn new(
        http: Client,
        auth_id: impl Into<String>,
        auth_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            auth_id: auth_id.into(),
            auth_token: auth_token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SmsTransport for PlivoClient {
    async fn send(&self, message: &SmsMessage) -> Result<String> {
        let url = format!("{}/v1/Account/{}/Message/", self.base_url, self.auth_id);
        let mut payload = json!({
            "src": message.src,
            "dst": message.dst,
            "text": message.text,
            "type": "sms",
        });
        if let Some(callback) = message.callback_url.as_ref() {
            payload["url"] = json!(callback);
            payload["method"] = json!("POST");
        }

        let resp = self
            .http
            .post(url)
            .basic_auth(&self.auth_id, Some(&self.auth_token))
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("plivo send failed: {} {}", status, body));
        }

        let value: Value = resp.json().await?;
        value
            .get("message_uuid")
            .and_then(|v| v.as_array())
            .and_then(|ids| ids.first())
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .ok_or_else(|| anyhow!("plivo response missing message_uuid: {}", value))
    }
}

/// Checks a V2 webhook signature: base64(HMAC-SHA256(auth_token, url + nonce)),
/// where the url excludes its query string.
pub fn verify_signature_v2(auth_token: &str, url: &str, nonce: &str, signature: &str) -> bool {
    let base_url = url.split('?').next().unwrap_or(url);
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(auth_token.as_bytes()) else {
        return false;
    };
    mac.update(base_url.as_bytes());
    mac.update(nonce.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

pub fn sign_v2(auth_token: &str, url: &str, nonce: &str) -> Result<String> {
    let base_url = url.split('?').next().unwrap_or(url);
    let mut mac = Hmac::<Sha256>::new_from_slice(auth_token.as_bytes())
        .map_err(|err| anyhow!("bad plivo auth token: {err}"))?;
    mac.update(base_url.as_bytes());
    mac.update(nonce.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Plivo numbers arrive without the leading `+`.
pub fn normalize_number(number: &str) -> String {
    let trimmed = number.trim();
    if trimmed.starts_with('+') {
        trimmed.to_string()
    } else {
        format!("+{trimmed}")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlivoInboundPayload {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Text", default)]
    pub text: String,
    #[serde(rename = "Type", default)]
    pub kind: Option<String>,
    #[serde(rename = "MessageUUID", default)]
    pub message_uuid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlivoStatusPayload {
    #[serde(rename = "MessageUUID")]
    pub message_uuid: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "ErrorCode", default)]
    pub error_code: Option<String>,
}
