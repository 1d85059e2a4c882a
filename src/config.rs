use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "~/.crm-messaging/config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub sendgrid: SendGridConfig,
    pub plivo: PlivoConfig,
    pub queue: QueueConfig,
    pub observers: ObserverConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally visible base URL, used for unsubscribe links, provider
    /// callbacks and webhook signature checks.
    pub public_url: String,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8093,
            public_url: "http://localhost:8093".to_string(),
            max_body_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub introspect_url: String,
    pub permission_url: String,
    pub required_scope: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            introspect_url: "http://localhost:4445/admin/oauth2/introspect".to_string(),
            permission_url: "http://localhost:8080/api/user/permission".to_string(),
            required_scope: "email_sms".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.crm-messaging/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SendGridConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Hand future sends inside the window to SendGrid's own scheduler.
    pub native_scheduling: bool,
    pub native_schedule_window_hours: i64,
}

impl Default for SendGridConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.sendgrid.com".to_string(),
            native_scheduling: false,
            native_schedule_window_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlivoConfig {
    pub auth_id: Option<String>,
    pub auth_token: Option<String>,
    pub base_url: String,
    pub status_callback_path: String,
    pub verify_signatures: bool,
}

impl Default for PlivoConfig {
    fn default() -> Self {
        Self {
            auth_id: None,
            auth_token: None,
            base_url: "https://api.plivo.com".to_string(),
            status_callback_path: "/api/email-sms/update-sms-status".to_string(),
            verify_signatures: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub publish_url: Option<String>,
    pub api_token: Option<String>,
    pub topic: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            publish_url: None,
            api_token: None,
            topic: "conversation-notifications".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub from_email: String,
    pub from_name: String,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            from_email: "notifications@crm.local".to_string(),
            from_name: "CRM Notifications".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_seconds: 15 }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("CRM_MESSAGING_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde(DEFAULT_CONFIG_PATH))
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();

    if config_path.exists() {
        if let Ok(raw) = fs::read_to_string(&config_path) {
            match serde_json::from_str::<Config>(&raw) {
                Ok(file_cfg) => cfg = file_cfg,
                Err(err) => tracing::warn!(
                    "ignoring unreadable config {}: {err}",
                    config_path.display()
                ),
            }
        }
    }

    apply_env_overrides(&mut cfg);
    cfg
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(port) = env_value("PORT").and_then(|v| v.parse().ok()) {
        cfg.server.port = port;
    }

    if let Some(url) = env_value("CRM_MESSAGING_PUBLIC_URL") {
        cfg.server.public_url = url.trim_end_matches('/').to_string();
    }

    if let Some(bytes) = env_value("CRM_MESSAGING_MAX_BODY_BYTES").and_then(|v| v.parse().ok()) {
        cfg.server.max_body_bytes = bytes;
    }

    if let Some(url) = env_value("CRM_MESSAGING_DATABASE_URL") {
        cfg.database.url = Some(url);
    }

    if let Some(path) = env_value("CRM_MESSAGING_SQLITE_PATH") {
        cfg.database.sqlite_path = path;
    }

    if let Some(key) = env_value("SENDGRID_API_KEY") {
        cfg.sendgrid.api_key = Some(key);
    }

    if let Some(flag) = env_value("SENDGRID_NATIVE_SCHEDULING") {
        cfg.sendgrid.native_scheduling = matches!(flag.as_str(), "1" | "true" | "yes");
    }

    if let Some(id) = env_value("PLIVO_AUTH_ID") {
        cfg.plivo.auth_id = Some(id);
    }

    if let Some(token) = env_value("PLIVO_AUTH_TOKEN") {
        cfg.plivo.auth_token = Some(token);
    }

    if let Some(base) = env_value("HYDRA_ADMIN_URL") {
        cfg.auth.introspect_url = format!("{}/admin/oauth2/introspect", base.trim_end_matches('/'));
    }

    if let Some(base) = env_value("AUTH_SERVICE_BASE_URL") {
        cfg.auth.permission_url = format!("{}/api/user/permission", base.trim_end_matches('/'));
    }

    if let Some(url) = env_value("QUEUE_PUBLISH_URL") {
        cfg.queue.publish_url = Some(url);
    }

    if let Some(token) = env_value("QUEUE_API_TOKEN") {
        cfg.queue.api_token = Some(token);
    }

    if let Some(email) = env_value("OBSERVER_FROM_EMAIL") {
        cfg.observers.from_email = email;
    }

    if let Some(name) = env_value("OBSERVER_FROM_NAME") {
        cfg.observers.from_name = name;
    }

    if let Some(secs) = env_value("HTTP_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
        cfg.http.timeout_seconds = secs;
    }
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}?mode=rwc", path.to_string_lossy())
}
