pub mod auth;
pub mod channels;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod inbound;
pub mod outbox;
pub mod reconcile;
pub mod schedule;
pub mod thread;
pub mod types;

pub use config::Config;
pub use error::{ApiError, ApiResult};

use self::auth::{HttpIdentityResolver, IdentityResolver};
use self::channels::plivo::{self, PlivoClient, PlivoInboundPayload, PlivoStatusPayload};
use self::channels::sendgrid::SendGridClient;
use self::channels::{EmailTransport, SmsTransport, Unconfigured};
use self::config::{load_config, resolve_database_url};
use self::db::DbKind;
use self::inbound::{InboundEmail, InboundSms};
use self::reconcile::EmailEvent;
use self::schedule::{DeliveryMode, DripPolicy, MessageTemplate, OperationType};
use self::types::{AuthUser, Channel, ContentPart, EmailAddress, EmailAttachment};

use axum::{
    extract::{rejection::FormRejection, DefaultBodyLimit, Multipart, OriginalUri, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Extension, Form, Json, Router,
};
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::AnyPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DUE_BATCH_DEFAULT: i64 = 100;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub db_kind: DbKind,
    pub http: reqwest::Client,
    pub email: Arc<dyn EmailTransport>,
    pub sms: Arc<dyn SmsTransport>,
    pub identity: Arc<dyn IdentityResolver>,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub batch_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DueQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BulkEmailRequest {
    pub contact_ids: Vec<String>,
    pub from: EmailAddress,
    pub subject: String,
    pub content: Vec<ContentPart>,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
    pub operation_type: OperationType,
    #[serde(default)]
    pub scheduled_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub batch_schedule: Option<DripPolicy>,
}

#[derive(Debug, Deserialize)]
pub struct BulkSmsRequest {
    pub contact_ids: Vec<String>,
    pub src: String,
    pub text: String,
    pub operation_type: OperationType,
    #[serde(default)]
    pub scheduled_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub batch_schedule: Option<DripPolicy>,
}

pub fn build_http_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http.timeout_seconds))
        .build()?)
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();

    let config = load_config();
    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let http = build_http_client(&config)?;

    let email: Arc<dyn EmailTransport> = match config.sendgrid.api_key.clone() {
        Some(key) => Arc::new(SendGridClient::new(
            http.clone(),
            key,
            config.sendgrid.base_url.clone(),
        )),
        None => {
            warn!("SENDGRID_API_KEY not set; email sends will fail");
            Arc::new(Unconfigured("sendgrid"))
        }
    };
    let sms: Arc<dyn SmsTransport> =
        match (config.plivo.auth_id.clone(), config.plivo.auth_token.clone()) {
            (Some(id), Some(token)) => Arc::new(PlivoClient::new(
                http.clone(),
                id,
                token,
                config.plivo.base_url.clone(),
            )),
            _ => {
                warn!("PLIVO_AUTH_ID/PLIVO_AUTH_TOKEN not set; sms sends will fail");
                Arc::new(Unconfigured("plivo"))
            }
        };
    let identity = Arc::new(HttpIdentityResolver::new(
        http.clone(),
        config.auth.introspect_url.clone(),
        config.auth.permission_url.clone(),
        config.auth.required_scope.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        pool: pool.clone(),
        db_kind,
        http: http.clone(),
        email,
        sms,
        identity,
    };

    tokio::spawn(outbox::start_outbox_worker(
        pool.clone(),
        config.queue.clone(),
        db_kind,
        http,
    ));

    let app = build_router(state.clone());
    Ok((state, app))
}

pub fn build_router(state: AppState) -> Router {
    let authed_routes = Router::new()
        .route(
            "/api/email-sms/individual-email",
            post(send_email).get(list_emails),
        )
        .route("/api/email-sms/individual-email/:id", get(view_email))
        .route("/api/email-sms/cancel-schedule-email", put(cancel_email_batch))
        .route("/api/email-sms/individual-sms", post(send_sms).get(list_sms))
        .route("/api/email-sms/individual-sms/:id", get(view_sms))
        .route("/api/email-sms/cancel-scheduled-sms", post(cancel_sms_batch))
        .route("/api/email-sms/add-contact-email", post(bulk_email))
        .route("/api/email-sms/add-contact-sms", post(bulk_sms))
        .route("/api/email-sms/dispatch-due", post(dispatch_due))
        .route(
            "/api/email-sms/conversations/:contact_id",
            get(view_conversation),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/api/email-sms/webhook-events", post(email_events))
        .route("/api/email-sms/inbound-parse-webhook", post(inbound_email))
        .route(
            "/api/email-sms/unsubscribe-email/:contact_id",
            get(unsubscribe_email),
        )
        .route("/api/email-sms/update-sms-status", post(sms_status))
        .route("/api/email-sms/receive-sms", post(receive_sms));

    let body_limit = state.config.server.max_body_bytes;
    Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn send_email(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<dispatch::SendEmailRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = dispatch::send_email(&state, &user, req).await?;
    let message = if record.is_scheduled {
        "Email scheduled"
    } else {
        "Email sent"
    };
    Ok((
        StatusCode::CREATED,
        Json(json!({"message": message, "data": record})),
    ))
}

async fn send_sms(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<dispatch::SendSmsRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = dispatch::send_sms(&state, &user, req).await?;
    let message = if record.is_scheduled {
        "SMS scheduled"
    } else {
        "SMS sent"
    };
    Ok((
        StatusCode::CREATED,
        Json(json!({"message": message, "data": record})),
    ))
}

async fn list_records(
    state: &AppState,
    user: &AuthUser,
    channel: Channel,
    page: Pagination,
) -> ApiResult<impl IntoResponse> {
    let limit = page.limit.unwrap_or(20).clamp(1, 100);
    let offset = page.offset.unwrap_or(0).max(0);
    let records = db::list_records(
        &state.pool,
        state.db_kind,
        &user.organization_id,
        channel,
        limit,
        offset,
    )
    .await?;
    Ok(Json(json!({"data": records, "limit": limit, "offset": offset})))
}

async fn list_emails(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<Pagination>,
) -> ApiResult<impl IntoResponse> {
    list_records(&state, &user, Channel::Email, page).await
}

async fn list_sms(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<Pagination>,
) -> ApiResult<impl IntoResponse> {
    list_records(&state, &user, Channel::Sms, page).await
}

async fn view_record(
    state: &AppState,
    user: &AuthUser,
    channel: Channel,
    id: &str,
) -> ApiResult<impl IntoResponse> {
    let record = db::get_record(&state.pool, state.db_kind, id)
        .await?
        .filter(|r| r.channel() == channel)
        .ok_or_else(|| ApiError::not_found(format!("{channel} {id} not found")))?;
    if record.organization_id != user.organization_id {
        return Err(ApiError::Forbidden(
            "record belongs to another organization".to_string(),
        ));
    }
    Ok(Json(json!({"data": record})))
}

async fn view_email(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    view_record(&state, &user, Channel::Email, &id).await
}

async fn view_sms(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    view_record(&state, &user, Channel::Sms, &id).await
}

async fn cancel_email_batch(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = reconcile::cancel_batch(&state, Channel::Email, &req.batch_id, &user).await?;
    Ok(Json(json!({"message": "Scheduled email canceled", "data": outcome})))
}

async fn cancel_sms_batch(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = reconcile::cancel_batch(&state, Channel::Sms, &req.batch_id, &user).await?;
    Ok(Json(json!({"message": "Scheduled SMS canceled", "data": outcome})))
}

async fn bulk_email(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<BulkEmailRequest>,
) -> ApiResult<impl IntoResponse> {
    let mode = DeliveryMode::from_request(
        req.operation_type,
        req.scheduled_date_time,
        req.batch_schedule,
    )?;
    let template = MessageTemplate::Email {
        from: req.from,
        subject: req.subject,
        content: req.content,
        attachments: req.attachments,
    };
    let outcome = schedule::expand(&state, &user, &req.contact_ids, &template, &mode).await?;
    Ok((StatusCode::CREATED, Json(json!({"data": outcome}))))
}

async fn bulk_sms(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<BulkSmsRequest>,
) -> ApiResult<impl IntoResponse> {
    let mode = DeliveryMode::from_request(
        req.operation_type,
        req.scheduled_date_time,
        req.batch_schedule,
    )?;
    let template = MessageTemplate::Sms {
        src: req.src,
        text: req.text,
    };
    let outcome = schedule::expand(&state, &user, &req.contact_ids, &template, &mode).await?;
    Ok((StatusCode::CREATED, Json(json!({"data": outcome}))))
}

async fn dispatch_due(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<DueQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DUE_BATCH_DEFAULT).clamp(1, 1000);
    let outcome = dispatch::dispatch_due(&state, &user.organization_id, Utc::now(), limit).await?;
    Ok(Json(json!({"data": outcome})))
}

async fn view_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(contact_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let conversation =
        thread::load_thread(&state.pool, state.db_kind, &user.organization_id, &contact_id)
            .await?
            .ok_or_else(|| ApiError::not_found("no conversation with this contact"))?;
    Ok(Json(json!({"data": conversation})))
}

async fn unsubscribe_email(
    State(state): State<AppState>,
    Path(contact_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    db::get_contact(&state.pool, state.db_kind, &contact_id)
        .await?
        .ok_or_else(|| ApiError::not_found("contact not found"))?;
    let changed = db::set_contact_dnd_email(&state.pool, state.db_kind, &contact_id).await?;
    let message = if changed {
        info!("contact {contact_id} unsubscribed from email");
        "You have been unsubscribed"
    } else {
        "You are already unsubscribed"
    };
    Ok(Json(json!({"message": message})))
}

async fn email_events(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let events: Vec<EmailEvent> = match serde_json::from_slice(&body) {
        Ok(events) => events,
        Err(err) => {
            warn!("unreadable email event batch: {err}");
            return Json(json!({"status": "ignored"}));
        }
    };
    match reconcile::apply_email_events(&state, events).await {
        Ok(outcome) => Json(json!({"status": "ok", "data": outcome})),
        Err(err) => {
            error!("email event batch failed: {err:?}");
            Json(json!({"status": "error"}))
        }
    }
}

async fn read_inbound_email(mut multipart: Multipart) -> anyhow::Result<InboundEmail> {
    let mut inbound = InboundEmail::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(filename) = field.file_name().map(|f| f.to_string()) {
            let mime_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let data: Bytes = field.bytes().await?;
            inbound.attachments.push(EmailAttachment {
                content: base64::engine::general_purpose::STANDARD.encode(&data),
                filename,
                mime_type,
                disposition: Some("attachment".to_string()),
            });
            continue;
        }
        let value = field.text().await?;
        match name.as_str() {
            "headers" => inbound.headers = value,
            "subject" => inbound.subject = Some(value),
            "html" => inbound.html = Some(value),
            "text" => inbound.text = Some(value),
            _ => {}
        }
    }
    Ok(inbound)
}

async fn inbound_email(State(state): State<AppState>, multipart: Multipart) -> impl IntoResponse {
    let inbound = match read_inbound_email(multipart).await {
        Ok(inbound) => inbound,
        Err(err) => {
            warn!("unreadable inbound email: {err:#}");
            return Json(json!({"correlated": false}));
        }
    };
    match inbound::correlate_email(&state, inbound).await {
        Ok(outcome) => Json(json!({"correlated": true, "data": outcome})),
        Err(ApiError::NotFound(reason)) => {
            info!("inbound email not correlated: {reason}");
            Json(json!({"correlated": false}))
        }
        Err(err) => {
            error!("inbound email failed: {err:?}");
            Json(json!({"correlated": false}))
        }
    }
}

fn plivo_signature_valid(state: &AppState, uri: &OriginalUri, headers: &HeaderMap) -> bool {
    if !state.config.plivo.verify_signatures {
        return true;
    }
    let Some(token) = state.config.plivo.auth_token.as_deref() else {
        warn!("plivo signature check enabled without PLIVO_AUTH_TOKEN");
        return false;
    };
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let (Some(signature), Some(nonce)) = (header(plivo::SIGNATURE_HEADER), header(plivo::NONCE_HEADER))
    else {
        return false;
    };
    let path = uri
        .0
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| uri.0.path());
    let url = format!(
        "{}{}",
        state.config.server.public_url.trim_end_matches('/'),
        path
    );
    plivo::verify_signature_v2(token, &url, nonce, signature)
}

async fn sms_status(
    State(state): State<AppState>,
    uri: OriginalUri,
    headers: HeaderMap,
    payload: Result<Form<PlivoStatusPayload>, FormRejection>,
) -> impl IntoResponse {
    if !plivo_signature_valid(&state, &uri, &headers) {
        return (StatusCode::FORBIDDEN, Json(json!({"message": "invalid signature"})));
    }
    let Form(payload) = match payload {
        Ok(form) => form,
        Err(rejection) => {
            warn!("unreadable sms status callback: {rejection}");
            return (StatusCode::OK, Json(json!({"updated": false})));
        }
    };
    let updated = match reconcile::apply_sms_status(&state, &payload.message_uuid, &payload.status).await {
        Ok(outcome) => outcome.updated,
        Err(ApiError::IllegalTransition(reason)) | Err(ApiError::NotFound(reason)) => {
            info!("sms status ignored: {reason}");
            false
        }
        Err(err) => {
            error!("sms status {} failed: {err:?}", payload.message_uuid);
            false
        }
    };
    if let Some(code) = payload.error_code.as_deref().filter(|c| !c.is_empty() && *c != "000") {
        warn!("sms {} reported error code {code}", payload.message_uuid);
    }
    (StatusCode::OK, Json(json!({"updated": updated})))
}

async fn receive_sms(
    State(state): State<AppState>,
    uri: OriginalUri,
    headers: HeaderMap,
    payload: Result<Form<PlivoInboundPayload>, FormRejection>,
) -> impl IntoResponse {
    if !plivo_signature_valid(&state, &uri, &headers) {
        return (StatusCode::FORBIDDEN, Json(json!({"message": "invalid signature"})));
    }
    let Form(payload) = match payload {
        Ok(form) => form,
        Err(rejection) => {
            warn!("unreadable inbound sms: {rejection}");
            return (StatusCode::OK, Json(json!({"correlated": false})));
        }
    };
    if payload.kind.as_deref().is_some_and(|k| !k.eq_ignore_ascii_case("sms")) {
        return (StatusCode::OK, Json(json!({"correlated": false})));
    }
    let inbound = InboundSms {
        from: payload.from,
        to: payload.to,
        text: payload.text,
        message_uuid: payload.message_uuid,
    };
    match inbound::correlate_sms(&state, inbound).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({"correlated": true, "data": outcome})),
        ),
        Err(ApiError::NotFound(reason)) => {
            info!("inbound sms not correlated: {reason}");
            (StatusCode::OK, Json(json!({"correlated": false})))
        }
        Err(err) => {
            error!("inbound sms failed: {err:?}");
            (StatusCode::OK, Json(json!({"correlated": false})))
        }
    }
}
