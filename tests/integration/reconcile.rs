mod support;

use chrono::{Duration, Utc};
use crm_messaging::db;
use crm_messaging::dispatch::{self, SendEmailRequest, SendSmsRequest};
use crm_messaging::error::ApiError;
use crm_messaging::reconcile::{self, EmailEvent};
use crm_messaging::schedule::{self, DeliveryMode, DripPolicy, MessageTemplate, RepeatUnit};
use crm_messaging::types::{Channel, ContentPart, EmailAddress, EmailStatistics, MessageStatus};
use std::sync::atomic::Ordering;
use support::*;

fn email_request(to: &str, send_at: Option<chrono::DateTime<Utc>>) -> SendEmailRequest {
    SendEmailRequest {
        to: EmailAddress {
            email: to.to_string(),
            name: None,
        },
        from: EmailAddress {
            email: "sales@acme.test".to_string(),
            name: None,
        },
        subject: "Quote".to_string(),
        content: vec![ContentPart {
            mime_type: "text/plain".to_string(),
            value: "Hello".to_string(),
        }],
        attachments: vec![],
        send_at,
    }
}

fn event(name: &str, timestamp: i64, id: &str) -> EmailEvent {
    EmailEvent {
        event: name.to_string(),
        timestamp,
        sg_message_id: Some(format!("{id}.filterdrecv-1.0")),
        kind: None,
    }
}

#[tokio::test]
async fn test_sms_status_moves_forward_only() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let (thread, _) = db::ensure_conversation(ctx.pool(), ctx.kind(), ORG, "c1", None, None)
        .await
        .unwrap();
    let req = SendSmsRequest {
        src: "+15550000001".to_string(),
        dst: "+15550000101".to_string(),
        text: "Hi".to_string(),
        send_at: None,
    };
    let record = dispatch::send_sms(&ctx.state, &user(ORG), req).await.unwrap();
    let uuid = record.correlation_id.clone().unwrap();

    assert!(reconcile::apply_sms_status(&ctx.state, &uuid, "sent").await.unwrap().updated);
    let repeat = reconcile::apply_sms_status(&ctx.state, &uuid, "sent").await.unwrap_err();
    assert!(matches!(repeat, ApiError::IllegalTransition(_)));
    assert!(reconcile::apply_sms_status(&ctx.state, &uuid, "delivered").await.unwrap().updated);
    let late = reconcile::apply_sms_status(&ctx.state, &uuid, "undelivered").await.unwrap_err();
    assert!(matches!(late, ApiError::IllegalTransition(_)));

    let stored = db::get_record(ctx.pool(), ctx.kind(), &record.id).await.unwrap().unwrap();
    assert_eq!(stored.current_status, MessageStatus::Delivered);
    assert!(stored.is_sent);
    let entries = db::list_thread_entries(ctx.pool(), ctx.kind(), &thread.id).await.unwrap();
    assert_eq!(entries[0].current_status, MessageStatus::Delivered);
}

#[tokio::test]
async fn test_sms_status_for_unknown_message() {
    let ctx = setup().await;
    let err = reconcile::apply_sms_status(&ctx.state, "nope", "delivered").await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));

    let ignored = reconcile::apply_sms_status(&ctx.state, "nope", "received").await.unwrap();
    assert!(!ignored.updated);
}

#[tokio::test]
async fn test_email_event_batch_applies_latest_per_message() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    seed_contact(&ctx, "c2", ORG, "+15550000102").await;
    let first = dispatch::send_email(&ctx.state, &user(ORG), email_request("c1@example.com", None))
        .await
        .unwrap();
    let second = dispatch::send_email(&ctx.state, &user(ORG), email_request("c2@example.com", None))
        .await
        .unwrap();

    let t = Utc::now().timestamp();
    let mut bounce = event("bounce", t + 5, "sg-2");
    bounce.kind = Some("blocked".to_string());
    let events = vec![
        event("open", t + 30, "sg-1"),
        event("processed", t + 10, "sg-1"),
        event("delivered", t + 20, "sg-1"),
        bounce,
        event("delivered", t + 5, "sg-404"),
    ];

    let outcome = reconcile::apply_email_events(&ctx.state, events).await.unwrap();
    assert_eq!(outcome.applied, 2);
    assert_eq!(outcome.ignored, 1);

    let opened = db::get_record(ctx.pool(), ctx.kind(), &first.id).await.unwrap().unwrap();
    assert_eq!(opened.current_status, MessageStatus::Opened);
    let stats = opened.statistics.unwrap();
    assert!(stats.processed && stats.delivered && stats.opened && !stats.clicked);
    assert!(opened.is_sent);

    let bounced = db::get_record(ctx.pool(), ctx.kind(), &second.id).await.unwrap().unwrap();
    assert_eq!(bounced.current_status, MessageStatus::HardBounced);
    assert!(bounced.statistics.unwrap().hard_bounced);
}

#[tokio::test]
async fn test_stale_email_event_ignored() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let record = dispatch::send_email(&ctx.state, &user(ORG), email_request("c1@example.com", None))
        .await
        .unwrap();
    let t = Utc::now().timestamp();

    reconcile::apply_email_events(&ctx.state, vec![event("click", t + 60, "sg-1")])
        .await
        .unwrap();
    let outcome = reconcile::apply_email_events(&ctx.state, vec![event("delivered", t + 10, "sg-1")])
        .await
        .unwrap();
    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.ignored, 1);

    let stored = db::get_record(ctx.pool(), ctx.kind(), &record.id).await.unwrap().unwrap();
    assert_eq!(stored.current_status, MessageStatus::Clicked);
}

#[tokio::test]
async fn test_cancel_internal_batch() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    seed_contact(&ctx, "c2", ORG, "+15550000102").await;
    let (thread, _) = db::ensure_conversation(ctx.pool(), ctx.kind(), ORG, "c1", None, None)
        .await
        .unwrap();
    let send_at = Utc::now() + Duration::days(1);
    let template = MessageTemplate::Email {
        from: EmailAddress {
            email: "sales@acme.test".to_string(),
            name: None,
        },
        subject: "Tomorrow".to_string(),
        content: vec![ContentPart {
            mime_type: "text/html".to_string(),
            value: "<p>Soon</p>".to_string(),
        }],
        attachments: vec![],
    };
    let ids = vec!["c1".to_string(), "c2".to_string()];
    let outcome = schedule::expand(&ctx.state, &user(ORG), &ids, &template, &DeliveryMode::AtScheduleTime(send_at))
        .await
        .unwrap();
    assert_eq!(outcome.succeeded.len(), 2);

    let other_batch = dispatch::send_email(
        &ctx.state,
        &user(ORG),
        email_request("c2@example.com", Some(send_at)),
    )
    .await
    .unwrap();

    let canceled = reconcile::cancel_batch(&ctx.state, Channel::Email, &outcome.batch_id, &user(ORG))
        .await
        .unwrap();
    assert_eq!(canceled.canceled, 2);
    assert!(ctx.email.canceled().is_empty());

    for record in db::list_records_by_batch(ctx.pool(), ctx.kind(), &outcome.batch_id).await.unwrap() {
        assert_eq!(record.current_status, MessageStatus::Canceled);
        assert!(record.canceled_schedule);
        assert!(!record.is_scheduled);
        assert_eq!(record.canceled_by.as_deref(), Some("user-org-1"));
        assert_eq!(record.statistics, Some(EmailStatistics::cleared()));
    }
    let entries = db::list_thread_entries(ctx.pool(), ctx.kind(), &thread.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].current_status, MessageStatus::Canceled);

    let due = dispatch::dispatch_due(&ctx.state, ORG, send_at + Duration::minutes(1), 10)
        .await
        .unwrap();
    assert_eq!(due.sent, vec![other_batch.id]);
}

#[tokio::test]
async fn test_cancel_rejections() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let record = dispatch::send_email(
        &ctx.state,
        &user(ORG),
        email_request("c1@example.com", Some(Utc::now() + Duration::hours(3))),
    )
    .await
    .unwrap();
    let batch_id = record.batch_id.unwrap();

    let foreign = reconcile::cancel_batch(&ctx.state, Channel::Email, &batch_id, &user(OTHER_ORG))
        .await
        .unwrap_err();
    assert!(matches!(foreign, ApiError::Authorization(_)));

    let wrong_channel = reconcile::cancel_batch(&ctx.state, Channel::Sms, &batch_id, &user(ORG))
        .await
        .unwrap_err();
    assert!(matches!(wrong_channel, ApiError::NotFound(_)));

    let unknown = reconcile::cancel_batch(&ctx.state, Channel::Email, "crmb_missing", &user(ORG))
        .await
        .unwrap_err();
    assert!(matches!(unknown, ApiError::NotFound(_)));

    let empty = reconcile::cancel_batch(&ctx.state, Channel::Email, "  ", &user(ORG))
        .await
        .unwrap_err();
    assert!(matches!(empty, ApiError::Validation(_)));

    let provider_sms = reconcile::cancel_batch(&ctx.state, Channel::Sms, "sg-batch-1", &user(ORG))
        .await
        .unwrap_err();
    assert!(matches!(provider_sms, ApiError::Validation(_)));

    let stored = db::get_record(ctx.pool(), ctx.kind(), &record.id).await.unwrap().unwrap();
    assert_eq!(stored.current_status, MessageStatus::Scheduled);
}

#[tokio::test]
async fn test_cancel_provider_batch_calls_sendgrid_first() {
    let mut config = test_config();
    config.sendgrid.native_scheduling = true;
    let ctx = setup_with(config).await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let record = dispatch::send_email(
        &ctx.state,
        &user(ORG),
        email_request("c1@example.com", Some(Utc::now() + Duration::hours(1))),
    )
    .await
    .unwrap();
    assert_eq!(record.batch_id.as_deref(), Some("sg-batch-1"));

    ctx.email.fail.store(true, Ordering::SeqCst);
    let err = reconcile::cancel_batch(&ctx.state, Channel::Email, "sg-batch-1", &user(ORG))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::ProviderTransport(_)));
    let untouched = db::get_record(ctx.pool(), ctx.kind(), &record.id).await.unwrap().unwrap();
    assert!(!untouched.canceled_schedule);

    ctx.email.fail.store(false, Ordering::SeqCst);
    let outcome = reconcile::cancel_batch(&ctx.state, Channel::Email, "sg-batch-1", &user(ORG))
        .await
        .unwrap();
    assert_eq!(outcome.canceled, 1);
    assert_eq!(ctx.email.canceled(), vec!["sg-batch-1".to_string()]);
}

#[tokio::test]
async fn test_cancel_scheduled_sms_batch() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let req = SendSmsRequest {
        src: "+15550000001".to_string(),
        dst: "+15550000101".to_string(),
        text: "Reminder".to_string(),
        send_at: Some(Utc::now() + Duration::hours(4)),
    };
    let record = dispatch::send_sms(&ctx.state, &user(ORG), req).await.unwrap();
    assert_eq!(record.current_status, MessageStatus::Queued);

    let outcome = reconcile::cancel_batch(&ctx.state, Channel::Sms, record.batch_id.as_deref().unwrap(), &user(ORG))
        .await
        .unwrap();
    assert_eq!(outcome.canceled, 1);
    let stored = db::get_record(ctx.pool(), ctx.kind(), &record.id).await.unwrap().unwrap();
    assert_eq!(stored.current_status, MessageStatus::Canceled);
    assert!(stored.statistics.is_none());
}

#[tokio::test]
async fn test_event_with_unusable_timestamp_is_dropped() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let record = dispatch::send_email(&ctx.state, &user(ORG), email_request("c1@example.com", None))
        .await
        .unwrap();

    let broken = event("click", i64::MAX, "sg-1");
    let direct = reconcile::apply_email_event(&ctx.state, "sg-1", &broken).await.unwrap();
    assert!(!direct.updated);
    let stored = db::get_record(ctx.pool(), ctx.kind(), &record.id).await.unwrap().unwrap();
    assert!(stored.last_event_at.is_none());

    let t = Utc::now().timestamp();
    let outcome = reconcile::apply_email_events(&ctx.state, vec![broken, event("delivered", t, "sg-1")])
        .await
        .unwrap();
    assert_eq!(outcome.applied, 1);
    let stored = db::get_record(ctx.pool(), ctx.kind(), &record.id).await.unwrap().unwrap();
    assert_eq!(stored.current_status, MessageStatus::Delivered);
}

#[tokio::test]
async fn test_cancel_drip_keeps_delivered_wave() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    seed_contact(&ctx, "c2", ORG, "+15550000102").await;
    let start = Utc::now();
    let policy = DripPolicy {
        start_date_time: start,
        end_date_time: start + Duration::days(5),
        batch_quantity: 1,
        repeat_after_type: RepeatUnit::Days,
        repeat_after_value: 1,
    };
    let template = MessageTemplate::Sms {
        src: "+15550000001".to_string(),
        text: "Week one".to_string(),
    };
    let ids = vec!["c1".to_string(), "c2".to_string()];
    let outcome = schedule::expand(&ctx.state, &user(ORG), &ids, &template, &DeliveryMode::Drip(policy))
        .await
        .unwrap();
    assert_eq!(outcome.waves, 2);
    let (first, second) = (&outcome.succeeded[0], &outcome.succeeded[1]);

    let sent = db::get_record(ctx.pool(), ctx.kind(), first).await.unwrap().unwrap();
    let uuid = sent.correlation_id.clone().unwrap();
    reconcile::apply_sms_status(&ctx.state, &uuid, "sent").await.unwrap();
    reconcile::apply_sms_status(&ctx.state, &uuid, "delivered").await.unwrap();

    let canceled = reconcile::cancel_batch(&ctx.state, Channel::Sms, &outcome.batch_id, &user(ORG))
        .await
        .unwrap();
    assert_eq!(canceled.canceled, 1);

    let delivered = db::get_record(ctx.pool(), ctx.kind(), first).await.unwrap().unwrap();
    assert_eq!(delivered.current_status, MessageStatus::Delivered);
    assert!(delivered.is_sent);
    assert!(!delivered.canceled_schedule);
    let pending = db::get_record(ctx.pool(), ctx.kind(), second).await.unwrap().unwrap();
    assert_eq!(pending.current_status, MessageStatus::Canceled);
    assert!(pending.canceled_schedule);

    let again = reconcile::cancel_batch(&ctx.state, Channel::Sms, &outcome.batch_id, &user(ORG))
        .await
        .unwrap();
    assert_eq!(again.canceled, 0);
}
