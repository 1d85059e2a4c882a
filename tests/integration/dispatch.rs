mod support;

use chrono::{Duration, Utc};
use crm_messaging::db;
use crm_messaging::dispatch::{self, SendEmailRequest, SendSmsRequest, SMS_OPT_OUT_FOOTER};
use crm_messaging::error::ApiError;
use crm_messaging::schedule::{self, DeliveryMode, DripPolicy, MessageTemplate, RepeatUnit};
use crm_messaging::types::{Channel, ContentPart, EmailAddress, MessagePayload, MessageStatus};
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
            name: Some("Acme".to_string()),
        },
        subject: "Your quote".to_string(),
        content: vec![ContentPart {
            mime_type: "text/html".to_string(),
            value: "<p>Hello</p>".to_string(),
        }],
        attachments: vec![],
        send_at,
    }
}

fn sms_request(dst: &str, text: &str) -> SendSmsRequest {
    SendSmsRequest {
        src: "+15550000001".to_string(),
        dst: dst.to_string(),
        text: text.to_string(),
        send_at: None,
    }
}

fn email_template() -> MessageTemplate {
    MessageTemplate::Email {
        from: EmailAddress {
            email: "sales@acme.test".to_string(),
            name: None,
        },
        subject: "Spring offer".to_string(),
        content: vec![ContentPart {
            mime_type: "text/html".to_string(),
            value: "<p>Offer</p>".to_string(),
        }],
        attachments: vec![],
    }
}

#[tokio::test]
async fn test_send_email_now() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;

    let record = dispatch::send_email(&ctx.state, &user(ORG), email_request("c1@example.com", None))
        .await
        .unwrap();

    assert_eq!(record.current_status, MessageStatus::Sent);
    assert_eq!(record.correlation_id.as_deref(), Some("sg-1"));
    assert!(!record.is_scheduled);

    let sent = ctx.email.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].content[0]
        .value
        .contains("https://crm.test/api/email-sms/unsubscribe-email/c1"));

    let stored = db::get_record(ctx.pool(), ctx.kind(), &record.id).await.unwrap().unwrap();
    assert_eq!(stored.current_status, MessageStatus::Sent);
    assert!(stored.is_tried);
    assert_eq!(outbox_count(&ctx).await, 1);
}

#[tokio::test]
async fn test_opted_out_contact_never_reaches_provider() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    db::set_contact_dnd_email(ctx.pool(), ctx.kind(), "c1").await.unwrap();

    let err = dispatch::send_email(&ctx.state, &user(ORG), email_request("c1@example.com", None))
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::RecipientOptedOut(_)));
    assert!(ctx.email.sent().is_empty());
    let records = db::list_records(ctx.pool(), ctx.kind(), ORG, Channel::Email, 10, 0)
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_contact_of_other_org_is_not_found() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", OTHER_ORG, "+15550000101").await;

    let err = dispatch::send_email(&ctx.state, &user(ORG), email_request("c1@example.com", None))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
    assert!(ctx.email.sent().is_empty());
}

#[tokio::test]
async fn test_invalid_address_rejected_before_lookup() {
    let ctx = setup().await;
    let err = dispatch::send_email(&ctx.state, &user(ORG), email_request("not-an-address", None))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Validation(_)));
}

#[tokio::test]
async fn test_transport_failure_keeps_failed_record() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    ctx.email.fail.store(true, Ordering::SeqCst);

    let err = dispatch::send_email(&ctx.state, &user(ORG), email_request("c1@example.com", None))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::ProviderTransport(_)));

    let records = db::list_records(ctx.pool(), ctx.kind(), ORG, Channel::Email, 10, 0)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].current_status, MessageStatus::Failed);
    assert!(records[0].correlation_id.is_none());
}

#[tokio::test]
async fn test_first_sms_to_number_carries_opt_out_footer() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;

    let first = dispatch::send_sms(&ctx.state, &user(ORG), sms_request("+15550000101", "Hi there"))
        .await
        .unwrap();
    let second = dispatch::send_sms(&ctx.state, &user(ORG), sms_request("+15550000101", "Again"))
        .await
        .unwrap();

    assert_eq!(first.current_status, MessageStatus::Queued);
    assert_eq!(first.correlation_id.as_deref(), Some("uuid-1"));
    let sent = ctx.sms.sent();
    assert_eq!(sent[0].text, format!("Hi there{SMS_OPT_OUT_FOOTER}"));
    assert_eq!(sent[1].text, "Again");
    assert_eq!(
        sent[0].callback_url.as_deref(),
        Some("https://crm.test/api/email-sms/update-sms-status")
    );
    let MessagePayload::Sms(sms) = &second.payload else {
        panic!("expected sms payload");
    };
    assert_eq!(sms.text, "Again");
}

#[tokio::test]
async fn test_sms_opt_out_short_circuits() {
    let ctx = setup().await;
    let mut contact = seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    contact.dnd_sms = true;
    db::upsert_contact(ctx.pool(), ctx.kind(), &contact).await.unwrap();

    let err = dispatch::send_sms(&ctx.state, &user(ORG), sms_request("+15550000101", "Hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::RecipientOptedOut(_)));
    assert!(ctx.sms.sent().is_empty());
}

#[tokio::test]
async fn test_scheduled_email_waits_for_due_dispatch() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let send_at = Utc::now() + Duration::hours(1);

    let record = dispatch::send_email(&ctx.state, &user(ORG), email_request("c1@example.com", Some(send_at)))
        .await
        .unwrap();
    assert!(record.is_scheduled);
    assert_eq!(record.current_status, MessageStatus::Scheduled);
    assert!(record.batch_id.as_deref().is_some_and(|b| b.starts_with("crmb_")));
    assert!(ctx.email.sent().is_empty());

    let early = dispatch::dispatch_due(&ctx.state, ORG, Utc::now(), 10).await.unwrap();
    assert_eq!(early.attempted, 0);

    let outcome = dispatch::dispatch_due(&ctx.state, ORG, send_at + Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(outcome.sent, vec![record.id.clone()]);
    assert_eq!(ctx.email.sent().len(), 1);

    let again = dispatch::dispatch_due(&ctx.state, ORG, send_at + Duration::minutes(5), 10)
        .await
        .unwrap();
    assert_eq!(again.attempted, 0);

    let stored = db::get_record(ctx.pool(), ctx.kind(), &record.id).await.unwrap().unwrap();
    assert_eq!(stored.current_status, MessageStatus::Sent);
    assert_eq!(stored.correlation_id.as_deref(), Some("sg-1"));
}

#[tokio::test]
async fn test_due_dispatch_skips_contact_who_opted_out() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let (thread, _) = db::ensure_conversation(ctx.pool(), ctx.kind(), ORG, "c1", None, None)
        .await
        .unwrap();
    let send_at = Utc::now() + Duration::hours(1);
    let record = dispatch::send_email(&ctx.state, &user(ORG), email_request("c1@example.com", Some(send_at)))
        .await
        .unwrap();

    assert!(db::set_contact_dnd_email(ctx.pool(), ctx.kind(), "c1").await.unwrap());
    let outcome = dispatch::dispatch_due(&ctx.state, ORG, send_at + Duration::seconds(1), 10)
        .await
        .unwrap();
    assert!(outcome.sent.is_empty());
    assert_eq!(outcome.opted_out, vec![record.id.clone()]);
    assert!(ctx.email.sent().is_empty());

    let stored = db::get_record(ctx.pool(), ctx.kind(), &record.id).await.unwrap().unwrap();
    assert_eq!(stored.current_status, MessageStatus::Canceled);
    assert!(stored.canceled_schedule);
    assert_eq!(stored.canceled_by.as_deref(), Some(dispatch::OPT_OUT_ACTOR));
    let entries = db::list_thread_entries(ctx.pool(), ctx.kind(), &thread.id).await.unwrap();
    assert_eq!(entries[0].current_status, MessageStatus::Canceled);

    let again = dispatch::dispatch_due(&ctx.state, ORG, send_at + Duration::minutes(5), 10)
        .await
        .unwrap();
    assert_eq!(again.attempted, 0);
}

#[tokio::test]
async fn test_due_dispatch_stays_inside_organization() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let send_at = Utc::now() + Duration::hours(1);
    let record = dispatch::send_email(&ctx.state, &user(ORG), email_request("c1@example.com", Some(send_at)))
        .await
        .unwrap();

    let foreign = dispatch::dispatch_due(&ctx.state, OTHER_ORG, send_at + Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(foreign.attempted, 0);
    assert!(ctx.email.sent().is_empty());

    let own = dispatch::dispatch_due(&ctx.state, ORG, send_at + Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(own.sent, vec![record.id]);
}

#[tokio::test]
async fn test_due_dispatch_failure_marks_failed() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let mut req = sms_request("+15550000101", "Later");
    let send_at = Utc::now() + Duration::minutes(30);
    req.send_at = Some(send_at);
    let record = dispatch::send_sms(&ctx.state, &user(ORG), req).await.unwrap();
    assert!(record.is_scheduled);

    ctx.sms.fail.store(true, Ordering::SeqCst);
    let outcome = dispatch::dispatch_due(&ctx.state, ORG, send_at + Duration::seconds(1), 10)
        .await
        .unwrap();
    assert_eq!(outcome.failed, vec![record.id.clone()]);

    let stored = db::get_record(ctx.pool(), ctx.kind(), &record.id).await.unwrap().unwrap();
    assert_eq!(stored.current_status, MessageStatus::Failed);
}

#[tokio::test]
async fn test_native_scheduling_uses_provider_batch() {
    let mut config = test_config();
    config.sendgrid.native_scheduling = true;
    let ctx = setup_with(config).await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let send_at = Utc::now() + Duration::hours(2);

    let record = dispatch::send_email(&ctx.state, &user(ORG), email_request("c1@example.com", Some(send_at)))
        .await
        .unwrap();

    assert_eq!(record.batch_id.as_deref(), Some("sg-batch-1"));
    assert_eq!(record.current_status, MessageStatus::Scheduled);
    assert_eq!(record.correlation_id.as_deref(), Some("sg-1"));
    let sent = ctx.email.sent();
    assert_eq!(sent[0].batch_id.as_deref(), Some("sg-batch-1"));
    assert_eq!(sent[0].send_at, Some(send_at));

    let due = dispatch::dispatch_due(&ctx.state, ORG, send_at + Duration::hours(1), 10)
        .await
        .unwrap();
    assert_eq!(due.attempted, 0);
}

#[tokio::test]
async fn test_send_into_existing_thread_appends_entry() {
    let ctx = setup().await;
    seed_contact(&ctx, "c1", ORG, "+15550000101").await;
    let (thread, _) = db::ensure_conversation(ctx.pool(), ctx.kind(), ORG, "c1", None, None)
        .await
        .unwrap();

    let record = dispatch::send_sms(&ctx.state, &user(ORG), sms_request("+15550000101", "Hello"))
        .await
        .unwrap();

    let entries = db::list_thread_entries(ctx.pool(), ctx.kind(), &thread.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message_id, record.id);
    assert_eq!(entries[0].correlation_id.as_deref(), Some("uuid-1"));
}

#[tokio::test]
async fn test_drip_batch_spreads_recipients_over_waves() {
    let ctx = setup().await;
    let mut ids = Vec::new();
    for i in 0..7 {
        let id = format!("c{i}");
        seed_contact(&ctx, &id, ORG, &format!("+1555000010{i}")).await;
        ids.push(id);
    }
    let start = Utc::now() + Duration::days(1);
    let policy = DripPolicy {
        start_date_time: start,
        end_date_time: start + Duration::days(9),
        batch_quantity: 2,
        repeat_after_type: RepeatUnit::Days,
        repeat_after_value: 3,
    };

    let outcome = schedule::expand(&ctx.state, &user(ORG), &ids, &email_template(), &DeliveryMode::Drip(policy))
        .await
        .unwrap();

    assert_eq!(outcome.waves, 4);
    assert_eq!(outcome.succeeded.len(), 7);
    assert!(outcome.skipped.is_empty());
    assert!(ctx.email.sent().is_empty());

    let records = db::list_records_by_batch(ctx.pool(), ctx.kind(), &outcome.batch_id)
        .await
        .unwrap();
    assert_eq!(records.len(), 7);
    assert!(records.iter().all(|r| r.is_scheduled));
    let last_wave = records
        .iter()
        .filter(|r| r.send_at.map(|t| t.timestamp()) == Some((start + Duration::days(9)).timestamp()))
        .count();
    assert_eq!(last_wave, 1);
}

#[tokio::test]
async fn test_bulk_reports_skipped_recipients() {
    let ctx = setup().await;
    seed_contact(&ctx, "ok", ORG, "+15550000101").await;
    seed_contact(&ctx, "foreign", OTHER_ORG, "+15550000102").await;
    let mut opted = seed_contact(&ctx, "opted", ORG, "+15550000103").await;
    opted.dnd_email = true;
    db::upsert_contact(ctx.pool(), ctx.kind(), &opted).await.unwrap();

    let ids: Vec<String> = ["ok", "foreign", "opted", "ghost"].iter().map(|s| s.to_string()).collect();
    let outcome = schedule::expand(&ctx.state, &user(ORG), &ids, &email_template(), &DeliveryMode::AllAtOnce)
        .await
        .unwrap();

    assert_eq!(outcome.succeeded.len(), 1);
    let reasons: Vec<(&str, &str)> = outcome
        .skipped
        .iter()
        .map(|s| (s.contact_id.as_str(), s.reason.as_str()))
        .collect();
    assert_eq!(
        reasons,
        vec![
            ("foreign", "foreign_organization"),
            ("opted", "opted_out"),
            ("ghost", "contact_not_found"),
        ]
    );
    assert_eq!(ctx.email.sent().len(), 1);
}

#[tokio::test]
async fn test_bulk_transport_failure_does_not_abort_batch() {
    let ctx = setup().await;
    seed_contact(&ctx, "a", ORG, "+15550000101").await;
    seed_contact(&ctx, "b", ORG, "+15550000102").await;
    ctx.sms.fail.store(true, Ordering::SeqCst);

    let template = MessageTemplate::Sms {
        src: "+15550000001".to_string(),
        text: "Flash sale".to_string(),
    };
    let ids = vec!["a".to_string(), "b".to_string()];
    let outcome = schedule::expand(&ctx.state, &user(ORG), &ids, &template, &DeliveryMode::AllAtOnce)
        .await
        .unwrap();

    assert!(outcome.succeeded.is_empty());
    assert_eq!(outcome.skipped.len(), 2);
    assert!(outcome.skipped.iter().all(|s| s.reason == "transport_failed"));
}
