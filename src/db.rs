use crate::types::{
    Channel, Contact, Conversation, EmailStatistics, MessagePayload, MessageRecord,
    MessageStatus, Observer, Party, ThreadEntry,
};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use uuid::Uuid;

const APPEND_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
    #[serde(skip)]
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

/// Rollup values written to a thread together with an append.
#[derive(Debug, Clone)]
pub struct ThreadRollup {
    pub last_message: String,
    pub last_message_date: DateTime<Utc>,
}

pub fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).earliest().unwrap_or_default())
}

pub fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn flag(value: bool) -> i64 {
    i64::from(value)
}

fn read_flag(row: &AnyRow, col: &str) -> Result<bool> {
    Ok(row.try_get::<i64, _>(col)? != 0)
}

fn read_time(row: &AnyRow, col: &str) -> Result<Option<DateTime<Utc>>> {
    let value: Option<i64> = row.try_get(col)?;
    Ok(value.map(i64_to_datetime))
}

fn read_status(row: &AnyRow) -> Result<MessageStatus> {
    let raw: String = row.try_get("current_status")?;
    raw.parse().map_err(anyhow::Error::msg)
}

fn read_json<T: serde::de::DeserializeOwned>(row: &AnyRow, col: &str) -> Result<T> {
    let raw: String = row.try_get(col)?;
    serde_json::from_str(&raw).with_context(|| format!("decoding column {col}"))
}

fn encode_json<T: Serialize>(value: &T) -> std::result::Result<String, sqlx::Error> {
    serde_json::to_string(value).map_err(|err| sqlx::Error::Encode(Box::new(err)))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            first_name TEXT,
            email TEXT,
            phone TEXT,
            dnd_email BIGINT NOT NULL,
            dnd_sms BIGINT NOT NULL,
            conversation_id TEXT,
            is_deleted BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(organization_id, email)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_contacts_phone ON contacts(organization_id, phone)"#,
        r#"CREATE TABLE IF NOT EXISTS message_records (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            contact_id TEXT,
            channel TEXT NOT NULL,
            inbound BIGINT NOT NULL,
            batch_id TEXT,
            correlation_id TEXT,
            sender TEXT NOT NULL,
            recipient TEXT NOT NULL,
            payload TEXT NOT NULL,
            src TEXT,
            dst TEXT,
            send_at BIGINT,
            received_at BIGINT,
            is_scheduled BIGINT NOT NULL,
            canceled_schedule BIGINT NOT NULL,
            canceled_by TEXT,
            is_tried BIGINT NOT NULL,
            is_sent BIGINT NOT NULL,
            current_status TEXT NOT NULL,
            statistics TEXT,
            last_event_at BIGINT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_records_correlation ON message_records(correlation_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_records_batch ON message_records(batch_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_records_sms_route ON message_records(src, dst, send_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_records_due ON message_records(is_scheduled, is_tried, send_at)"#,
        r#"CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            contact_id TEXT NOT NULL,
            contact_email TEXT,
            contact_phone TEXT,
            last_message TEXT,
            last_message_date BIGINT,
            is_read BIGINT NOT NULL,
            is_starred BIGINT NOT NULL,
            is_deleted BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            UNIQUE (organization_id, contact_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS thread_entries (
            id TEXT PRIMARY KEY,
            thread_id TEXT NOT NULL,
            seq BIGINT NOT NULL,
            message_id TEXT NOT NULL,
            inbound BIGINT NOT NULL,
            channel TEXT NOT NULL,
            sender TEXT NOT NULL,
            recipient TEXT NOT NULL,
            payload TEXT NOT NULL,
            send_at BIGINT,
            received_at BIGINT,
            current_status TEXT NOT NULL,
            batch_id TEXT,
            correlation_id TEXT,
            is_scheduled BIGINT NOT NULL,
            canceled_schedule BIGINT NOT NULL,
            canceled_by TEXT,
            UNIQUE (thread_id, seq)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_entries_correlation ON thread_entries(correlation_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_entries_batch ON thread_entries(batch_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_entries_message ON thread_entries(message_id)"#,
        r#"CREATE TABLE IF NOT EXISTS workflow_observers (
            correlation_id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            observers TEXT NOT NULL,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS notification_outbox (
            id TEXT PRIMARY KEY,
            topic TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            retry_count BIGINT NOT NULL,
            next_attempt_at BIGINT NOT NULL,
            last_error TEXT,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_outbox_status ON notification_outbox(status, next_attempt_at)"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// contacts

const CONTACT_COLUMNS: &str =
    "id, organization_id, first_name, email, phone, dnd_email, dnd_sms, conversation_id, is_deleted";

fn contact_from_row(row: &AnyRow) -> Result<Contact> {
    Ok(Contact {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        first_name: row.try_get("first_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        dnd_email: read_flag(row, "dnd_email")?,
        dnd_sms: read_flag(row, "dnd_sms")?,
        conversation_id: row.try_get("conversation_id")?,
        is_deleted: read_flag(row, "is_deleted")?,
    })
}

pub async fn upsert_contact(pool: &AnyPool, kind: DbKind, contact: &Contact) -> Result<()> {
    let now = datetime_to_i64(Utc::now());
    let sql = rewrite_sql(
        r#"INSERT INTO contacts (
            id, organization_id, first_name, email, phone, dnd_email, dnd_sms, conversation_id, is_deleted, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            organization_id=excluded.organization_id,
            first_name=excluded.first_name,
            email=excluded.email,
            phone=excluded.phone,
            dnd_email=excluded.dnd_email,
            dnd_sms=excluded.dnd_sms,
            conversation_id=excluded.conversation_id,
            is_deleted=excluded.is_deleted,
            updated_at=excluded.updated_at"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&contact.id)
        .bind(&contact.organization_id)
        .bind(contact.first_name.as_deref())
        .bind(contact.email.as_deref())
        .bind(contact.phone.as_deref())
        .bind(flag(contact.dnd_email))
        .bind(flag(contact.dnd_sms))
        .bind(contact.conversation_id.as_deref())
        .bind(flag(contact.is_deleted))
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_contact(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<Contact>> {
    let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(contact_from_row).transpose()
}

/// Finds a live contact of the organization by email or phone.
pub async fn find_contact_by_address(
    pool: &AnyPool,
    kind: DbKind,
    organization_id: &str,
    channel: Channel,
    address: &str,
) -> Result<Option<Contact>> {
    let column = match channel {
        Channel::Email => "email",
        Channel::Sms => "phone",
    };
    let sql = format!(
        "SELECT {CONTACT_COLUMNS} FROM contacts WHERE organization_id = ? AND {column} = ? AND is_deleted = 0 LIMIT 1"
    );
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(organization_id)
        .bind(address)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(contact_from_row).transpose()
}

/// Returns false when the contact had already opted out.
pub async fn set_contact_dnd_email(pool: &AnyPool, kind: DbKind, id: &str) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE contacts SET dnd_email = 1, updated_at = ? WHERE id = ? AND dnd_email = 0",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_contact_conversation(
    pool: &AnyPool,
    kind: DbKind,
    contact_id: &str,
    conversation_id: &str,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE contacts SET conversation_id = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(conversation_id)
        .bind(datetime_to_i64(Utc::now()))
        .bind(contact_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// message records

const RECORD_COLUMNS: &str = "id, organization_id, contact_id, inbound, batch_id, correlation_id, sender, recipient, payload, send_at, received_at, is_scheduled, canceled_schedule, canceled_by, is_tried, is_sent, current_status, statistics, last_event_at, created_at, updated_at";

fn record_from_row(row: &AnyRow) -> Result<MessageRecord> {
    let statistics: Option<String> = row.try_get("statistics")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        contact_id: row.try_get("contact_id")?,
        inbound: read_flag(row, "inbound")?,
        batch_id: row.try_get("batch_id")?,
        correlation_id: row.try_get("correlation_id")?,
        sender: read_json::<Party>(row, "sender")?,
        recipient: read_json::<Party>(row, "recipient")?,
        payload: read_json::<MessagePayload>(row, "payload")?,
        send_at: read_time(row, "send_at")?,
        received_at: read_time(row, "received_at")?,
        is_scheduled: read_flag(row, "is_scheduled")?,
        canceled_schedule: read_flag(row, "canceled_schedule")?,
        canceled_by: row.try_get("canceled_by")?,
        is_tried: read_flag(row, "is_tried")?,
        is_sent: read_flag(row, "is_sent")?,
        current_status: read_status(row)?,
        statistics: statistics.and_then(|v| serde_json::from_str(&v).ok()),
        last_event_at: read_time(row, "last_event_at")?,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

fn sms_route(payload: &MessagePayload) -> (Option<&str>, Option<&str>) {
    match payload {
        MessagePayload::Sms(sms) => (Some(sms.src.as_str()), Some(sms.dst.as_str())),
        MessagePayload::Email(_) => (None, None),
    }
}

pub async fn insert_record(pool: &AnyPool, kind: DbKind, record: &MessageRecord) -> Result<()> {
    let (src, dst) = sms_route(&record.payload);
    let sql = rewrite_sql(
        r#"INSERT INTO message_records (
            id, organization_id, contact_id, channel, inbound, batch_id, correlation_id, sender, recipient, payload,
            src, dst, send_at, received_at, is_scheduled, canceled_schedule, canceled_by, is_tried, is_sent,
            current_status, statistics, last_event_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.organization_id)
        .bind(record.contact_id.as_deref())
        .bind(record.channel().as_str())
        .bind(flag(record.inbound))
        .bind(record.batch_id.as_deref())
        .bind(record.correlation_id.as_deref())
        .bind(serde_json::to_string(&record.sender)?)
        .bind(serde_json::to_string(&record.recipient)?)
        .bind(serde_json::to_string(&record.payload)?)
        .bind(src)
        .bind(dst)
        .bind(record.send_at.map(datetime_to_i64))
        .bind(record.received_at.map(datetime_to_i64))
        .bind(flag(record.is_scheduled))
        .bind(flag(record.canceled_schedule))
        .bind(record.canceled_by.as_deref())
        .bind(flag(record.is_tried))
        .bind(flag(record.is_sent))
        .bind(record.current_status.as_str())
        .bind(record.statistics.map(|s| serde_json::json!(s).to_string()))
        .bind(record.last_event_at.map(datetime_to_i64))
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_record(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<MessageRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM message_records WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(record_from_row).transpose()
}

pub async fn find_record_by_correlation(
    pool: &AnyPool,
    kind: DbKind,
    correlation_id: &str,
) -> Result<Option<MessageRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM message_records WHERE correlation_id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(correlation_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

pub async fn list_records_by_batch(
    pool: &AnyPool,
    kind: DbKind,
    batch_id: &str,
) -> Result<Vec<MessageRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM message_records WHERE batch_id = ? ORDER BY created_at ASC"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref()).bind(batch_id).fetch_all(pool).await?;
    rows.iter().map(record_from_row).collect()
}

pub async fn list_records(
    pool: &AnyPool,
    kind: DbKind,
    organization_id: &str,
    channel: Channel,
    limit: i64,
    offset: i64,
) -> Result<Vec<MessageRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM message_records WHERE organization_id = ? AND channel = ? ORDER BY created_at DESC LIMIT ? OFFSET ?"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(organization_id)
        .bind(channel.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(record_from_row).collect()
}

/// True once any outbound SMS has been recorded for the destination number.
pub async fn sms_destination_seen(pool: &AnyPool, kind: DbKind, dst: &str) -> Result<bool> {
    let sql = rewrite_sql(
        "SELECT 1 FROM message_records WHERE channel = 'sms' AND inbound = 0 AND dst = ? LIMIT 1",
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(dst).fetch_optional(pool).await?;
    Ok(row.is_some())
}

/// Outbound SMS sent from `src` to `dst` at or before `before`, newest first.
pub async fn find_prior_sms(
    pool: &AnyPool,
    kind: DbKind,
    src: &str,
    dst: &str,
    before: DateTime<Utc>,
) -> Result<Vec<MessageRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM message_records
         WHERE channel = 'sms' AND inbound = 0 AND src = ? AND dst = ? AND send_at <= ?
         ORDER BY send_at DESC"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(src)
        .bind(dst)
        .bind(datetime_to_i64(before))
        .fetch_all(pool)
        .await?;
    rows.iter().map(record_from_row).collect()
}

/// Stores the outcome of a successful transport call.
pub async fn mark_record_dispatched(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    correlation_id: &str,
    status: MessageStatus,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE message_records SET correlation_id = ?, is_tried = 1, current_status = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(correlation_id)
        .bind(status.as_str())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_record_failed(pool: &AnyPool, kind: DbKind, id: &str) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE message_records SET is_tried = 1, current_status = 'failed', updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Locally scheduled records whose time has come and that nobody has tried yet.
pub async fn list_due_records(
    pool: &AnyPool,
    kind: DbKind,
    organization_id: &str,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<MessageRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM message_records
         WHERE organization_id = ? AND inbound = 0 AND is_scheduled = 1 AND is_tried = 0
           AND canceled_schedule = 0 AND send_at <= ?
         ORDER BY send_at ASC LIMIT ?"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(organization_id)
        .bind(datetime_to_i64(now))
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(record_from_row).collect()
}

/// Compare-and-set on `is_tried`; only one caller wins a given record.
pub async fn claim_record(pool: &AnyPool, kind: DbKind, id: &str) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE message_records SET is_tried = 1, updated_at = ? WHERE id = ? AND is_tried = 0 AND canceled_schedule = 0",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Withdraws a claimed record whose recipient opted out before it went out.
pub async fn cancel_record(pool: &AnyPool, kind: DbKind, id: &str, actor: &str) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE message_records
           SET is_scheduled = 0, canceled_schedule = 1, current_status = 'canceled', canceled_by = ?, updated_at = ?
           WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(actor)
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Moves a record from `expected` to `next`. Returns false if the stored status changed
/// in between.
pub async fn transition_record_status(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    expected: MessageStatus,
    next: MessageStatus,
    mark_sent: bool,
) -> Result<bool> {
    let sql = rewrite_sql(
        r#"UPDATE message_records
           SET current_status = ?, is_sent = CASE WHEN ? = 1 THEN 1 ELSE is_sent END, updated_at = ?
           WHERE id = ? AND current_status = ?"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(next.as_str())
        .bind(flag(mark_sent))
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .bind(expected.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Applies an email provider event unless a newer one was already recorded.
pub async fn apply_email_event(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    statistics: EmailStatistics,
    status: MessageStatus,
    mark_sent: bool,
    event_at: DateTime<Utc>,
) -> Result<bool> {
    let event_ts = datetime_to_i64(event_at);
    let sql = rewrite_sql(
        r#"UPDATE message_records
           SET statistics = ?, current_status = ?, is_sent = CASE WHEN ? = 1 THEN 1 ELSE is_sent END,
               last_event_at = ?, updated_at = ?
           WHERE id = ? AND current_status <> 'canceled' AND (last_event_at IS NULL OR last_event_at <= ?)"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(serde_json::json!(statistics).to_string())
        .bind(status.as_str())
        .bind(flag(mark_sent))
        .bind(event_ts)
        .bind(datetime_to_i64(Utc::now()))
        .bind(id)
        .bind(event_ts)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Cancels the records of a batch that have not gone out yet: untried local ones
/// and ones parked at the provider with a native schedule. Sent history is kept.
pub async fn cancel_records_by_batch(
    pool: &AnyPool,
    kind: DbKind,
    batch_id: &str,
    actor: &str,
) -> Result<u64> {
    let sql = rewrite_sql(
        r#"UPDATE message_records
           SET is_scheduled = 0, canceled_schedule = 1, current_status = 'canceled', canceled_by = ?,
               statistics = CASE WHEN channel = 'email' THEN ? ELSE statistics END, updated_at = ?
           WHERE batch_id = ? AND canceled_schedule = 0
             AND (is_tried = 0 OR (current_status = 'scheduled' AND correlation_id IS NOT NULL))"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(actor)
        .bind(serde_json::json!(EmailStatistics::cleared()).to_string())
        .bind(datetime_to_i64(Utc::now()))
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// conversations and thread entries

const CONVERSATION_COLUMNS: &str = "id, organization_id, contact_id, contact_email, contact_phone, last_message, last_message_date, is_read, is_starred, is_deleted, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, thread_id, seq, message_id, inbound, channel, sender, recipient, payload, send_at, received_at, current_status, batch_id, correlation_id, is_scheduled, canceled_schedule, canceled_by";

fn conversation_from_row(row: &AnyRow) -> Result<Conversation> {
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(Conversation {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        contact_id: row.try_get("contact_id")?,
        contact_email: row.try_get("contact_email")?,
        contact_phone: row.try_get("contact_phone")?,
        last_message: row.try_get("last_message")?,
        last_message_date: read_time(row, "last_message_date")?,
        is_read: read_flag(row, "is_read")?,
        is_starred: read_flag(row, "is_starred")?,
        is_deleted: read_flag(row, "is_deleted")?,
        entries: Vec::new(),
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

fn entry_from_row(row: &AnyRow) -> Result<ThreadEntry> {
    let channel: String = row.try_get("channel")?;
    Ok(ThreadEntry {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        seq: row.try_get("seq")?,
        message_id: row.try_get("message_id")?,
        inbound: read_flag(row, "inbound")?,
        channel: channel.parse().map_err(anyhow::Error::msg)?,
        sender: read_json(row, "sender")?,
        recipient: read_json(row, "recipient")?,
        payload: read_json(row, "payload")?,
        send_at: read_time(row, "send_at")?,
        received_at: read_time(row, "received_at")?,
        current_status: read_status(row)?,
        batch_id: row.try_get("batch_id")?,
        correlation_id: row.try_get("correlation_id")?,
        is_scheduled: read_flag(row, "is_scheduled")?,
        canceled_schedule: read_flag(row, "canceled_schedule")?,
        canceled_by: row.try_get("canceled_by")?,
    })
}

pub async fn find_conversation(
    pool: &AnyPool,
    kind: DbKind,
    organization_id: &str,
    contact_id: &str,
) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE organization_id = ? AND contact_id = ?"
    );
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(organization_id)
        .bind(contact_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(conversation_from_row).transpose()
}

pub async fn get_conversation(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(conversation_from_row).transpose()
}

/// Returns the thread for `(organization, contact)`, creating it if absent.
/// Concurrent callers converge on the same row through the unique key.
pub async fn ensure_conversation(
    pool: &AnyPool,
    kind: DbKind,
    organization_id: &str,
    contact_id: &str,
    contact_email: Option<&str>,
    contact_phone: Option<&str>,
) -> Result<(Conversation, bool)> {
    let now = datetime_to_i64(Utc::now());
    let sql = rewrite_sql(
        r#"INSERT INTO conversations (
            id, organization_id, contact_id, contact_email, contact_phone, last_message, last_message_date,
            is_read, is_starred, is_deleted, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, NULL, NULL, 0, 0, 0, ?, ?)
        ON CONFLICT(organization_id, contact_id) DO NOTHING"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(Uuid::new_v4().to_string())
        .bind(organization_id)
        .bind(contact_id)
        .bind(contact_email)
        .bind(contact_phone)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;
    let created = result.rows_affected() == 1;

    let conversation = find_conversation(pool, kind, organization_id, contact_id)
        .await?
        .context("conversation vanished after insert")?;
    Ok((conversation, created))
}

pub async fn list_thread_entries(
    pool: &AnyPool,
    kind: DbKind,
    thread_id: &str,
) -> Result<Vec<ThreadEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM thread_entries WHERE thread_id = ? ORDER BY seq ASC");
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref()).bind(thread_id).fetch_all(pool).await?;
    rows.iter().map(entry_from_row).collect()
}

/// Appends entries after the current tail and updates the thread rollups, all in
/// one transaction. Retries when a concurrent writer took the same sequence number.
pub async fn append_thread_entries(
    pool: &AnyPool,
    kind: DbKind,
    thread_id: &str,
    entries: &[ThreadEntry],
    rollup: &ThreadRollup,
) -> Result<Vec<ThreadEntry>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_append(pool, kind, thread_id, entries, rollup).await {
            Ok(stored) => return Ok(stored),
            Err(err) if is_unique_violation(&err) && attempt < APPEND_ATTEMPTS => {
                tracing::debug!("thread {thread_id} append raced, retrying ({attempt})");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn try_append(
    pool: &AnyPool,
    kind: DbKind,
    thread_id: &str,
    entries: &[ThreadEntry],
    rollup: &ThreadRollup,
) -> std::result::Result<Vec<ThreadEntry>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let sql = rewrite_sql(
        "SELECT COALESCE(MAX(seq), 0) AS tail FROM thread_entries WHERE thread_id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(thread_id)
        .fetch_one(&mut *tx)
        .await?;
    let mut seq: i64 = row.try_get("tail")?;

    let insert = rewrite_sql(
        r#"INSERT INTO thread_entries (
            id, thread_id, seq, message_id, inbound, channel, sender, recipient, payload, send_at, received_at,
            current_status, batch_id, correlation_id, is_scheduled, canceled_schedule, canceled_by
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );

    let mut stored = Vec::with_capacity(entries.len());
    for entry in entries {
        seq += 1;
        let mut entry = entry.clone();
        entry.thread_id = thread_id.to_string();
        entry.seq = seq;
        sqlx::query(insert.as_ref())
            .bind(&entry.id)
            .bind(&entry.thread_id)
            .bind(entry.seq)
            .bind(&entry.message_id)
            .bind(flag(entry.inbound))
            .bind(entry.channel.as_str())
            .bind(encode_json(&entry.sender)?)
            .bind(encode_json(&entry.recipient)?)
            .bind(encode_json(&entry.payload)?)
            .bind(entry.send_at.map(datetime_to_i64))
            .bind(entry.received_at.map(datetime_to_i64))
            .bind(entry.current_status.as_str())
            .bind(entry.batch_id.as_deref())
            .bind(entry.correlation_id.as_deref())
            .bind(flag(entry.is_scheduled))
            .bind(flag(entry.canceled_schedule))
            .bind(entry.canceled_by.as_deref())
            .execute(&mut *tx)
            .await?;
        stored.push(entry);
    }

    let update = rewrite_sql(
        "UPDATE conversations SET last_message = ?, last_message_date = ?, is_read = 0, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(update.as_ref())
        .bind(&rollup.last_message)
        .bind(datetime_to_i64(rollup.last_message_date))
        .bind(datetime_to_i64(Utc::now()))
        .bind(thread_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(stored)
}

pub async fn patch_entry_status_by_correlation(
    pool: &AnyPool,
    kind: DbKind,
    correlation_id: &str,
    status: MessageStatus,
) -> Result<u64> {
    let sql = rewrite_sql(
        "UPDATE thread_entries SET current_status = ? WHERE correlation_id = ?",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(status.as_str())
        .bind(correlation_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Copies the dispatch outcome of a record onto its mirrored entries.
pub async fn patch_entry_dispatch(
    pool: &AnyPool,
    kind: DbKind,
    message_id: &str,
    correlation_id: Option<&str>,
    status: MessageStatus,
) -> Result<u64> {
    let sql = rewrite_sql(
        "UPDATE thread_entries SET correlation_id = COALESCE(?, correlation_id), current_status = ? WHERE message_id = ?",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(correlation_id)
        .bind(status.as_str())
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn cancel_entries_by_batch(
    pool: &AnyPool,
    kind: DbKind,
    batch_id: &str,
    actor: &str,
) -> Result<u64> {
    let sql = rewrite_sql(
        r#"UPDATE thread_entries
           SET is_scheduled = 0, canceled_schedule = 1, current_status = 'canceled', canceled_by = ?
           WHERE batch_id = ? AND canceled_schedule = 0
             AND message_id IN (
               SELECT id FROM message_records WHERE batch_id = ? AND current_status = 'canceled'
             )"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(actor)
        .bind(batch_id)
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn cancel_entries_by_message(
    pool: &AnyPool,
    kind: DbKind,
    message_id: &str,
    actor: &str,
) -> Result<u64> {
    let sql = rewrite_sql(
        r#"UPDATE thread_entries
           SET is_scheduled = 0, canceled_schedule = 1, current_status = 'canceled', canceled_by = ?
           WHERE message_id = ?"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(actor)
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// workflow observers

pub async fn upsert_workflow_observers(
    pool: &AnyPool,
    kind: DbKind,
    correlation_id: &str,
    organization_id: &str,
    observers: &[Observer],
) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO workflow_observers (correlation_id, organization_id, observers, created_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(correlation_id) DO UPDATE SET observers = excluded.observers"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(correlation_id)
        .bind(organization_id)
        .bind(serde_json::to_string(observers)?)
        .bind(datetime_to_i64(Utc::now()))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_workflow_observers(
    pool: &AnyPool,
    kind: DbKind,
    correlation_id: &str,
) -> Result<Vec<Observer>> {
    let sql = rewrite_sql(
        "SELECT observers FROM workflow_observers WHERE correlation_id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(correlation_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => read_json(&row, "observers"),
        None => Ok(Vec::new()),
    }
}

// ---------------------------------------------------------------------------
// notification outbox

pub async fn insert_outbox(
    pool: &AnyPool,
    kind: DbKind,
    topic: &str,
    payload: serde_json::Value,
    next_attempt_at: DateTime<Utc>,
) -> Result<OutboxRecord> {
    let record = OutboxRecord {
        id: Uuid::new_v4().to_string(),
        topic: topic.to_string(),
        payload,
        status: "pending".to_string(),
        retry_count: 0,
        next_attempt_at,
        last_error: None,
        created_at: Utc::now(),
    };
    let sql = rewrite_sql(
        r#"INSERT INTO notification_outbox (id, topic, payload, status, retry_count, next_attempt_at, last_error, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.topic)
        .bind(record.payload.to_string())
        .bind(&record.status)
        .bind(i64::from(record.retry_count))
        .bind(datetime_to_i64(record.next_attempt_at))
        .bind(record.last_error.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(record)
}

pub async fn claim_outbox_batch(
    pool: &AnyPool,
    kind: DbKind,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<OutboxRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, topic, payload, status, retry_count, next_attempt_at, last_error, created_at
           FROM notification_outbox
           WHERE status IN ('pending','failed') AND next_attempt_at <= ?
           ORDER BY created_at ASC
           LIMIT ?"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(limit)
        .fetch_all(pool)
        .await?;

    let mut result = Vec::new();
    for row in rows {
        let payload: String = row.try_get("payload")?;
        let next_attempt_at: i64 = row.try_get("next_attempt_at")?;
        let created_at: i64 = row.try_get("created_at")?;
        result.push(OutboxRecord {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            payload: serde_json::from_str(&payload).unwrap_or_else(|_| serde_json::json!({})),
            status: row.try_get("status")?,
            retry_count: row.try_get::<i64, _>("retry_count")? as i32,
            next_attempt_at: i64_to_datetime(next_attempt_at),
            last_error: row.try_get("last_error")?,
            created_at: i64_to_datetime(created_at),
        });
    }

    if !result.is_empty() {
        let placeholders = result.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let base_sql = format!(
            "UPDATE notification_outbox SET status='sending', last_error=NULL WHERE id IN ({placeholders})"
        );
        let update_sql = rewrite_sql(&base_sql, kind);
        let mut query = sqlx::query(update_sql.as_ref());
        for row in &result {
            query = query.bind(row.id.clone());
        }
        query.execute(pool).await?;
    }

    Ok(result)
}

pub async fn mark_outbox_delivered(pool: &AnyPool, kind: DbKind, id: &str) -> Result<()> {
    let sql = rewrite_sql("UPDATE notification_outbox SET status='delivered' WHERE id = ?", kind);
    sqlx::query(sql.as_ref()).bind(id).execute(pool).await?;
    Ok(())
}

pub async fn mark_outbox_failed(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    retry_count: i32,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE notification_outbox SET status='failed', retry_count=?, next_attempt_at=?, last_error=? WHERE id=?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(i64::from(retry_count))
        .bind(datetime_to_i64(next_attempt_at))
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
