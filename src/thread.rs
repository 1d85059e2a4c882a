use crate::db::{self, DbKind, ThreadRollup};
use crate::types::{Contact, Conversation, MessageRecord, ThreadEntry};
use anyhow::Result;
use chrono::Utc;
use sqlx::AnyPool;

pub fn rollup_for(entry: &ThreadEntry) -> ThreadRollup {
    ThreadRollup {
        last_message: entry.payload.summary(),
        last_message_date: entry.send_at.or(entry.received_at).unwrap_or_else(Utc::now),
    }
}

/// Appends mirrors of `records`, in order, to an existing thread.
pub async fn append_records(
    pool: &AnyPool,
    kind: DbKind,
    thread_id: &str,
    records: &[MessageRecord],
) -> Result<Vec<ThreadEntry>> {
    let entries: Vec<ThreadEntry> = records.iter().map(ThreadEntry::from_record).collect();
    let Some(last) = entries.last() else {
        return Ok(Vec::new());
    };
    let rollup = rollup_for(last);
    db::append_thread_entries(pool, kind, thread_id, &entries, &rollup).await
}

/// Appends to the contact's thread only when one already exists.
pub async fn append_to_existing(
    pool: &AnyPool,
    kind: DbKind,
    organization_id: &str,
    contact_id: &str,
    record: &MessageRecord,
) -> Result<Option<Conversation>> {
    let Some(conversation) = db::find_conversation(pool, kind, organization_id, contact_id).await?
    else {
        return Ok(None);
    };
    append_records(pool, kind, &conversation.id, std::slice::from_ref(record)).await?;
    Ok(Some(conversation))
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub conversation: Conversation,
    pub created: bool,
}

/// Appends `record` to the contact's thread, creating the thread if needed. A new
/// thread is seeded with `seeds` (chronological) ahead of `record`, and the contact
/// is pointed at it.
pub async fn merge(
    pool: &AnyPool,
    kind: DbKind,
    organization_id: &str,
    contact: &Contact,
    seeds: &[MessageRecord],
    record: &MessageRecord,
) -> Result<MergeOutcome> {
    let (conversation, created) = db::ensure_conversation(
        pool,
        kind,
        organization_id,
        &contact.id,
        contact.email.as_deref(),
        contact.phone.as_deref(),
    )
    .await?;

    let mut batch: Vec<MessageRecord> = Vec::with_capacity(seeds.len() + 1);
    if created {
        batch.extend(seeds.iter().cloned());
    }
    batch.push(record.clone());
    append_records(pool, kind, &conversation.id, &batch).await?;

    if created {
        db::set_contact_conversation(pool, kind, &contact.id, &conversation.id).await?;
    }

    let conversation = load_by_id(pool, kind, &conversation.id)
        .await?
        .unwrap_or(conversation);
    Ok(MergeOutcome {
        conversation,
        created,
    })
}

pub async fn load_by_id(pool: &AnyPool, kind: DbKind, thread_id: &str) -> Result<Option<Conversation>> {
    let Some(mut conversation) = db::get_conversation(pool, kind, thread_id).await? else {
        return Ok(None);
    };
    conversation.entries = db::list_thread_entries(pool, kind, thread_id).await?;
    Ok(Some(conversation))
}

pub async fn load_thread(
    pool: &AnyPool,
    kind: DbKind,
    organization_id: &str,
    contact_id: &str,
) -> Result<Option<Conversation>> {
    let Some(mut conversation) = db::find_conversation(pool, kind, organization_id, contact_id).await?
    else {
        return Ok(None);
    };
    conversation.entries = db::list_thread_entries(pool, kind, &conversation.id).await?;
    Ok(Some(conversation))
}
