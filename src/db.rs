use crate::types::{
    CampaignStatus, Direction, HeaderMediaSpec, MessageStatus, SendPath, TemplateStatus,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, AnyPool, Row};
use std::borrow::Cow;

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
pub struct ConversationRecord {
    pub id: String,
    pub account_id: String,
    pub address: String,
    pub last_inbound_at: Option<DateTime<Utc>>,
    pub last_outbound_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub account_id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub body: Option<String>,
    pub status: MessageStatus,
    pub provider_message_id: Option<String>,
    pub template_name: Option<String>,
    pub campaign_id: Option<String>,
    pub error: Option<String>,
    pub dispatch_claimed: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn outbound(
        account_id: &str,
        conversation_id: &str,
        body: &str,
        campaign_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            conversation_id: conversation_id.to_string(),
            direction: Direction::Outbound,
            body: Some(body.to_string()),
            status: MessageStatus::Queued,
            provider_message_id: None,
            template_name: None,
            campaign_id: campaign_id.map(str::to_string),
            error: None,
            dispatch_claimed: false,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTemplateRecord {
    pub id: String,
    pub account_id: String,
    pub message_id: String,
    pub name: String,
    pub language: String,
    pub category: String,
    pub content_hash: String,
    pub body: String,
    pub components: serde_json::Value,
    pub provider_template_id: Option<String>,
    pub status: TemplateStatus,
    pub rejection_reason: Option<String>,
    pub reused_template_id: Option<String>,
    pub campaign_id: Option<String>,
    pub check_attempts: i64,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub id: String,
    pub group_id: String,
    pub address: String,
    pub contact_id: Option<String>,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub total: i64,
    pub sent: i64,
    pub delivered: i64,
    pub read: i64,
    pub replied: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: String,
    pub account_id: String,
    pub group_id: String,
    pub body: String,
    pub header_media: Option<HeaderMediaSpec>,
    pub header_media_id: Option<String>,
    pub send_path: Option<SendPath>,
    pub status: CampaignStatus,
    pub anchor_message_id: Option<String>,
    pub pending_template_id: Option<String>,
    #[serde(flatten)]
    pub counters: CampaignCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientStatRecord {
    pub id: String,
    pub campaign_id: String,
    pub recipient_id: String,
    pub address: String,
    pub position: i64,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub(crate) fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn opt_datetime(row: &AnyRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let value: Option<i64> = row.try_get(column)?;
    Ok(value.map(i64_to_datetime))
}

fn datetime(row: &AnyRow, column: &str) -> Result<DateTime<Utc>> {
    let value: i64 = row.try_get(column)?;
    Ok(i64_to_datetime(value))
}

fn opt_millis(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(datetime_to_i64)
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            address TEXT NOT NULL,
            last_inbound_at BIGINT,
            last_outbound_at BIGINT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            UNIQUE (account_id, address)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            body TEXT,
            status TEXT NOT NULL,
            provider_message_id TEXT,
            template_name TEXT,
            campaign_id TEXT,
            error TEXT,
            dispatch_claimed BIGINT NOT NULL DEFAULT 0,
            sent_at BIGINT,
            delivered_at BIGINT,
            read_at BIGINT,
            failed_at BIGINT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_provider
           ON messages(provider_message_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_conversation
           ON messages(conversation_id, created_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_campaign ON messages(campaign_id)"#,
        r#"CREATE TABLE IF NOT EXISTS pending_templates (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            name TEXT NOT NULL,
            language TEXT NOT NULL,
            category TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            body TEXT NOT NULL,
            components TEXT NOT NULL,
            provider_template_id TEXT,
            status TEXT NOT NULL,
            rejection_reason TEXT,
            reused_template_id TEXT,
            campaign_id TEXT,
            check_attempts BIGINT NOT NULL DEFAULT 0,
            last_checked_at BIGINT,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_templates_hash
           ON pending_templates(account_id, content_hash, created_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_templates_message ON pending_templates(message_id)"#,
        r#"CREATE TABLE IF NOT EXISTS broadcast_groups (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS recipients (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            address TEXT NOT NULL,
            contact_id TEXT,
            position BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            UNIQUE (group_id, address)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS campaigns (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            body TEXT NOT NULL,
            header_media TEXT,
            header_media_id TEXT,
            send_path TEXT,
            status TEXT NOT NULL,
            anchor_message_id TEXT,
            pending_template_id TEXT,
            total BIGINT NOT NULL DEFAULT 0,
            sent BIGINT NOT NULL DEFAULT 0,
            delivered BIGINT NOT NULL DEFAULT 0,
            read_count BIGINT NOT NULL DEFAULT 0,
            replied BIGINT NOT NULL DEFAULT 0,
            failed BIGINT NOT NULL DEFAULT 0,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS recipient_stats (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            address TEXT NOT NULL,
            position BIGINT NOT NULL,
            conversation_id TEXT,
            message_id TEXT,
            sent_at BIGINT,
            delivered_at BIGINT,
            read_at BIGINT,
            replied_at BIGINT,
            failed_at BIGINT,
            error TEXT,
            created_at BIGINT NOT NULL,
            UNIQUE (campaign_id, recipient_id)
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_stats_message ON recipient_stats(message_id)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_stats_address ON recipient_stats(address, sent_at)"#,
        r#"CREATE TABLE IF NOT EXISTS status_events (
            provider_message_id TEXT NOT NULL,
            status TEXT NOT NULL,
            occurred_at BIGINT NOT NULL,
            received_at BIGINT NOT NULL,
            PRIMARY KEY (provider_message_id, status)
        )"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

const CONVERSATION_COLUMNS: &str =
    "id, account_id, address, last_inbound_at, last_outbound_at, created_at, updated_at";

fn conversation_from_row(row: &AnyRow) -> Result<ConversationRecord> {
    Ok(ConversationRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        address: row.try_get("address")?,
        last_inbound_at: opt_datetime(row, "last_inbound_at")?,
        last_outbound_at: opt_datetime(row, "last_outbound_at")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

pub async fn get_conversation(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
) -> Result<Option<ConversationRecord>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(conversation_from_row).transpose()
}

pub async fn find_conversation(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    address: &str,
) -> Result<Option<ConversationRecord>> {
    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE account_id = ? AND address = ?"
    );
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(account_id)
        .bind(address)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(conversation_from_row).transpose()
}

pub async fn resolve_conversation(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    address: &str,
    now: DateTime<Utc>,
) -> Result<ConversationRecord> {
    let sql = rewrite_sql(
        r#"INSERT INTO conversations
               (id, account_id, address, last_inbound_at, last_outbound_at, created_at, updated_at)
           VALUES (?, ?, ?, NULL, NULL, ?, ?)
           ON CONFLICT(account_id, address) DO NOTHING"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(address)
        .bind(datetime_to_i64(now))
        .bind(datetime_to_i64(now))
        .execute(pool)
        .await?;
    find_conversation(pool, kind, account_id, address)
        .await?
        .ok_or_else(|| anyhow!("conversation vanished after upsert: {account_id}/{address}"))
}

pub async fn record_inbound_activity(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    address: &str,
    at: DateTime<Utc>,
) -> Result<ConversationRecord> {
    let sql = rewrite_sql(
        r#"INSERT INTO conversations
               (id, account_id, address, last_inbound_at, last_outbound_at, created_at, updated_at)
           VALUES (?, ?, ?, ?, NULL, ?, ?)
           ON CONFLICT(account_id, address) DO UPDATE SET
               last_inbound_at = CASE
                   WHEN conversations.last_inbound_at IS NULL
                     OR conversations.last_inbound_at < excluded.last_inbound_at
                   THEN excluded.last_inbound_at
                   ELSE conversations.last_inbound_at
               END,
               updated_at = excluded.updated_at"#,
        kind,
    );
    let at_ms = datetime_to_i64(at);
    sqlx::query(sql.as_ref())
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(address)
        .bind(at_ms)
        .bind(at_ms)
        .bind(at_ms)
        .execute(pool)
        .await?;
    find_conversation(pool, kind, account_id, address)
        .await?
        .ok_or_else(|| anyhow!("conversation vanished after upsert: {account_id}/{address}"))
}

pub async fn touch_outbound(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE conversations SET last_outbound_at = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(at))
        .bind(datetime_to_i64(at))
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

const MESSAGE_COLUMNS: &str = "id, account_id, conversation_id, direction, body, status, \
    provider_message_id, template_name, campaign_id, error, dispatch_claimed, sent_at, \
    delivered_at, read_at, failed_at, created_at, updated_at";

fn message_from_row(row: &AnyRow) -> Result<MessageRecord> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    let claimed: i64 = row.try_get("dispatch_claimed")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        conversation_id: row.try_get("conversation_id")?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| anyhow!("bad direction {direction}"))?,
        body: row.try_get("body")?,
        status: MessageStatus::parse(&status)
            .ok_or_else(|| anyhow!("bad message status {status}"))?,
        provider_message_id: row.try_get("provider_message_id")?,
        template_name: row.try_get("template_name")?,
        campaign_id: row.try_get("campaign_id")?,
        error: row.try_get("error")?,
        dispatch_claimed: claimed != 0,
        sent_at: opt_datetime(row, "sent_at")?,
        delivered_at: opt_datetime(row, "delivered_at")?,
        read_at: opt_datetime(row, "read_at")?,
        failed_at: opt_datetime(row, "failed_at")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

pub async fn insert_message(pool: &AnyPool, kind: DbKind, record: &MessageRecord) -> Result<()> {
    let sql = format!(
        "INSERT INTO messages ({MESSAGE_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    let sql = rewrite_sql(&sql, kind);
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.account_id)
        .bind(&record.conversation_id)
        .bind(record.direction.as_str())
        .bind(record.body.as_deref())
        .bind(record.status.as_str())
        .bind(record.provider_message_id.as_deref())
        .bind(record.template_name.as_deref())
        .bind(record.campaign_id.as_deref())
        .bind(record.error.as_deref())
        .bind(if record.dispatch_claimed { 1_i64 } else { 0_i64 })
        .bind(opt_millis(record.sent_at))
        .bind(opt_millis(record.delivered_at))
        .bind(opt_millis(record.read_at))
        .bind(opt_millis(record.failed_at))
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

/// Inserts an inbound message keyed by its provider id. Returns `false` when the
/// provider id was already stored (webhook redelivery).
pub async fn upsert_inbound_message(
    pool: &AnyPool,
    kind: DbKind,
    record: &MessageRecord,
) -> Result<bool> {
    let sql = format!(
        "INSERT INTO messages ({MESSAGE_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(provider_message_id) DO NOTHING"
    );
    let sql = rewrite_sql(&sql, kind);
    let result = sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.account_id)
        .bind(&record.conversation_id)
        .bind(record.direction.as_str())
        .bind(record.body.as_deref())
        .bind(record.status.as_str())
        .bind(record.provider_message_id.as_deref())
        .bind(record.template_name.as_deref())
        .bind(record.campaign_id.as_deref())
        .bind(record.error.as_deref())
        .bind(if record.dispatch_claimed { 1_i64 } else { 0_i64 })
        .bind(opt_millis(record.sent_at))
        .bind(opt_millis(record.delivered_at))
        .bind(opt_millis(record.read_at))
        .bind(opt_millis(record.failed_at))
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_message(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<MessageRecord>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(message_from_row).transpose()
}

pub async fn find_message_by_provider_id(
    pool: &AnyPool,
    kind: DbKind,
    provider_message_id: &str,
) -> Result<Option<MessageRecord>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE provider_message_id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(provider_message_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(message_from_row).transpose()
}

pub async fn list_campaign_messages(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: &str,
) -> Result<Vec<MessageRecord>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE campaign_id = ? ORDER BY created_at ASC"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref()).bind(campaign_id).fetch_all(pool).await?;
    rows.iter().map(message_from_row).collect()
}

/// Outbound single messages in a conversation still waiting on a template.
pub async fn list_queued_single_messages(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
) -> Result<Vec<MessageRecord>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE conversation_id = ? AND direction = 'outbound' AND status = 'queued'
           AND dispatch_claimed = 0 AND campaign_id IS NULL
         ORDER BY created_at ASC"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref()).bind(conversation_id).fetch_all(pool).await?;
    rows.iter().map(message_from_row).collect()
}

/// Takes the one-shot right to hand this message to the provider.
pub async fn claim_message_dispatch(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE messages SET dispatch_claimed = 1, updated_at = ?
         WHERE id = ? AND dispatch_claimed = 0",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(now))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_message_sent(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    provider_message_id: &str,
    template_name: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE messages SET status = 'sent', provider_message_id = ?, template_name = ?,
               error = NULL, sent_at = ?, updated_at = ?
           WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(provider_message_id)
        .bind(template_name)
        .bind(datetime_to_i64(at))
        .bind(datetime_to_i64(at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_message_failed(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    error: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE messages SET status = 'failed', error = ?, failed_at = ?, updated_at = ?
         WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(error)
        .bind(datetime_to_i64(at))
        .bind(datetime_to_i64(at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Writes merged delivery fields. Runs on a caller-held connection so it can
/// share a transaction with [`record_status_event`].
pub async fn update_message_delivery(
    conn: &mut AnyConnection,
    kind: DbKind,
    record: &MessageRecord,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE messages SET status = ?, error = ?, sent_at = ?, delivered_at = ?, read_at = ?,
               failed_at = ?, updated_at = ?
           WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(record.status.as_str())
        .bind(record.error.as_deref())
        .bind(opt_millis(record.sent_at))
        .bind(opt_millis(record.delivered_at))
        .bind(opt_millis(record.read_at))
        .bind(opt_millis(record.failed_at))
        .bind(datetime_to_i64(record.updated_at))
        .bind(&record.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn fail_queued_campaign_messages(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: &str,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<u64> {
    let sql = rewrite_sql(
        r#"UPDATE messages SET status = 'failed', error = ?, failed_at = ?, updated_at = ?
           WHERE campaign_id = ? AND direction = 'outbound' AND status = 'queued'"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(reason)
        .bind(datetime_to_i64(at))
        .bind(datetime_to_i64(at))
        .bind(campaign_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

const TEMPLATE_COLUMNS: &str = "id, account_id, message_id, name, language, category, \
    content_hash, body, components, provider_template_id, status, rejection_reason, \
    reused_template_id, campaign_id, check_attempts, last_checked_at, created_at, updated_at";

fn template_from_row(row: &AnyRow) -> Result<PendingTemplateRecord> {
    let status: String = row.try_get("status")?;
    let components: String = row.try_get("components")?;
    Ok(PendingTemplateRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        message_id: row.try_get("message_id")?,
        name: row.try_get("name")?,
        language: row.try_get("language")?,
        category: row.try_get("category")?,
        content_hash: row.try_get("content_hash")?,
        body: row.try_get("body")?,
        components: serde_json::from_str(&components).unwrap_or_else(|_| serde_json::json!([])),
        provider_template_id: row.try_get("provider_template_id")?,
        status: TemplateStatus::parse(&status)
            .ok_or_else(|| anyhow!("bad template status {status}"))?,
        rejection_reason: row.try_get("rejection_reason")?,
        reused_template_id: row.try_get("reused_template_id")?,
        campaign_id: row.try_get("campaign_id")?,
        check_attempts: row.try_get("check_attempts")?,
        last_checked_at: opt_datetime(row, "last_checked_at")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

pub async fn insert_pending_template(
    pool: &AnyPool,
    kind: DbKind,
    record: &PendingTemplateRecord,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO pending_templates ({TEMPLATE_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    let sql = rewrite_sql(&sql, kind);
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.account_id)
        .bind(&record.message_id)
        .bind(&record.name)
        .bind(&record.language)
        .bind(&record.category)
        .bind(&record.content_hash)
        .bind(&record.body)
        .bind(record.components.to_string())
        .bind(record.provider_template_id.as_deref())
        .bind(record.status.as_str())
        .bind(record.rejection_reason.as_deref())
        .bind(record.reused_template_id.as_deref())
        .bind(record.campaign_id.as_deref())
        .bind(record.check_attempts)
        .bind(opt_millis(record.last_checked_at))
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_pending_template(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
) -> Result<Option<PendingTemplateRecord>> {
    let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM pending_templates WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(template_from_row).transpose()
}

pub async fn find_template_for_message(
    pool: &AnyPool,
    kind: DbKind,
    message_id: &str,
) -> Result<Option<PendingTemplateRecord>> {
    let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM pending_templates WHERE message_id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(message_id).fetch_optional(pool).await?;
    row.as_ref().map(template_from_row).transpose()
}

/// Reuse candidates: same account and content hash, still usable, newest first,
/// approved before pending and original submissions before reuse records.
pub async fn find_templates_by_hash(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    content_hash: &str,
    since: DateTime<Utc>,
) -> Result<Vec<PendingTemplateRecord>> {
    let sql = format!(
        "SELECT {TEMPLATE_COLUMNS} FROM pending_templates
         WHERE account_id = ? AND content_hash = ? AND status IN ('PENDING', 'APPROVED')
           AND created_at >= ?
         ORDER BY CASE WHEN status = 'APPROVED' THEN 0 ELSE 1 END ASC,
                  CASE WHEN reused_template_id IS NULL THEN 0 ELSE 1 END ASC,
                  created_at DESC"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(account_id)
        .bind(content_hash)
        .bind(datetime_to_i64(since))
        .fetch_all(pool)
        .await?;
    rows.iter().map(template_from_row).collect()
}

pub async fn count_recent_submissions(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    content_hash: &str,
    since: DateTime<Utc>,
) -> Result<i64> {
    let sql = rewrite_sql(
        r#"SELECT COUNT(1) AS n FROM pending_templates
           WHERE account_id = ? AND content_hash = ? AND reused_template_id IS NULL
             AND created_at >= ?"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(account_id)
        .bind(content_hash)
        .bind(datetime_to_i64(since))
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("n")?)
}

pub async fn list_pending_templates_since(
    pool: &AnyPool,
    kind: DbKind,
    since: DateTime<Utc>,
) -> Result<Vec<PendingTemplateRecord>> {
    let sql = format!(
        "SELECT {TEMPLATE_COLUMNS} FROM pending_templates
         WHERE status = 'PENDING' AND created_at >= ?
         ORDER BY created_at ASC"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(since))
        .fetch_all(pool)
        .await?;
    rows.iter().map(template_from_row).collect()
}

pub async fn find_pending_by_provider_ref(
    pool: &AnyPool,
    kind: DbKind,
    provider_template_id: Option<&str>,
    name: Option<&str>,
) -> Result<Vec<PendingTemplateRecord>> {
    let sql = format!(
        "SELECT {TEMPLATE_COLUMNS} FROM pending_templates
         WHERE status = 'PENDING' AND (provider_template_id = ? OR name = ?)
         ORDER BY created_at ASC"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(provider_template_id.unwrap_or(""))
        .bind(name.unwrap_or(""))
        .fetch_all(pool)
        .await?;
    rows.iter().map(template_from_row).collect()
}

/// Moves a template out of PENDING. Returns `false` if another check already did.
pub async fn transition_template_status(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    status: TemplateStatus,
    reason: Option<&str>,
    at: DateTime<Utc>,
) -> Result<bool> {
    let sql = rewrite_sql(
        r#"UPDATE pending_templates SET status = ?, rejection_reason = ?, updated_at = ?
           WHERE id = ? AND status = 'PENDING'"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(status.as_str())
        .bind(reason)
        .bind(datetime_to_i64(at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn record_template_check(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE pending_templates SET check_attempts = check_attempts + 1, last_checked_at = ?
         WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_template_provider_id(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    provider_template_id: &str,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE pending_templates SET provider_template_id = ?
         WHERE id = ? AND provider_template_id IS NULL",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(provider_template_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_template_references(
    pool: &AnyPool,
    kind: DbKind,
    template: &PendingTemplateRecord,
) -> Result<i64> {
    let sql = rewrite_sql(
        r#"SELECT COUNT(1) AS n FROM pending_templates
           WHERE id <> ? AND (reused_template_id = ? OR name = ?)"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(&template.id)
        .bind(&template.id)
        .bind(&template.name)
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("n")?)
}

pub async fn delete_pending_template(pool: &AnyPool, kind: DbKind, id: &str) -> Result<()> {
    let sql = rewrite_sql("DELETE FROM pending_templates WHERE id = ?", kind);
    sqlx::query(sql.as_ref()).bind(id).execute(pool).await?;
    Ok(())
}

pub async fn insert_group(pool: &AnyPool, kind: DbKind, record: &GroupRecord) -> Result<()> {
    let sql = rewrite_sql(
        "INSERT INTO broadcast_groups (id, account_id, name, created_at) VALUES (?, ?, ?, ?)",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.account_id)
        .bind(&record.name)
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_group(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<GroupRecord>> {
    let sql = rewrite_sql(
        "SELECT id, account_id, name, created_at FROM broadcast_groups WHERE id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    if let Some(row) = row {
        return Ok(Some(GroupRecord {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            name: row.try_get("name")?,
            created_at: datetime(&row, "created_at")?,
        }));
    }
    Ok(None)
}

/// Adds a recipient to the end of the group. Returns `false` for a duplicate address.
pub async fn insert_recipient(
    pool: &AnyPool,
    kind: DbKind,
    group_id: &str,
    address: &str,
    contact_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let sql = rewrite_sql(
        r#"INSERT INTO recipients (id, group_id, address, contact_id, position, created_at)
           SELECT ?, ?, ?, ?, COALESCE(MAX(position), 0) + 1, ? FROM recipients WHERE group_id = ?
           ON CONFLICT(group_id, address) DO NOTHING"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(group_id)
        .bind(address)
        .bind(contact_id)
        .bind(datetime_to_i64(now))
        .bind(group_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_recipients(
    pool: &AnyPool,
    kind: DbKind,
    group_id: &str,
) -> Result<Vec<RecipientRecord>> {
    let sql = rewrite_sql(
        r#"SELECT id, group_id, address, contact_id, position, created_at
           FROM recipients WHERE group_id = ? ORDER BY position ASC"#,
        kind,
    );
    let rows = sqlx::query(sql.as_ref()).bind(group_id).fetch_all(pool).await?;
    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        result.push(RecipientRecord {
            id: row.try_get("id")?,
            group_id: row.try_get("group_id")?,
            address: row.try_get("address")?,
            contact_id: row.try_get("contact_id")?,
            position: row.try_get("position")?,
            created_at: datetime(&row, "created_at")?,
        });
    }
    Ok(result)
}

pub async fn count_recipients(pool: &AnyPool, kind: DbKind, group_id: &str) -> Result<i64> {
    let sql = rewrite_sql("SELECT COUNT(1) AS n FROM recipients WHERE group_id = ?", kind);
    let row = sqlx::query(sql.as_ref()).bind(group_id).fetch_one(pool).await?;
    Ok(row.try_get("n")?)
}

const CAMPAIGN_COLUMNS: &str = "id, account_id, group_id, body, header_media, header_media_id, \
    send_path, status, anchor_message_id, pending_template_id, total, sent, delivered, \
    read_count, replied, failed, created_at, updated_at";

fn campaign_from_row(row: &AnyRow) -> Result<CampaignRecord> {
    let header_media: Option<String> = row.try_get("header_media")?;
    let send_path: Option<String> = row.try_get("send_path")?;
    let status: String = row.try_get("status")?;
    Ok(CampaignRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        group_id: row.try_get("group_id")?,
        body: row.try_get("body")?,
        header_media: header_media.and_then(|v| serde_json::from_str(&v).ok()),
        header_media_id: row.try_get("header_media_id")?,
        send_path: send_path.as_deref().and_then(SendPath::parse),
        status: CampaignStatus::parse(&status)
            .ok_or_else(|| anyhow!("bad campaign status {status}"))?,
        anchor_message_id: row.try_get("anchor_message_id")?,
        pending_template_id: row.try_get("pending_template_id")?,
        counters: CampaignCounters {
            total: row.try_get("total")?,
            sent: row.try_get("sent")?,
            delivered: row.try_get("delivered")?,
            read: row.try_get("read_count")?,
            replied: row.try_get("replied")?,
            failed: row.try_get("failed")?,
        },
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

pub async fn insert_campaign(pool: &AnyPool, kind: DbKind, record: &CampaignRecord) -> Result<()> {
    let sql = format!(
        "INSERT INTO campaigns ({CAMPAIGN_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    let sql = rewrite_sql(&sql, kind);
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.account_id)
        .bind(&record.group_id)
        .bind(&record.body)
        .bind(
            record
                .header_media
                .as_ref()
                .map(|v| serde_json::to_string(v).unwrap_or_default()),
        )
        .bind(record.header_media_id.as_deref())
        .bind(record.send_path.map(|p| p.as_str()))
        .bind(record.status.as_str())
        .bind(record.anchor_message_id.as_deref())
        .bind(record.pending_template_id.as_deref())
        .bind(record.counters.total)
        .bind(record.counters.sent)
        .bind(record.counters.delivered)
        .bind(record.counters.read)
        .bind(record.counters.replied)
        .bind(record.counters.failed)
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_campaign(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
) -> Result<Option<CampaignRecord>> {
    let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(campaign_from_row).transpose()
}

/// Fixes the campaign's send path. Succeeds only for the first caller.
pub async fn claim_send_path(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    path: SendPath,
    at: DateTime<Utc>,
) -> Result<bool> {
    let sql = rewrite_sql(
        "UPDATE campaigns SET send_path = ?, status = 'sending', updated_at = ?
         WHERE id = ? AND send_path IS NULL",
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(path.as_str())
        .bind(datetime_to_i64(at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_campaign_status(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    status: CampaignStatus,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql("UPDATE campaigns SET status = ?, updated_at = ? WHERE id = ?", kind);
    sqlx::query(sql.as_ref())
        .bind(status.as_str())
        .bind(datetime_to_i64(at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_campaign_template(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    anchor_message_id: &str,
    pending_template_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE campaigns SET anchor_message_id = ?, pending_template_id = ?,
               status = 'awaiting_template', updated_at = ?
           WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(anchor_message_id)
        .bind(pending_template_id)
        .bind(datetime_to_i64(at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Campaigns currently in `status`, oldest first.
pub async fn list_campaigns_with_status(
    pool: &AnyPool,
    kind: DbKind,
    status: CampaignStatus,
) -> Result<Vec<CampaignRecord>> {
    let sql = format!(
        "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = ? ORDER BY created_at ASC"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref()).bind(status.as_str()).fetch_all(pool).await?;
    rows.iter().map(campaign_from_row).collect()
}

/// Undoes a half-finished send: drops the campaign's placeholders, stats and
/// template rows and puts it back to draft with no send path. Messages that
/// were already claimed for dispatch are kept.
pub async fn reset_campaign_send(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let statements = [
        "DELETE FROM recipient_stats WHERE campaign_id = ?",
        "DELETE FROM messages WHERE campaign_id = ? AND dispatch_claimed = 0",
        "DELETE FROM pending_templates WHERE campaign_id = ?",
    ];
    for stmt in statements {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).bind(campaign_id).execute(&mut *tx).await?;
    }
    let sql = rewrite_sql(
        r#"UPDATE campaigns SET send_path = NULL, status = 'draft', anchor_message_id = NULL,
               pending_template_id = NULL, updated_at = ?
           WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(at))
        .bind(campaign_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn set_campaign_media_id(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    media_id: &str,
) -> Result<()> {
    let sql = rewrite_sql("UPDATE campaigns SET header_media_id = ? WHERE id = ?", kind);
    sqlx::query(sql.as_ref()).bind(media_id).bind(id).execute(pool).await?;
    Ok(())
}

pub async fn write_campaign_counters(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    counters: &CampaignCounters,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE campaigns SET total = ?, sent = ?, delivered = ?, read_count = ?, replied = ?,
               failed = ?, updated_at = ?
           WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(counters.total)
        .bind(counters.sent)
        .bind(counters.delivered)
        .bind(counters.read)
        .bind(counters.replied)
        .bind(counters.failed)
        .bind(datetime_to_i64(at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

const STAT_COLUMNS: &str = "id, campaign_id, recipient_id, address, position, conversation_id, \
    message_id, sent_at, delivered_at, read_at, replied_at, failed_at, error, created_at";

fn stat_from_row(row: &AnyRow) -> Result<RecipientStatRecord> {
    Ok(RecipientStatRecord {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        recipient_id: row.try_get("recipient_id")?,
        address: row.try_get("address")?,
        position: row.try_get("position")?,
        conversation_id: row.try_get("conversation_id")?,
        message_id: row.try_get("message_id")?,
        sent_at: opt_datetime(row, "sent_at")?,
        delivered_at: opt_datetime(row, "delivered_at")?,
        read_at: opt_datetime(row, "read_at")?,
        replied_at: opt_datetime(row, "replied_at")?,
        failed_at: opt_datetime(row, "failed_at")?,
        error: row.try_get("error")?,
        created_at: datetime(row, "created_at")?,
    })
}

pub async fn insert_recipient_stat(
    pool: &AnyPool,
    kind: DbKind,
    record: &RecipientStatRecord,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO recipient_stats ({STAT_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    let sql = rewrite_sql(&sql, kind);
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.campaign_id)
        .bind(&record.recipient_id)
        .bind(&record.address)
        .bind(record.position)
        .bind(record.conversation_id.as_deref())
        .bind(record.message_id.as_deref())
        .bind(opt_millis(record.sent_at))
        .bind(opt_millis(record.delivered_at))
        .bind(opt_millis(record.read_at))
        .bind(opt_millis(record.replied_at))
        .bind(opt_millis(record.failed_at))
        .bind(record.error.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_recipient_stats(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: &str,
) -> Result<Vec<RecipientStatRecord>> {
    let sql = format!(
        "SELECT {STAT_COLUMNS} FROM recipient_stats WHERE campaign_id = ? ORDER BY position ASC"
    );
    let sql = rewrite_sql(&sql, kind);
    let rows = sqlx::query(sql.as_ref()).bind(campaign_id).fetch_all(pool).await?;
    rows.iter().map(stat_from_row).collect()
}

pub async fn find_stat_by_message(
    pool: &AnyPool,
    kind: DbKind,
    message_id: &str,
) -> Result<Option<RecipientStatRecord>> {
    let sql = format!("SELECT {STAT_COLUMNS} FROM recipient_stats WHERE message_id = ?");
    let sql = rewrite_sql(&sql, kind);
    let row = sqlx::query(sql.as_ref()).bind(message_id).fetch_optional(pool).await?;
    row.as_ref().map(stat_from_row).transpose()
}

pub async fn mark_stat_sent(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE recipient_stats SET sent_at = ?, error = NULL WHERE id = ? AND failed_at IS NULL",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_stat_failed(
    pool: &AnyPool,
    kind: DbKind,
    id: &str,
    error: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE recipient_stats SET failed_at = ?, error = ?
           WHERE id = ? AND failed_at IS NULL AND delivered_at IS NULL AND read_at IS NULL"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(at))
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_stat_delivery(
    conn: &mut AnyConnection,
    kind: DbKind,
    record: &RecipientStatRecord,
) -> Result<()> {
    let sql = rewrite_sql(
        r#"UPDATE recipient_stats
           SET sent_at = ?, delivered_at = ?, read_at = ?, failed_at = ?, error = ?
           WHERE id = ?"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(opt_millis(record.sent_at))
        .bind(opt_millis(record.delivered_at))
        .bind(opt_millis(record.read_at))
        .bind(opt_millis(record.failed_at))
        .bind(record.error.as_deref())
        .bind(&record.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn fail_pending_stats(
    pool: &AnyPool,
    kind: DbKind,
    campaign_id: &str,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<u64> {
    let sql = rewrite_sql(
        r#"UPDATE recipient_stats SET failed_at = ?, error = ?
           WHERE campaign_id = ? AND sent_at IS NULL AND failed_at IS NULL"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(at))
        .bind(reason)
        .bind(campaign_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Sets `replied_at` on the most recent already-sent stat for this address.
/// Returns the campaign id that changed.
pub async fn mark_latest_reply(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    address: &str,
    at: DateTime<Utc>,
) -> Result<Option<String>> {
    let sql = rewrite_sql(
        r#"SELECT s.id AS id, s.campaign_id AS campaign_id FROM recipient_stats s
           JOIN campaigns c ON c.id = s.campaign_id
           WHERE c.account_id = ? AND s.address = ?
             AND s.sent_at IS NOT NULL AND s.replied_at IS NULL
             AND s.sent_at <= ?
           ORDER BY s.sent_at DESC
           LIMIT 1"#,
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(account_id)
        .bind(address)
        .bind(datetime_to_i64(at))
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let stat_id: String = row.try_get("id")?;
    let campaign_id: String = row.try_get("campaign_id")?;

    let update = rewrite_sql(
        "UPDATE recipient_stats SET replied_at = ?
         WHERE id = ? AND sent_at IS NOT NULL AND replied_at IS NULL",
        kind,
    );
    let result = sqlx::query(update.as_ref())
        .bind(datetime_to_i64(at))
        .bind(&stat_id)
        .execute(pool)
        .await?;
    Ok((result.rows_affected() == 1).then_some(campaign_id))
}

/// Records a status callback. Returns `false` when the same (message, status)
/// pair was already seen.
pub async fn record_status_event(
    conn: &mut AnyConnection,
    kind: DbKind,
    provider_message_id: &str,
    status: &str,
    occurred_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
) -> Result<bool> {
    let sql = rewrite_sql(
        r#"INSERT INTO status_events (provider_message_id, status, occurred_at, received_at)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(provider_message_id, status) DO NOTHING"#,
        kind,
    );
    let result = sqlx::query(sql.as_ref())
        .bind(provider_message_id)
        .bind(status)
        .bind(datetime_to_i64(occurred_at))
        .bind(datetime_to_i64(received_at))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_rows(pool: &AnyPool, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(1) AS n FROM {table}");
    let row = sqlx::query(&sql).fetch_one(pool).await?;
    Ok(row.try_get("n")?)
}
