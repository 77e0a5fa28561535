use crate::db::{self, DbKind, PendingTemplateRecord};
use crate::types::TemplateContent;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::AnyPool;

/// Case-folds and collapses all whitespace runs to a single space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable fingerprint of a template's matchable content.
pub fn content_hash(content: &TemplateContent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(content.body.text()).as_bytes());
    hasher.update([0x1f]);
    if let Some(header) = &content.header {
        hasher.update(header.match_key().as_bytes());
    }
    hasher.update([0x1f]);
    if let Some(footer) = &content.footer {
        hasher.update(normalize_text(footer.text()).as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Looks for an earlier PENDING or APPROVED template with the same content.
pub async fn find_reusable(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    content: &TemplateContent,
    lookback_days: i64,
    now: DateTime<Utc>,
) -> Result<Option<PendingTemplateRecord>> {
    let since = now - Duration::days(lookback_days.max(0));
    let hash = content_hash(content);
    let candidates = db::find_templates_by_hash(pool, kind, account_id, &hash, since).await?;
    Ok(candidates.into_iter().next())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpamRisk {
    pub count: i64,
    pub is_risk: bool,
}

/// Counts fresh submissions of the same content inside the window. Advisory only.
pub async fn estimate_spam_risk(
    pool: &AnyPool,
    kind: DbKind,
    account_id: &str,
    content: &TemplateContent,
    window_minutes: i64,
    threshold: i64,
    now: DateTime<Utc>,
) -> Result<SpamRisk> {
    let since = now - Duration::minutes(window_minutes.max(0));
    let hash = content_hash(content);
    let count = db::count_recent_submissions(pool, kind, account_id, &hash, since).await?;
    Ok(SpamRisk {
        count,
        is_risk: count >= threshold,
    })
}
