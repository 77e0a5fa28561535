use crate::db::{self, DbKind};
use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::AnyPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowDecision {
    pub is_free: bool,
    pub last_inbound_at: Option<DateTime<Utc>>,
}

/// Free only while strictly less than `window` has passed since the last inbound message.
pub fn classify(
    last_inbound_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> WindowDecision {
    let is_free = match last_inbound_at {
        Some(at) => now - at < window,
        None => false,
    };
    WindowDecision {
        is_free,
        last_inbound_at,
    }
}

pub async fn classify_conversation(
    pool: &AnyPool,
    kind: DbKind,
    conversation_id: &str,
    now: DateTime<Utc>,
    window: Duration,
) -> CoreResult<WindowDecision> {
    let conversation = db::get_conversation(pool, kind, conversation_id)
        .await?
        .ok_or_else(|| CoreError::not_found("conversation", conversation_id))?;
    Ok(classify(conversation.last_inbound_at, now, window))
}
