use crate::db::{self, CampaignCounters, MessageRecord, RecipientStatRecord};
use crate::dispatcher::{self, DispatchOutcome};
use crate::error::{CoreError, CoreResult};
use crate::templates::poller;
use crate::types::{DeliveryStatus, Direction, InboundEvent, MessageStatus, StatusUpdate};
use crate::window;
use crate::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Applied,
    Duplicate,
    UnknownMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundOutcome {
    pub conversation_id: String,
    pub duplicate: bool,
    pub replied_campaign_id: Option<String>,
    pub flushed: usize,
}

/// Counts every timestamp column across a campaign's recipient rows.
pub fn tally(stats: &[RecipientStatRecord], snapshot_total: i64) -> CampaignCounters {
    let count = |f: fn(&RecipientStatRecord) -> bool| stats.iter().filter(|s| f(s)).count() as i64;
    CampaignCounters {
        total: if stats.is_empty() { snapshot_total } else { stats.len() as i64 },
        sent: count(|s| s.sent_at.is_some()),
        delivered: count(|s| s.delivered_at.is_some()),
        read: count(|s| s.read_at.is_some()),
        replied: count(|s| s.replied_at.is_some()),
        failed: count(|s| s.failed_at.is_some()),
    }
}

/// Rebuilds a campaign's counters from its recipient rows.
pub async fn recompute_campaign(
    engine: &Engine,
    campaign_id: &str,
) -> CoreResult<CampaignCounters> {
    let campaign = db::get_campaign(&engine.pool, engine.kind, campaign_id)
        .await?
        .ok_or_else(|| CoreError::not_found("campaign", campaign_id))?;
    let stats = db::list_recipient_stats(&engine.pool, engine.kind, campaign_id).await?;
    let counters = tally(&stats, campaign.counters.total);
    if counters != campaign.counters {
        let now = engine.now();
        db::write_campaign_counters(&engine.pool, engine.kind, campaign_id, &counters, now).await?;
        debug!(campaign_id, ?counters, "campaign counters updated");
    }
    Ok(counters)
}

fn event_time(timestamp: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    if timestamp <= 0 {
        return now;
    }
    Utc.timestamp_opt(timestamp, 0).single().unwrap_or(now)
}

/// Folds a delivery status into a message without ever moving it backwards.
pub fn merge_message_status(
    mut message: MessageRecord,
    status: DeliveryStatus,
    at: DateTime<Utc>,
    error: Option<&str>,
) -> MessageRecord {
    let delivered_or_read =
        matches!(message.status, MessageStatus::Delivered | MessageStatus::Read);
    match status {
        DeliveryStatus::Failed => {
            if delivered_or_read {
                return message;
            }
            message.failed_at.get_or_insert(at);
            message.error = Some(error.unwrap_or("delivery failed").to_string());
            message.status = MessageStatus::Failed;
        }
        DeliveryStatus::Sent | DeliveryStatus::Delivered | DeliveryStatus::Read => {
            message.sent_at.get_or_insert(at);
            if matches!(status, DeliveryStatus::Delivered | DeliveryStatus::Read) {
                message.delivered_at.get_or_insert(at);
                message.failed_at = None;
                message.error = None;
            }
            if status == DeliveryStatus::Read {
                message.read_at.get_or_insert(at);
            }
            let next = status.as_message_status();
            let current = message.status;
            if current == MessageStatus::Failed {
                if next.rank() >= MessageStatus::Delivered.rank() {
                    message.status = next;
                }
            } else if next.rank() > current.rank() {
                message.status = next;
            }
        }
    }
    message.updated_at = at.max(message.updated_at);
    message
}

/// Same rules as [`merge_message_status`], applied to a recipient row.
pub fn merge_stat_status(
    mut stat: RecipientStatRecord,
    status: DeliveryStatus,
    at: DateTime<Utc>,
    error: Option<&str>,
) -> RecipientStatRecord {
    match status {
        DeliveryStatus::Failed => {
            if stat.delivered_at.is_some() || stat.read_at.is_some() {
                return stat;
            }
            stat.failed_at.get_or_insert(at);
            stat.error = Some(error.unwrap_or("delivery failed").to_string());
        }
        DeliveryStatus::Sent => {
            stat.sent_at.get_or_insert(at);
        }
        DeliveryStatus::Delivered | DeliveryStatus::Read => {
            stat.sent_at.get_or_insert(at);
            stat.delivered_at.get_or_insert(at);
            if status == DeliveryStatus::Read {
                stat.read_at.get_or_insert(at);
            }
            stat.failed_at = None;
            stat.error = None;
        }
    }
    stat
}

/// Applies one provider status callback to its message and recipient row.
/// The dedup row and the delivery updates commit together, so a failed write
/// leaves the event free to be applied again on redelivery.
pub async fn ingest_status(engine: &Engine, update: &StatusUpdate) -> CoreResult<IngestOutcome> {
    let provider_message_id = update.provider_message_id.as_str();
    let found = db::find_message_by_provider_id(&engine.pool, engine.kind, provider_message_id)
        .await?;
    let Some(message) = found else {
        debug!(provider_message_id, "status for unknown message");
        return Ok(IngestOutcome::UnknownMessage);
    };

    let now = engine.now();
    let at = event_time(update.timestamp, now);
    let message_id = message.id.clone();
    let stat = db::find_stat_by_message(&engine.pool, engine.kind, &message_id).await?;

    let mut tx = engine.pool.begin().await?;
    let fresh = db::record_status_event(
        &mut tx,
        engine.kind,
        &update.provider_message_id,
        update.status.as_str(),
        at,
        now,
    )
    .await?;
    if !fresh {
        tx.rollback().await?;
        debug!(provider_message_id, status = %update.status, "duplicate status event");
        return Ok(IngestOutcome::Duplicate);
    }

    let merged = merge_message_status(message, update.status, at, update.error.as_deref());
    db::update_message_delivery(&mut tx, engine.kind, &merged).await?;
    let campaign_id = match stat {
        Some(stat) => {
            let stat = merge_stat_status(stat, update.status, at, update.error.as_deref());
            db::update_stat_delivery(&mut tx, engine.kind, &stat).await?;
            Some(stat.campaign_id)
        }
        None => None,
    };
    tx.commit().await?;

    if let Some(campaign_id) = campaign_id.as_deref() {
        if let Err(err) = recompute_campaign(engine, campaign_id).await {
            error!(campaign_id, "campaign recompute failed: {err:?}");
        }
    }

    if update.status == DeliveryStatus::Read {
        if let Err(err) = poller::cleanup_unused_template(engine, &message_id).await {
            warn!(message_id = %message_id, "unused template cleanup failed: {err}");
        }
    }

    info!(
        message_id = %message_id,
        provider_message_id = %update.provider_message_id,
        status = %update.status,
        "delivery status applied"
    );
    Ok(IngestOutcome::Applied)
}

/// Records a customer message: reopens the window, marks campaign replies and
/// flushes single messages that were still waiting on a template.
pub async fn ingest_inbound(
    engine: &Engine,
    account_id: &str,
    event: &InboundEvent,
) -> CoreResult<InboundOutcome> {
    let now = engine.now();
    let at = event_time(event.timestamp, now);
    let conversation =
        db::record_inbound_activity(&engine.pool, engine.kind, account_id, &event.from, at)
            .await?;

    if db::find_message_by_provider_id(&engine.pool, engine.kind, &event.provider_message_id)
        .await?
        .is_some()
    {
        debug!(provider_message_id = %event.provider_message_id, "duplicate inbound message");
        return Ok(InboundOutcome {
            conversation_id: conversation.id,
            duplicate: true,
            replied_campaign_id: None,
            flushed: 0,
        });
    }

    let replied =
        db::mark_latest_reply(&engine.pool, engine.kind, account_id, &event.from, at).await?;
    if let Some(campaign_id) = replied.as_deref() {
        if let Err(err) = recompute_campaign(engine, campaign_id).await {
            error!(campaign_id, "campaign recompute failed: {err:?}");
        }
    }

    let mut flushed = 0;
    if window::classify(conversation.last_inbound_at, now, engine.free_window()).is_free {
        let queued =
            db::list_queued_single_messages(&engine.pool, engine.kind, &conversation.id).await?;
        for message in queued {
            match dispatcher::send_free(engine, &message, &conversation.address).await? {
                DispatchOutcome::Sent { .. } => flushed += 1,
                DispatchOutcome::Failed { error } => {
                    warn!(message_id = %message.id, "queued message flush failed: {error}")
                }
                DispatchOutcome::AlreadyDispatched => {}
            }
        }
    }

    let record = MessageRecord {
        id: uuid::Uuid::new_v4().to_string(),
        account_id: account_id.to_string(),
        conversation_id: conversation.id.clone(),
        direction: Direction::Inbound,
        body: event.text.clone(),
        status: MessageStatus::Delivered,
        provider_message_id: Some(event.provider_message_id.clone()),
        template_name: None,
        campaign_id: None,
        error: None,
        dispatch_claimed: true,
        sent_at: Some(at),
        delivered_at: Some(at),
        read_at: None,
        failed_at: None,
        created_at: now,
        updated_at: now,
    };
    // Stored last: the provider id doubles as the redelivery marker.
    if !db::upsert_inbound_message(&engine.pool, engine.kind, &record).await? {
        debug!(
            provider_message_id = %event.provider_message_id,
            "inbound message stored concurrently"
        );
    }

    info!(
        conversation_id = %conversation.id,
        replied = replied.is_some(),
        flushed,
        "inbound message recorded"
    );
    Ok(InboundOutcome {
        conversation_id: conversation.id,
        duplicate: false,
        replied_campaign_id: replied,
        flushed,
    })
}
