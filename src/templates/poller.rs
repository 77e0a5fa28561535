use crate::broadcast;
use crate::channels::TemplateSubmission;
use crate::config::PollerConfig;
use crate::db::{self, PendingTemplateRecord};
use crate::dispatcher::{self, DispatchOutcome};
use crate::error::{CoreError, CoreResult};
use crate::retry::with_retry;
use crate::status;
use crate::templates::{dedup, namer, validator};
use crate::types::{
    CampaignStatus, MessageStatus, SendParameters, TemplateContent, TemplateStatus,
    TemplateStatusEvent,
};
use crate::Engine;
use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_REJECTION_REASON: &str = "template rejected by provider";

/// Delays between template checks: one quick check, then a fixed cadence.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    initial: Duration,
    interval: Duration,
    remaining: u32,
    started: bool,
}

impl PollSchedule {
    pub fn new(initial: Duration, interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            interval,
            remaining: max_attempts,
            started: false,
        }
    }

    /// Wall-clock span the recurring checks cover.
    pub fn horizon(&self) -> Duration {
        self.interval * self.remaining
    }
}

impl From<&PollerConfig> for PollSchedule {
    fn from(cfg: &PollerConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.initial_delay_seconds),
            Duration::from_secs(cfg.interval_seconds),
            cfg.max_attempts,
        )
    }
}

impl Iterator for PollSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if !self.started {
            self.started = true;
            return Some(self.initial);
        }
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CheckOutcome {
    StillPending,
    Transitioned(TemplateStatus),
    AlreadyTerminal(TemplateStatus),
    NotFound,
}

impl CheckOutcome {
    pub fn stops_polling(&self) -> bool {
        !matches!(self, CheckOutcome::StillPending)
    }
}

/// Result of the pre-persistence half of a template send.
#[derive(Debug, Clone)]
pub enum TemplatePlan {
    Reuse(PendingTemplateRecord),
    Submitted {
        name: String,
        language: String,
        category: String,
        provider_template_id: String,
        content_hash: String,
        body: String,
        components: serde_json::Value,
    },
}

impl TemplatePlan {
    /// Name of a template this plan created at the provider, if any.
    pub fn submitted_name(&self) -> Option<&str> {
        match self {
            TemplatePlan::Reuse(_) => None,
            TemplatePlan::Submitted { name, .. } => Some(name),
        }
    }
}

/// Validates the content, then either finds a reusable template or submits a
/// new one. Nothing is persisted here, so a failure leaves no trace.
pub async fn prepare_template(
    engine: &Engine,
    account_id: &str,
    content: &TemplateContent,
) -> CoreResult<TemplatePlan> {
    let report = validator::validate_text(content.body.text(), &engine.rules());
    if !report.is_valid {
        return Err(CoreError::Validation(report.errors));
    }

    let now = engine.now();
    let cfg = &engine.config.templates;
    let reusable =
        dedup::find_reusable(&engine.pool, engine.kind, account_id, content, cfg.lookback_days, now)
            .await?;
    if let Some(existing) = reusable {
        info!(
            template = %existing.name,
            status = %existing.status,
            "reusing matching template"
        );
        return Ok(TemplatePlan::Reuse(existing));
    }

    let risk = dedup::estimate_spam_risk(
        &engine.pool,
        engine.kind,
        account_id,
        content,
        cfg.spam_window_minutes,
        cfg.spam_threshold,
        now,
    )
    .await?;
    if risk.is_risk {
        warn!(
            account_id,
            recent = risk.count,
            "many identical template submissions in the spam window"
        );
    }

    let name = namer::generate_name(content.body.text(), now);
    if !namer::is_valid_name(&name) {
        return Err(CoreError::Validation(vec![format!(
            "generated template name {name} is invalid"
        )]));
    }

    let submission = TemplateSubmission {
        name: name.clone(),
        category: engine.config.provider.default_category.clone(),
        language: engine.config.provider.default_language.clone(),
        components: content.creation_json(),
    };
    // Submission is never retried: a rejection here goes straight back to the caller.
    let provider_template_id = engine.provider.submit_template(&submission).await?;
    engine.template_cache.invalidate();
    info!(template = %name, provider_template_id = %provider_template_id, "template submitted");

    Ok(TemplatePlan::Submitted {
        name,
        language: submission.language,
        category: submission.category,
        provider_template_id,
        content_hash: dedup::content_hash(content),
        body: content.body.text().to_string(),
        components: submission.components,
    })
}

/// Persists the tracking record for `plan`, owned by `message_id`.
pub async fn record_template(
    engine: &Engine,
    account_id: &str,
    plan: TemplatePlan,
    message_id: &str,
    campaign_id: Option<&str>,
) -> CoreResult<PendingTemplateRecord> {
    let now = engine.now();
    let record = match plan {
        TemplatePlan::Reuse(original) => PendingTemplateRecord {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            message_id: message_id.to_string(),
            reused_template_id: Some(original.id.clone()),
            campaign_id: campaign_id.map(str::to_string),
            check_attempts: 0,
            last_checked_at: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            ..original
        },
        TemplatePlan::Submitted {
            name,
            language,
            category,
            provider_template_id,
            content_hash,
            body,
            components,
        } => PendingTemplateRecord {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            message_id: message_id.to_string(),
            name,
            language,
            category,
            content_hash,
            body,
            components,
            provider_template_id: Some(provider_template_id),
            status: TemplateStatus::Pending,
            rejection_reason: None,
            reused_template_id: None,
            campaign_id: campaign_id.map(str::to_string),
            check_attempts: 0,
            last_checked_at: None,
            created_at: now,
            updated_at: now,
        },
    };
    db::insert_pending_template(&engine.pool, engine.kind, &record).await?;
    Ok(record)
}

/// One status check against the provider listing.
pub async fn check_template(engine: &Engine, template_id: &str) -> CoreResult<CheckOutcome> {
    let found = db::get_pending_template(&engine.pool, engine.kind, template_id).await?;
    let Some(record) = found else {
        return Ok(CheckOutcome::NotFound);
    };
    if record.status.is_terminal() {
        return Ok(CheckOutcome::AlreadyTerminal(record.status));
    }

    db::record_template_check(&engine.pool, engine.kind, &record.id, engine.now()).await?;
    let listing = engine.template_cache.list(engine.provider.as_ref()).await?;

    let found = record
        .provider_template_id
        .as_deref()
        .and_then(|id| listing.iter().find(|t| t.id == id))
        .or_else(|| listing.iter().find(|t| t.name == record.name));

    let Some(remote) = found else {
        warn!(template = %record.name, "template missing from provider listing");
        return Ok(CheckOutcome::NotFound);
    };

    if record.provider_template_id.is_none() {
        db::set_template_provider_id(&engine.pool, engine.kind, &record.id, &remote.id).await?;
    }

    let status = TemplateStatus::from_provider(&remote.status);
    if status == TemplateStatus::Pending {
        return Ok(CheckOutcome::StillPending);
    }

    if apply_template_status(engine, &record, status, remote.rejected_reason.as_deref()).await? {
        Ok(CheckOutcome::Transitioned(status))
    } else {
        Ok(CheckOutcome::AlreadyTerminal(status))
    }
}

/// Moves a PENDING record to a terminal status and runs the follow-up work.
/// Returns `false` when the record had already left PENDING.
pub async fn apply_template_status(
    engine: &Engine,
    record: &PendingTemplateRecord,
    status: TemplateStatus,
    reason: Option<&str>,
) -> CoreResult<bool> {
    if !status.is_terminal() {
        return Ok(false);
    }
    let reason = match status {
        TemplateStatus::Rejected => Some(
            reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or(DEFAULT_REJECTION_REASON),
        ),
        _ => None,
    };

    let now = engine.now();
    let moved =
        db::transition_template_status(&engine.pool, engine.kind, &record.id, status, reason, now)
            .await?;
    if !moved {
        return Ok(false);
    }
    info!(template = %record.name, status = %status, "template status changed");

    match status {
        TemplateStatus::Approved => on_approved(engine, record).await?,
        TemplateStatus::Rejected => {
            on_rejected(engine, record, reason.unwrap_or(DEFAULT_REJECTION_REASON)).await?
        }
        TemplateStatus::Pending => {}
    }
    Ok(true)
}

/// Sends whatever was waiting on an approved template. Campaign sends are
/// handed to a background fan-out so the caller returns right away.
pub async fn on_approved(engine: &Engine, record: &PendingTemplateRecord) -> CoreResult<()> {
    if let Some(campaign_id) = record.campaign_id.as_deref() {
        let (now, sending) = (engine.now(), CampaignStatus::Sending);
        db::set_campaign_status(&engine.pool, engine.kind, campaign_id, sending, now).await?;
        broadcast::start_fan_out(engine, campaign_id);
        return Ok(());
    }

    let found = db::get_message(&engine.pool, engine.kind, &record.message_id).await?;
    let Some(message) = found else {
        warn!(message_id = %record.message_id, "approved template has no originating message");
        return Ok(());
    };
    if message.status != MessageStatus::Queued {
        return Ok(());
    }
    let conversation = db::get_conversation(&engine.pool, engine.kind, &message.conversation_id)
        .await?
        .ok_or_else(|| CoreError::not_found("conversation", &message.conversation_id))?;

    let outcome = dispatcher::send_template(
        engine,
        &message,
        &conversation.address,
        &record.name,
        &record.language,
        &SendParameters::default(),
    )
    .await?;
    if let DispatchOutcome::Failed { error } = outcome {
        warn!(message_id = %message.id, "templated send failed: {error}");
    }
    Ok(())
}

async fn on_rejected(
    engine: &Engine,
    record: &PendingTemplateRecord,
    reason: &str,
) -> CoreResult<()> {
    let now = engine.now();
    let (pool, kind) = (&engine.pool, engine.kind);
    match record.campaign_id.as_deref() {
        Some(campaign_id) => {
            let stats = db::fail_pending_stats(pool, kind, campaign_id, reason, now).await?;
            db::fail_queued_campaign_messages(pool, kind, campaign_id, reason, now).await?;
            db::set_campaign_status(pool, kind, campaign_id, CampaignStatus::Failed, now).await?;
            warn!(campaign_id, failed = stats, reason, "campaign template rejected");
            if let Err(err) = status::recompute_campaign(engine, campaign_id).await {
                error!(campaign_id, "recompute after rejection failed: {err:?}");
            }
        }
        None => {
            if let Some(message) = db::get_message(pool, kind, &record.message_id).await? {
                if message.status == MessageStatus::Queued {
                    db::mark_message_failed(pool, kind, &message.id, reason, now).await?;
                }
            }
            warn!(message_id = %record.message_id, reason, "message template rejected");
        }
    }
    Ok(())
}

/// Applies a pushed template status event to every PENDING record it names.
pub async fn apply_template_event(
    engine: &Engine,
    event: &TemplateStatusEvent,
) -> CoreResult<usize> {
    if !event.status.is_terminal() {
        return Ok(0);
    }
    engine.template_cache.invalidate();
    let records = db::find_pending_by_provider_ref(
        &engine.pool,
        engine.kind,
        event.provider_template_id.as_deref(),
        event.name.as_deref(),
    )
    .await?;

    let mut applied = 0;
    for record in records {
        if apply_template_status(engine, &record, event.status, event.reason.as_deref()).await? {
            applied += 1;
        }
    }
    Ok(applied)
}

/// Registers the background poller for a template. No-op if one is running.
pub fn start_polling(engine: &Engine, template_id: &str) -> bool {
    let key = format!("template:{template_id}");
    let shutdown = engine.tasks.shutdown_signal();
    let fut = run_poller(engine.clone(), template_id.to_string(), shutdown);
    engine.tasks.spawn(&key, fut)
}

async fn run_poller(engine: Engine, template_id: String, mut shutdown: watch::Receiver<bool>) {
    let schedule = PollSchedule::from(&engine.config.poller);
    for (attempt, delay) in schedule.enumerate() {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                info!(template_id = %template_id, "poller stopping for shutdown");
                return;
            }
        }

        match check_template(&engine, &template_id).await {
            Ok(outcome) if outcome.stops_polling() => {
                info!(template_id = %template_id, attempt, ?outcome, "poller finished");
                return;
            }
            Ok(_) => {}
            Err(err) => warn!(template_id = %template_id, attempt, "template check failed: {err}"),
        }
    }
    warn!(
        template_id = %template_id,
        "template still pending after polling window, leaving it pending"
    );
}

/// Restarts pollers for PENDING templates young enough to still be inside the window.
pub async fn resume_pollers(engine: &Engine) -> CoreResult<usize> {
    let horizon = PollSchedule::from(&engine.config.poller).horizon();
    let horizon = ChronoDuration::from_std(horizon).unwrap_or_else(|_| ChronoDuration::days(1));
    let since = engine.now() - horizon;
    let pending = db::list_pending_templates_since(&engine.pool, engine.kind, since).await?;
    let mut started = 0;
    for record in pending {
        if start_polling(engine, &record.id) {
            started += 1;
        }
    }
    if started > 0 {
        info!(count = started, "resumed template pollers");
    }
    Ok(started)
}

/// Removes an auto-created template that ended up unused because its message
/// went out free-form.
pub async fn cleanup_unused_template(engine: &Engine, message_id: &str) -> CoreResult<bool> {
    let Some(message) = db::get_message(&engine.pool, engine.kind, message_id).await? else {
        return Ok(false);
    };
    if message.template_name.is_some() || message.campaign_id.is_some() {
        return Ok(false);
    }
    let found = db::find_template_for_message(&engine.pool, engine.kind, message_id).await?;
    let Some(template) = found else {
        return Ok(false);
    };
    if template.campaign_id.is_some() || template.reused_template_id.is_some() {
        return Ok(false);
    }
    if db::count_template_references(&engine.pool, engine.kind, &template).await? > 0 {
        return Ok(false);
    }

    let provider = engine.provider.clone();
    let name = template.name.clone();
    let deleted = with_retry(engine.retry_policy(), "delete_template", || {
        provider.delete_template(&name)
    })
    .await;
    if let Err(err) = deleted {
        warn!(template = %template.name, "could not delete unused template: {err}");
        return Ok(false);
    }
    db::delete_pending_template(&engine.pool, engine.kind, &template.id).await?;
    engine.template_cache.invalidate();
    info!(template = %template.name, message_id, "deleted unused template");
    Ok(true)
}
