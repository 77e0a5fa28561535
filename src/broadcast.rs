use crate::db::{
    self, CampaignCounters, CampaignRecord, GroupRecord, MessageRecord, PendingTemplateRecord,
    RecipientRecord, RecipientStatRecord,
};
use crate::dispatcher::{self, DispatchOutcome, SendKind};
use crate::error::{CoreError, CoreResult};
use crate::retry::with_retry;
use crate::status;
use crate::templates::poller::{self, TemplatePlan};
use crate::types::{
    Body, CampaignStatus, Header, HeaderMediaSpec, MediaFormat, MessageStatus, SendParameters,
    SendPath, TemplateContent, TemplateStatus,
};
use crate::window;
use crate::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct NewRecipient {
    pub address: String,
    #[serde(default)]
    pub contact_id: Option<String>,
}

/// Per-recipient tally of one bulk pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SendReport {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SendReport {
    pub fn is_partial_failure(&self) -> bool {
        self.failed > 0 && self.sent > 0
    }
}

/// What `send_campaign` set in motion. The sends themselves run in the
/// background; counters are a snapshot taken before they start.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignSendResult {
    pub campaign_id: String,
    pub send_path: SendPath,
    pub status: CampaignStatus,
    pub fan_out_started: bool,
    pub template: Option<PendingTemplateRecord>,
    pub counters: CampaignCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageSendResult {
    pub message: MessageRecord,
    pub send_path: SendPath,
    pub template: Option<PendingTemplateRecord>,
}

fn normalize_address(address: &str) -> Option<String> {
    let trimmed: String = address.chars().filter(|c| !c.is_whitespace()).collect();
    let trimmed = trimmed.trim_start_matches('+');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

async fn pace(engine: &Engine, index: usize) {
    let pacing = engine.config.broadcast.pacing_ms;
    if index > 0 && pacing > 0 {
        tokio::time::sleep(Duration::from_millis(pacing)).await;
    }
}

pub async fn create_group(
    engine: &Engine,
    account_id: &str,
    name: &str,
) -> CoreResult<GroupRecord> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CoreError::Validation(vec![
            "group name must not be empty".to_string(),
        ]));
    }
    let record = GroupRecord {
        id: uuid::Uuid::new_v4().to_string(),
        account_id: account_id.to_string(),
        name: name.to_string(),
        created_at: engine.now(),
    };
    db::insert_group(&engine.pool, engine.kind, &record).await?;
    Ok(record)
}

/// Adds recipients, skipping blanks and addresses already in the group.
pub async fn add_recipients(
    engine: &Engine,
    group_id: &str,
    recipients: &[NewRecipient],
) -> CoreResult<usize> {
    db::get_group(&engine.pool, engine.kind, group_id)
        .await?
        .ok_or_else(|| CoreError::not_found("group", group_id))?;

    let mut added = 0;
    for recipient in recipients {
        let Some(address) = normalize_address(&recipient.address) else {
            continue;
        };
        if db::insert_recipient(
            &engine.pool,
            engine.kind,
            group_id,
            &address,
            recipient.contact_id.as_deref(),
            engine.now(),
        )
        .await?
        {
            added += 1;
        }
    }
    Ok(added)
}

pub async fn create_campaign(
    engine: &Engine,
    group_id: &str,
    body: &str,
    header_media: Option<HeaderMediaSpec>,
) -> CoreResult<CampaignRecord> {
    let body = Body::new(body)?;
    let group = db::get_group(&engine.pool, engine.kind, group_id)
        .await?
        .ok_or_else(|| CoreError::not_found("group", group_id))?;
    if let Some(media) = &header_media {
        if !(media.url.starts_with("http://") || media.url.starts_with("https://")) {
            return Err(CoreError::Validation(vec![
                "header media url must be http(s)".to_string(),
            ]));
        }
    }

    let total = db::count_recipients(&engine.pool, engine.kind, group_id).await?;
    let now = engine.now();
    let record = CampaignRecord {
        id: uuid::Uuid::new_v4().to_string(),
        account_id: group.account_id,
        group_id: group.id,
        body: body.text().to_string(),
        header_media,
        header_media_id: None,
        send_path: None,
        status: CampaignStatus::Draft,
        anchor_message_id: None,
        pending_template_id: None,
        counters: CampaignCounters {
            total,
            ..CampaignCounters::default()
        },
        created_at: now,
        updated_at: now,
    };
    db::insert_campaign(&engine.pool, engine.kind, &record).await?;
    info!(campaign_id = %record.id, total, "campaign created");
    Ok(record)
}

async fn load_campaign(engine: &Engine, campaign_id: &str) -> CoreResult<CampaignRecord> {
    db::get_campaign(&engine.pool, engine.kind, campaign_id)
        .await?
        .ok_or_else(|| CoreError::not_found("campaign", campaign_id))
}

/// Uploads the campaign's header media once and returns the reusable handle.
async fn ensure_header_media(
    engine: &Engine,
    campaign: &CampaignRecord,
) -> CoreResult<Option<(MediaFormat, String)>> {
    let Some(spec) = campaign.header_media.as_ref() else {
        return Ok(None);
    };
    let format = MediaFormat::from_mime(&spec.mime_type);
    if let Some(media_id) = campaign.header_media_id.as_ref() {
        return Ok(Some((format, media_id.clone())));
    }

    let policy = engine.retry_policy();
    let provider = engine.provider.clone();
    let bytes = with_retry(policy, "fetch_media", || provider.fetch_media(&spec.url)).await?;
    let media_id = with_retry(policy, "upload_media", || {
        provider.upload_media(bytes.clone(), &spec.mime_type)
    })
    .await?;
    db::set_campaign_media_id(&engine.pool, engine.kind, &campaign.id, &media_id).await?;
    info!(campaign_id = %campaign.id, media_id = %media_id, "header media uploaded");
    Ok(Some((format, media_id)))
}

/// Sends a campaign down whichever path its first recipient's window allows.
/// Returns once the path is claimed; the sends run as a background task.
pub async fn send_campaign(engine: &Engine, campaign_id: &str) -> CoreResult<CampaignSendResult> {
    let campaign = load_campaign(engine, campaign_id).await?;
    if let Some(path) = campaign.send_path {
        return Err(CoreError::Conflict(format!(
            "campaign {campaign_id} already sent via {path}"
        )));
    }

    let recipients = db::list_recipients(&engine.pool, engine.kind, &campaign.group_id).await?;
    let Some(representative) = recipients.first() else {
        return Err(CoreError::Validation(vec![
            "campaign group has no recipients".to_string(),
        ]));
    };

    let conversation = db::resolve_conversation(
        &engine.pool,
        engine.kind,
        &campaign.account_id,
        &representative.address,
        engine.now(),
    )
    .await?;
    let decision =
        window::classify(conversation.last_inbound_at, engine.now(), engine.free_window());
    info!(
        campaign_id,
        is_free = decision.is_free,
        recipients = recipients.len(),
        "campaign window decided"
    );

    if decision.is_free {
        send_campaign_free(engine, &campaign, &recipients).await
    } else {
        send_campaign_template(engine, &campaign, &recipients).await
    }
}

async fn claim_path(engine: &Engine, campaign_id: &str, path: SendPath) -> CoreResult<()> {
    if db::claim_send_path(&engine.pool, engine.kind, campaign_id, path, engine.now()).await? {
        Ok(())
    } else {
        Err(CoreError::Conflict(format!(
            "campaign {campaign_id} already has a send path"
        )))
    }
}

/// Puts a campaign whose setup failed back to draft.
async fn release_claim(engine: &Engine, campaign_id: &str) {
    let now = engine.now();
    if let Err(err) = db::reset_campaign_send(&engine.pool, engine.kind, campaign_id, now).await {
        error!(campaign_id, "releasing campaign after failed setup failed: {err:?}");
    }
}

/// Deletes a freshly submitted template that nothing ended up tracking.
async fn discard_template(engine: &Engine, name: Option<&str>) {
    let Some(name) = name else {
        return;
    };
    let provider = engine.provider.clone();
    let policy = engine.retry_policy();
    match with_retry(policy, "delete_template", || provider.delete_template(name)).await {
        Ok(()) => info!(template = name, "discarded untracked template"),
        Err(err) => warn!(template = name, "could not discard untracked template: {err}"),
    }
    engine.template_cache.invalidate();
}

/// One queued message and stat row per recipient, in group order. Returns
/// the first recipient's message.
async fn create_placeholders(
    engine: &Engine,
    campaign: &CampaignRecord,
    recipients: &[RecipientRecord],
) -> CoreResult<MessageRecord> {
    let mut first: Option<MessageRecord> = None;
    for recipient in recipients {
        let now = engine.now();
        let conversation = db::resolve_conversation(
            &engine.pool,
            engine.kind,
            &campaign.account_id,
            &recipient.address,
            now,
        )
        .await?;
        let message = MessageRecord::outbound(
            &campaign.account_id,
            &conversation.id,
            &campaign.body,
            Some(&campaign.id),
            now,
        );
        db::insert_message(&engine.pool, engine.kind, &message).await?;
        let stat = new_stat(campaign, recipient, &conversation.id, &message.id, engine);
        db::insert_recipient_stat(&engine.pool, engine.kind, &stat).await?;
        if first.is_none() {
            first = Some(message);
        }
    }
    first.ok_or_else(|| CoreError::Validation(vec!["campaign group has no recipients".to_string()]))
}

fn new_stat(
    campaign: &CampaignRecord,
    recipient: &RecipientRecord,
    conversation_id: &str,
    message_id: &str,
    engine: &Engine,
) -> RecipientStatRecord {
    RecipientStatRecord {
        id: uuid::Uuid::new_v4().to_string(),
        campaign_id: campaign.id.clone(),
        recipient_id: recipient.id.clone(),
        address: recipient.address.clone(),
        position: recipient.position,
        conversation_id: Some(conversation_id.to_string()),
        message_id: Some(message_id.to_string()),
        sent_at: None,
        delivered_at: None,
        read_at: None,
        replied_at: None,
        failed_at: None,
        error: None,
        created_at: engine.now(),
    }
}

async fn send_campaign_free(
    engine: &Engine,
    campaign: &CampaignRecord,
    recipients: &[RecipientRecord],
) -> CoreResult<CampaignSendResult> {
    claim_path(engine, &campaign.id, SendPath::Free).await?;
    if let Err(err) = create_placeholders(engine, campaign, recipients).await {
        warn!(campaign_id = %campaign.id, "campaign setup failed, releasing it: {err}");
        release_claim(engine, &campaign.id).await;
        return Err(err);
    }

    let fan_out_started = start_fan_out(engine, &campaign.id);
    let counters = recompute_logged(engine, &campaign.id, campaign.counters).await;
    Ok(CampaignSendResult {
        campaign_id: campaign.id.clone(),
        send_path: SendPath::Free,
        status: CampaignStatus::Sending,
        fan_out_started,
        template: None,
        counters,
    })
}

async fn send_campaign_template(
    engine: &Engine,
    campaign: &CampaignRecord,
    recipients: &[RecipientRecord],
) -> CoreResult<CampaignSendResult> {
    let mut content = TemplateContent::body_only(Body::new(&campaign.body)?);
    if let Some((format, handle)) = ensure_header_media(engine, campaign).await? {
        content.header = Some(Header::media(format, &handle)?);
    }

    let plan = poller::prepare_template(engine, &campaign.account_id, &content).await?;
    let submitted = plan.submitted_name().map(str::to_string);
    if let Err(err) = claim_path(engine, &campaign.id, SendPath::Template).await {
        discard_template(engine, submitted.as_deref()).await;
        return Err(err);
    }

    let template = match attach_template(engine, campaign, recipients, plan).await {
        Ok(template) => template,
        Err(err) => {
            warn!(campaign_id = %campaign.id, "campaign setup failed, releasing it: {err}");
            release_claim(engine, &campaign.id).await;
            discard_template(engine, submitted.as_deref()).await;
            return Err(err);
        }
    };
    info!(
        campaign_id = %campaign.id,
        template = %template.name,
        status = %template.status,
        "campaign waiting on template"
    );

    let mut status = CampaignStatus::AwaitingTemplate;
    let mut fan_out_started = false;
    match template.status {
        TemplateStatus::Approved => {
            let now = engine.now();
            status = CampaignStatus::Sending;
            db::set_campaign_status(&engine.pool, engine.kind, &campaign.id, status, now).await?;
            fan_out_started = start_fan_out(engine, &campaign.id);
        }
        TemplateStatus::Pending => {
            poller::start_polling(engine, &template.id);
        }
        TemplateStatus::Rejected => {}
    }
    let counters = recompute_logged(engine, &campaign.id, campaign.counters).await;

    Ok(CampaignSendResult {
        campaign_id: campaign.id.clone(),
        send_path: SendPath::Template,
        status,
        fan_out_started,
        template: Some(template),
        counters,
    })
}

/// Placeholders, the tracking record and the campaign link, in that order.
/// The first recipient's placeholder doubles as the anchor message.
async fn attach_template(
    engine: &Engine,
    campaign: &CampaignRecord,
    recipients: &[RecipientRecord],
    plan: TemplatePlan,
) -> CoreResult<PendingTemplateRecord> {
    let anchor = create_placeholders(engine, campaign, recipients).await?;
    let account_id = &campaign.account_id;
    let template =
        poller::record_template(engine, account_id, plan, &anchor.id, Some(&campaign.id)).await?;
    db::set_campaign_template(
        &engine.pool,
        engine.kind,
        &campaign.id,
        &anchor.id,
        &template.id,
        engine.now(),
    )
    .await?;
    Ok(template)
}

pub fn fan_out_key(campaign_id: &str) -> String {
    format!("campaign:{campaign_id}")
}

/// Runs [`fan_out`] as a background task keyed by campaign. Returns `false`
/// when one is already running or shutdown has begun.
pub fn start_fan_out(engine: &Engine, campaign_id: &str) -> bool {
    let task_engine = engine.clone();
    let id = campaign_id.to_string();
    let started = engine.tasks.spawn(&fan_out_key(campaign_id), async move {
        match fan_out(&task_engine, &id).await {
            Ok(report) => info!(
                campaign_id = %id,
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                "campaign fan-out finished"
            ),
            Err(err) => error!(campaign_id = %id, "campaign fan-out failed: {err}"),
        }
    });
    if !started {
        warn!(campaign_id, "campaign fan-out not started");
    }
    started
}

/// Restarts fan-outs for campaigns a previous process left mid-send.
pub async fn resume_fan_outs(engine: &Engine) -> CoreResult<usize> {
    let sending =
        db::list_campaigns_with_status(&engine.pool, engine.kind, CampaignStatus::Sending).await?;
    let mut started = 0;
    for campaign in sending {
        // Claimed but never linked to a template: setup died half-way.
        let template_path = campaign.send_path == Some(SendPath::Template);
        if template_path && campaign.pending_template_id.is_none() {
            warn!(campaign_id = %campaign.id, "skipping campaign with unfinished template setup");
            continue;
        }
        if start_fan_out(engine, &campaign.id) {
            started += 1;
        }
    }
    if started > 0 {
        info!(count = started, "resumed campaign fan-outs");
    }
    Ok(started)
}

enum Delivery {
    Free,
    Template {
        template: PendingTemplateRecord,
        parameters: SendParameters,
    },
}

async fn template_delivery(engine: &Engine, campaign: &CampaignRecord) -> CoreResult<Delivery> {
    let template_id = campaign.pending_template_id.as_deref().ok_or_else(|| {
        CoreError::Conflict(format!("campaign {} has no template", campaign.id))
    })?;
    let template = db::get_pending_template(&engine.pool, engine.kind, template_id)
        .await?
        .ok_or_else(|| CoreError::not_found("template", template_id))?;
    if template.status != TemplateStatus::Approved {
        return Err(CoreError::Conflict(format!(
            "template {} is {}",
            template.name, template.status
        )));
    }

    match ensure_header_media(engine, campaign).await {
        Ok(header_media) => Ok(Delivery::Template {
            template,
            parameters: SendParameters { header_media },
        }),
        Err(err) => {
            let reason = format!("header media unavailable: {err}");
            let (pool, kind, id) = (&engine.pool, engine.kind, campaign.id.as_str());
            let now = engine.now();
            db::fail_pending_stats(pool, kind, id, &reason, now).await?;
            db::fail_queued_campaign_messages(pool, kind, id, &reason, now).await?;
            db::set_campaign_status(pool, kind, id, CampaignStatus::Failed, now).await?;
            recompute_logged(engine, id, campaign.counters).await;
            Err(err)
        }
    }
}

/// Sends every placeholder of a claimed campaign that has not gone out yet.
/// One recipient's failure never stops the loop.
pub async fn fan_out(engine: &Engine, campaign_id: &str) -> CoreResult<SendReport> {
    let campaign = load_campaign(engine, campaign_id).await?;
    let delivery = match campaign.send_path {
        Some(SendPath::Free) => Delivery::Free,
        Some(SendPath::Template) => template_delivery(engine, &campaign).await?,
        None => {
            return Err(CoreError::Conflict(format!(
                "campaign {campaign_id} has no send path"
            )))
        }
    };

    let (pool, kind) = (&engine.pool, engine.kind);
    let now = engine.now();
    db::set_campaign_status(pool, kind, campaign_id, CampaignStatus::Sending, now).await?;
    let stats = db::list_recipient_stats(pool, kind, campaign_id).await?;

    let mut report = SendReport::default();
    for stat in &stats {
        if stat.sent_at.is_some() || stat.failed_at.is_some() {
            report.skipped += 1;
            continue;
        }
        if engine.tasks.is_shutting_down() {
            info!(campaign_id, attempted = report.attempted, "fan-out paused for shutdown");
            recompute_logged(engine, campaign_id, campaign.counters).await;
            return Ok(report);
        }
        pace(engine, report.attempted).await;
        report.attempted += 1;
        match send_to_stat(engine, stat, &delivery).await {
            Ok(Some(true)) => report.sent += 1,
            Ok(Some(false)) => report.failed += 1,
            Ok(None) => {
                report.attempted -= 1;
                report.skipped += 1;
            }
            Err(err) => {
                error!(campaign_id, address = %stat.address, "recipient send aborted: {err}");
                let reason = err.to_string();
                let now = engine.now();
                let marked = db::mark_stat_failed(pool, kind, &stat.id, &reason, now).await;
                if let Err(mark_err) = marked {
                    error!(
                        campaign_id,
                        stat_id = %stat.id,
                        "recording recipient failure failed: {mark_err:?}"
                    );
                }
                report.failed += 1;
            }
        }
    }

    let now = engine.now();
    db::set_campaign_status(pool, kind, campaign_id, CampaignStatus::Completed, now).await?;
    recompute_logged(engine, campaign_id, campaign.counters).await;
    if report.is_partial_failure() {
        warn!(
            campaign_id,
            failed = report.failed,
            sent = report.sent,
            "campaign finished with failures"
        );
    }
    Ok(report)
}

/// `Some(true)` sent, `Some(false)` failed, `None` already handled elsewhere.
async fn send_to_stat(
    engine: &Engine,
    stat: &RecipientStatRecord,
    delivery: &Delivery,
) -> CoreResult<Option<bool>> {
    let Some(message_id) = stat.message_id.as_deref() else {
        return Ok(None);
    };
    let message = db::get_message(&engine.pool, engine.kind, message_id)
        .await?
        .ok_or_else(|| CoreError::not_found("message", message_id))?;

    let send_kind = match delivery {
        Delivery::Free => SendKind::Free,
        Delivery::Template {
            template,
            parameters,
        } => SendKind::Template {
            name: &template.name,
            language: &template.language,
            parameters,
        },
    };
    let (pool, kind) = (&engine.pool, engine.kind);
    match dispatcher::dispatch(engine, &message, &stat.address, send_kind).await? {
        DispatchOutcome::Sent { .. } => {
            db::mark_stat_sent(pool, kind, &stat.id, engine.now()).await?;
            Ok(Some(true))
        }
        DispatchOutcome::Failed { error } => {
            let reason = error.to_string();
            db::mark_stat_failed(pool, kind, &stat.id, &reason, engine.now()).await?;
            Ok(Some(false))
        }
        DispatchOutcome::AlreadyDispatched => Ok(None),
    }
}

async fn recompute_logged(
    engine: &Engine,
    campaign_id: &str,
    fallback: CampaignCounters,
) -> CampaignCounters {
    match status::recompute_campaign(engine, campaign_id).await {
        Ok(counters) => counters,
        Err(err) => {
            error!(campaign_id, "campaign recompute failed: {err:?}");
            fallback
        }
    }
}

/// Sends one message, free-form when the window is open and through a
/// template otherwise.
pub async fn send_message(
    engine: &Engine,
    account_id: &str,
    to: &str,
    body: &str,
) -> CoreResult<MessageSendResult> {
    let body = Body::new(body)?;
    let address = normalize_address(to)
        .ok_or_else(|| CoreError::Validation(vec!["recipient address is empty".to_string()]))?;

    let now = engine.now();
    let conversation =
        db::resolve_conversation(&engine.pool, engine.kind, account_id, &address, now).await?;
    let decision = window::classify(conversation.last_inbound_at, now, engine.free_window());

    if decision.is_free {
        let message = MessageRecord::outbound(account_id, &conversation.id, body.text(), None, now);
        db::insert_message(&engine.pool, engine.kind, &message).await?;
        let outcome = dispatcher::send_free(engine, &message, &address).await?;
        if let DispatchOutcome::Failed { error } = outcome {
            return Err(error);
        }
        let message = reload_message(engine, &message.id).await?;
        return Ok(MessageSendResult {
            message,
            send_path: SendPath::Free,
            template: None,
        });
    }

    let content = TemplateContent::body_only(body.clone());
    let plan = poller::prepare_template(engine, account_id, &content).await?;
    let message =
        MessageRecord::outbound(account_id, &conversation.id, body.text(), None, engine.now());
    db::insert_message(&engine.pool, engine.kind, &message).await?;
    let template = poller::record_template(engine, account_id, plan, &message.id, None).await?;

    match template.status {
        TemplateStatus::Approved => {
            let outcome = dispatcher::send_template(
                engine,
                &message,
                &address,
                &template.name,
                &template.language,
                &SendParameters::default(),
            )
            .await?;
            if let DispatchOutcome::Failed { error } = outcome {
                return Err(error);
            }
        }
        TemplateStatus::Pending => {
            poller::start_polling(engine, &template.id);
        }
        TemplateStatus::Rejected => {
            let reason = template
                .rejection_reason
                .as_deref()
                .unwrap_or("template rejected by provider");
            let now = engine.now();
            db::mark_message_failed(&engine.pool, engine.kind, &message.id, reason, now).await?;
        }
    }

    let message = reload_message(engine, &message.id).await?;
    Ok(MessageSendResult {
        message,
        send_path: SendPath::Template,
        template: Some(template),
    })
}

async fn reload_message(engine: &Engine, id: &str) -> CoreResult<MessageRecord> {
    db::get_message(&engine.pool, engine.kind, id)
        .await?
        .ok_or_else(|| CoreError::not_found("message", id))
}

/// Placeholder messages that are still waiting, for status views.
pub fn queued_count(messages: &[MessageRecord]) -> usize {
    messages
        .iter()
        .filter(|m| m.status == MessageStatus::Queued)
        .count()
}
