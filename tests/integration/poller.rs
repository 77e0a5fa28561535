mod common;

use campaign_relay::broadcast;
use campaign_relay::db;
use campaign_relay::templates::poller::{self, CheckOutcome};
use campaign_relay::types::{MessageStatus, SendPath, TemplateStatus, TemplateStatusEvent};
use campaign_relay::Engine;
use common::{harness, harness_with, test_config, Harness, ACCOUNT};
use std::sync::Arc;
use std::time::Duration;

async fn wait_until_stopped(engine: &Engine, template_id: &str) {
    let key = format!("template:{template_id}");
    for _ in 0..200 {
        if !engine.tasks.is_running(&key) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("poller for {template_id} never stopped");
}

async fn queue_single(
    h: &Harness,
    to: &str,
    text: &str,
) -> campaign_relay::broadcast::MessageSendResult {
    let result = broadcast::send_message(&h.engine, ACCOUNT, to, text).await.unwrap();
    assert_eq!(result.send_path, SendPath::Template);
    assert_eq!(result.message.status, MessageStatus::Queued);
    result
}

#[tokio::test]
async fn test_single_message_sent_once_after_approval() {
    let h = harness().await;
    let result = queue_single(&h, "15550100", "Your order has shipped").await;
    let template = result.template.unwrap();
    assert!(h.engine.tasks.is_running(&format!("template:{}", template.id)));

    assert_eq!(
        poller::check_template(&h.engine, &template.id).await.unwrap(),
        CheckOutcome::StillPending
    );
    assert!(h.provider.sent_templates().is_empty());

    h.provider.set_template_status(&template.name, "APPROVED", None);
    assert_eq!(
        poller::check_template(&h.engine, &template.id).await.unwrap(),
        CheckOutcome::Transitioned(TemplateStatus::Approved)
    );

    let message = db::get_message(&h.engine.pool, h.engine.kind, &result.message.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.template_name.as_deref(), Some(template.name.as_str()));
    assert!(message.provider_message_id.is_some());

    // A late poll and a pushed event for the same approval change nothing.
    poller::check_template(&h.engine, &template.id).await.unwrap();
    let event = TemplateStatusEvent {
        provider_template_id: template.provider_template_id.clone(),
        name: Some(template.name.clone()),
        status: TemplateStatus::Approved,
        reason: None,
    };
    assert_eq!(poller::apply_template_event(&h.engine, &event).await.unwrap(), 0);

    let sends = h.provider.sent_templates();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].to, "15550100");
    assert_eq!(sends[0].language, "en_US");
}

#[tokio::test]
async fn test_pushed_rejection_fails_the_message() {
    let h = harness().await;
    let result = queue_single(&h, "15550101", "Claim your reward").await;
    let template = result.template.unwrap();

    let event = TemplateStatusEvent {
        provider_template_id: None,
        name: Some(template.name.clone()),
        status: TemplateStatus::Rejected,
        reason: Some("PROMOTIONAL".to_string()),
    };
    assert_eq!(poller::apply_template_event(&h.engine, &event).await.unwrap(), 1);

    let message = db::get_message(&h.engine.pool, h.engine.kind, &result.message.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.error.as_deref(), Some("PROMOTIONAL"));
    assert_eq!(
        poller::check_template(&h.engine, &template.id).await.unwrap(),
        CheckOutcome::AlreadyTerminal(TemplateStatus::Rejected)
    );
}

#[tokio::test]
async fn test_template_missing_upstream_stops_polling() {
    let h = harness().await;
    let template = queue_single(&h, "15550102", "Appointment reminder").await.template.unwrap();
    h.provider.remove_template(&template.name);
    let outcome = poller::check_template(&h.engine, &template.id).await.unwrap();
    assert_eq!(outcome, CheckOutcome::NotFound);
    assert!(outcome.stops_polling());
}

#[tokio::test]
async fn test_unknown_template_id_is_not_found() {
    let h = harness().await;
    assert_eq!(
        poller::check_template(&h.engine, "missing").await.unwrap(),
        CheckOutcome::NotFound
    );
}

#[tokio::test]
async fn test_background_poller_dispatches_after_approval() {
    let mut config = test_config();
    config.poller.initial_delay_seconds = 0;
    config.poller.interval_seconds = 1;
    config.poller.max_attempts = 5;
    let h = harness_with(config).await;

    let result = queue_single(&h, "15550103", "Table for two confirmed").await;
    let template = result.template.unwrap();
    h.provider.set_template_status(&template.name, "APPROVED", None);

    wait_until_stopped(&h.engine, &template.id).await;
    assert_eq!(h.provider.sent_templates().len(), 1);
    let record = db::get_pending_template(&h.engine.pool, h.engine.kind, &template.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TemplateStatus::Approved);
    assert!(record.check_attempts >= 1);
}

#[tokio::test]
async fn test_poller_gives_up_and_leaves_template_pending() {
    let mut config = test_config();
    config.poller.initial_delay_seconds = 0;
    config.poller.interval_seconds = 0;
    config.poller.max_attempts = 2;
    let h = harness_with(config).await;

    let result = queue_single(&h, "15550104", "We miss you").await;
    let template = result.template.unwrap();
    wait_until_stopped(&h.engine, &template.id).await;

    let record = db::get_pending_template(&h.engine.pool, h.engine.kind, &template.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TemplateStatus::Pending);
    assert_eq!(record.check_attempts, 3);
    let message = db::get_message(&h.engine.pool, h.engine.kind, &result.message.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.status, MessageStatus::Queued);
    assert!(h.provider.sent_templates().is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_sleeping_pollers() {
    let h = harness().await;
    let template = queue_single(&h, "15550105", "See you soon").await.template.unwrap();
    assert_eq!(h.engine.tasks.active(), 1);

    h.engine.tasks.shutdown(Duration::from_secs(2)).await;
    assert_eq!(h.engine.tasks.active(), 0);
    assert!(!poller::start_polling(&h.engine, &template.id));
}

#[tokio::test]
async fn test_resume_only_picks_templates_inside_the_window() {
    let mut config = test_config();
    config.poller.interval_seconds = 300;
    config.poller.max_attempts = 288;
    let h = harness_with(config.clone()).await;

    let old = queue_single(&h, "15550106", "Old news").await.template.unwrap();
    h.clock.advance(chrono::Duration::hours(25));
    let fresh = queue_single(&h, "15550107", "Fresh news").await.template.unwrap();

    let restarted = Engine::new(
        h.engine.pool.clone(),
        h.engine.kind,
        h.provider.clone(),
        Arc::new(h.clock.clone()),
        config,
    );
    assert_eq!(poller::resume_pollers(&restarted).await.unwrap(), 1);
    assert!(restarted.tasks.is_running(&format!("template:{}", fresh.id)));
    assert!(!restarted.tasks.is_running(&format!("template:{}", old.id)));
    restarted.tasks.shutdown(Duration::from_secs(1)).await;
}
