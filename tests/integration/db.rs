use campaign_relay::db::{
    self, CampaignCounters, CampaignRecord, DbKind, MessageRecord, RecipientStatRecord,
};
use campaign_relay::db::PendingTemplateRecord;
use campaign_relay::templates::dedup;
use campaign_relay::types::{
    Body, CampaignStatus, HeaderMediaSpec, MessageStatus, SendPath, TemplateContent, TemplateStatus,
};
use chrono::{Duration, TimeZone, Utc};
use sqlx::AnyPool;
use tempfile::TempDir;

async fn create_test_pool(dir: &TempDir) -> (AnyPool, DbKind) {
    sqlx::any::install_default_drivers();
    let db_path = dir.path().join("test.db");
    let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
    let pool = AnyPool::connect(&db_url).await.unwrap();
    let kind = DbKind::Sqlite;
    db::init_db(&pool, kind).await.unwrap();
    (pool, kind)
}

fn campaign(id: &str, group_id: &str) -> CampaignRecord {
    let now = Utc::now();
    CampaignRecord {
        id: id.to_string(),
        account_id: "acct".to_string(),
        group_id: group_id.to_string(),
        body: "Hello".to_string(),
        header_media: Some(HeaderMediaSpec {
            url: "https://cdn.example/a.png".to_string(),
            mime_type: "image/png".to_string(),
        }),
        header_media_id: None,
        send_path: None,
        status: CampaignStatus::Draft,
        anchor_message_id: None,
        pending_template_id: None,
        counters: CampaignCounters {
            total: 2,
            ..CampaignCounters::default()
        },
        created_at: now,
        updated_at: now,
    }
}

fn stat(id: &str, campaign_id: &str, address: &str, position: i64) -> RecipientStatRecord {
    RecipientStatRecord {
        id: id.to_string(),
        campaign_id: campaign_id.to_string(),
        recipient_id: format!("r-{id}"),
        address: address.to_string(),
        position,
        conversation_id: None,
        message_id: None,
        sent_at: None,
        delivered_at: None,
        read_at: None,
        replied_at: None,
        failed_at: None,
        error: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_db_init_creates_tables() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let tables = [
        "conversations",
        "messages",
        "pending_templates",
        "campaigns",
        "recipient_stats",
        "status_events",
    ];
    for table in tables {
        assert_eq!(db::count_rows(&pool, table).await.unwrap(), 0, "{table}");
    }
    // Re-running is harmless.
    db::init_db(&pool, kind).await.unwrap();
}

#[tokio::test]
async fn test_resolve_conversation_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let now = Utc::now();

    let first = db::resolve_conversation(&pool, kind, "acct", "15550100", now).await.unwrap();
    let second = db::resolve_conversation(&pool, kind, "acct", "15550100", now).await.unwrap();
    assert_eq!(first.id, second.id);
    assert!(first.last_inbound_at.is_none());

    let other = db::resolve_conversation(&pool, kind, "other", "15550100", now).await.unwrap();
    assert_ne!(first.id, other.id);
}

#[tokio::test]
async fn test_inbound_activity_keeps_latest_time() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let later = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    let earlier = later - Duration::hours(3);

    db::record_inbound_activity(&pool, kind, "acct", "15550100", later).await.unwrap();
    let conv = db::record_inbound_activity(&pool, kind, "acct", "15550100", earlier).await.unwrap();
    assert_eq!(conv.last_inbound_at, Some(later));
}

#[tokio::test]
async fn test_message_dispatch_claim_is_one_shot() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let now = Utc::now();
    let conv = db::resolve_conversation(&pool, kind, "acct", "15550100", now).await.unwrap();
    let message = MessageRecord::outbound("acct", &conv.id, "hi", None, now);
    db::insert_message(&pool, kind, &message).await.unwrap();

    let queued = db::list_queued_single_messages(&pool, kind, &conv.id).await.unwrap();
    assert_eq!(queued.len(), 1);

    assert!(db::claim_message_dispatch(&pool, kind, &message.id, now).await.unwrap());
    assert!(!db::claim_message_dispatch(&pool, kind, &message.id, now).await.unwrap());
    assert!(db::list_queued_single_messages(&pool, kind, &conv.id).await.unwrap().is_empty());

    db::mark_message_sent(&pool, kind, &message.id, "wamid.1", Some("tpl_a"), now).await.unwrap();
    let stored = db::find_message_by_provider_id(&pool, kind, "wamid.1").await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
    assert_eq!(stored.template_name.as_deref(), Some("tpl_a"));
    assert!(stored.dispatch_claimed);
}

#[tokio::test]
async fn test_inbound_upsert_dedups_on_provider_id() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let now = Utc::now();
    let conv = db::resolve_conversation(&pool, kind, "acct", "15550100", now).await.unwrap();

    let mut record = MessageRecord::outbound("acct", &conv.id, "hello", None, now);
    record.direction = campaign_relay::types::Direction::Inbound;
    record.provider_message_id = Some("wamid.in".to_string());
    assert!(db::upsert_inbound_message(&pool, kind, &record).await.unwrap());

    record.id = "another-id".to_string();
    assert!(!db::upsert_inbound_message(&pool, kind, &record).await.unwrap());
    assert_eq!(db::count_rows(&pool, "messages").await.unwrap(), 1);
}

#[tokio::test]
async fn test_recipients_keep_insertion_order() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let now = Utc::now();

    for address in ["300", "100", "200", "100"] {
        db::insert_recipient(&pool, kind, "g1", address, None, now).await.unwrap();
    }
    let recipients = db::list_recipients(&pool, kind, "g1").await.unwrap();
    let addresses: Vec<&str> = recipients.iter().map(|r| r.address.as_str()).collect();
    assert_eq!(addresses, vec!["300", "100", "200"]);
    assert_eq!(recipients.iter().map(|r| r.position).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(db::count_recipients(&pool, kind, "g1").await.unwrap(), 3);
}

#[tokio::test]
async fn test_campaign_round_trip_and_send_path_claim() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    db::insert_campaign(&pool, kind, &campaign("c1", "g1")).await.unwrap();

    let stored = db::get_campaign(&pool, kind, "c1").await.unwrap().unwrap();
    assert_eq!(stored.counters.total, 2);
    assert_eq!(stored.header_media.unwrap().mime_type, "image/png");
    assert!(stored.send_path.is_none());

    let now = Utc::now();
    assert!(db::claim_send_path(&pool, kind, "c1", SendPath::Template, now).await.unwrap());
    assert!(!db::claim_send_path(&pool, kind, "c1", SendPath::Free, now).await.unwrap());

    let stored = db::get_campaign(&pool, kind, "c1").await.unwrap().unwrap();
    assert_eq!(stored.send_path, Some(SendPath::Template));
    assert_eq!(stored.status, CampaignStatus::Sending);

    let counters = CampaignCounters {
        total: 2,
        sent: 2,
        delivered: 1,
        read: 1,
        replied: 0,
        failed: 0,
    };
    db::write_campaign_counters(&pool, kind, "c1", &counters, now).await.unwrap();
    assert_eq!(db::get_campaign(&pool, kind, "c1").await.unwrap().unwrap().counters, counters);
}

#[tokio::test]
async fn test_reset_campaign_send_keeps_claimed_messages() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let now = Utc::now();
    db::insert_campaign(&pool, kind, &campaign("c1", "g1")).await.unwrap();
    assert!(db::claim_send_path(&pool, kind, "c1", SendPath::Free, now).await.unwrap());
    let sending = db::list_campaigns_with_status(&pool, kind, CampaignStatus::Sending).await;
    assert_eq!(sending.unwrap().len(), 1);

    let conv = db::resolve_conversation(&pool, kind, "acct", "100", now).await.unwrap();
    let queued = MessageRecord::outbound("acct", &conv.id, "Hello", Some("c1"), now);
    let claimed = MessageRecord::outbound("acct", &conv.id, "Hello", Some("c1"), now);
    db::insert_message(&pool, kind, &queued).await.unwrap();
    db::insert_message(&pool, kind, &claimed).await.unwrap();
    assert!(db::claim_message_dispatch(&pool, kind, &claimed.id, now).await.unwrap());
    db::insert_recipient_stat(&pool, kind, &stat("s1", "c1", "100", 1)).await.unwrap();

    db::reset_campaign_send(&pool, kind, "c1", now).await.unwrap();

    let stored = db::get_campaign(&pool, kind, "c1").await.unwrap().unwrap();
    assert!(stored.send_path.is_none());
    assert_eq!(stored.status, CampaignStatus::Draft);
    assert!(db::list_recipient_stats(&pool, kind, "c1").await.unwrap().is_empty());
    let left = db::list_campaign_messages(&pool, kind, "c1").await.unwrap();
    assert_eq!(left.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec![claimed.id.as_str()]);
    let sending = db::list_campaigns_with_status(&pool, kind, CampaignStatus::Sending).await;
    assert!(sending.unwrap().is_empty());
}

#[tokio::test]
async fn test_stat_failure_never_overrides_delivery() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let now = Utc::now();
    db::insert_recipient_stat(&pool, kind, &stat("s1", "c1", "100", 1)).await.unwrap();
    db::insert_recipient_stat(&pool, kind, &stat("s2", "c1", "200", 2)).await.unwrap();

    let mut delivered = stat("s1", "c1", "100", 1);
    delivered.sent_at = Some(now);
    delivered.delivered_at = Some(now);
    let mut conn = pool.acquire().await.unwrap();
    db::update_stat_delivery(&mut conn, kind, &delivered).await.unwrap();
    drop(conn);

    db::mark_stat_failed(&pool, kind, "s1", "late failure", now).await.unwrap();
    assert_eq!(db::fail_pending_stats(&pool, kind, "c1", "rejected", now).await.unwrap(), 1);

    let stats = db::list_recipient_stats(&pool, kind, "c1").await.unwrap();
    assert!(stats[0].failed_at.is_none());
    assert_eq!(stats[1].error.as_deref(), Some("rejected"));

    // Sent after failure does not resurrect the row.
    db::mark_stat_sent(&pool, kind, "s2", now).await.unwrap();
    let stats = db::list_recipient_stats(&pool, kind, "c1").await.unwrap();
    assert!(stats[1].sent_at.is_none());
}

#[tokio::test]
async fn test_status_events_dedup_per_status() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let now = Utc::now();
    let mut conn = pool.acquire().await.unwrap();
    let first = db::record_status_event(&mut conn, kind, "wamid.1", "delivered", now, now).await;
    assert!(first.unwrap());
    let repeat = db::record_status_event(&mut conn, kind, "wamid.1", "delivered", now, now).await;
    assert!(!repeat.unwrap());
    let read = db::record_status_event(&mut conn, kind, "wamid.1", "read", now, now).await;
    assert!(read.unwrap());
}

#[tokio::test]
async fn test_latest_reply_requires_a_prior_send() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let now = Utc::now();
    db::insert_campaign(&pool, kind, &campaign("c1", "g1")).await.unwrap();
    db::insert_recipient_stat(&pool, kind, &stat("s1", "c1", "100", 1)).await.unwrap();

    assert!(db::mark_latest_reply(&pool, kind, "acct", "100", now).await.unwrap().is_none());

    db::mark_stat_sent(&pool, kind, "s1", now - Duration::minutes(1)).await.unwrap();
    assert_eq!(
        db::mark_latest_reply(&pool, kind, "acct", "100", now).await.unwrap().as_deref(),
        Some("c1")
    );
    assert!(db::mark_latest_reply(&pool, kind, "acct", "100", now).await.unwrap().is_none());
}

fn template_row(
    id: &str,
    content: &TemplateContent,
    status: TemplateStatus,
    created_at: chrono::DateTime<Utc>,
) -> PendingTemplateRecord {
    PendingTemplateRecord {
        id: id.to_string(),
        account_id: "acct".to_string(),
        message_id: format!("msg-{id}"),
        name: format!("promo_{id}"),
        language: "en_US".to_string(),
        category: "MARKETING".to_string(),
        content_hash: dedup::content_hash(content),
        body: content.body.text().to_string(),
        components: content.creation_json(),
        provider_template_id: Some(format!("tpl-{id}")),
        status,
        rejection_reason: None,
        reused_template_id: None,
        campaign_id: None,
        check_attempts: 0,
        last_checked_at: None,
        created_at,
        updated_at: created_at,
    }
}

#[tokio::test]
async fn test_find_reusable_prefers_approved_within_lookback() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let content = TemplateContent::body_only(Body::new("Spring sale starts today").unwrap());

    let stale = template_row("old", &content, TemplateStatus::Approved, now - Duration::days(120));
    let pending =
        template_row("pending", &content, TemplateStatus::Pending, now - Duration::days(2));
    let approved =
        template_row("approved", &content, TemplateStatus::Approved, now - Duration::days(5));
    let rejected =
        template_row("rejected", &content, TemplateStatus::Rejected, now - Duration::days(1));
    for row in [&stale, &pending, &approved, &rejected] {
        db::insert_pending_template(&pool, kind, row).await.unwrap();
    }

    let spaced = TemplateContent::body_only(Body::new("SPRING   sale starts\ntoday").unwrap());
    let found = dedup::find_reusable(&pool, kind, "acct", &spaced, 90, now).await.unwrap().unwrap();
    assert_eq!(found.id, "approved");

    let other = TemplateContent::body_only(Body::new("Summer sale starts today").unwrap());
    assert!(dedup::find_reusable(&pool, kind, "acct", &other, 90, now).await.unwrap().is_none());
    let elsewhere = dedup::find_reusable(&pool, kind, "other-acct", &content, 90, now).await;
    assert!(elsewhere.unwrap().is_none());
}

#[tokio::test]
async fn test_spam_risk_counts_recent_fresh_submissions() {
    let dir = TempDir::new().unwrap();
    let (pool, kind) = create_test_pool(&dir).await;
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let content = TemplateContent::body_only(Body::new("Flash deal").unwrap());

    for i in 0..3 {
        let submitted = now - Duration::minutes(10);
        let row = template_row(&format!("t{i}"), &content, TemplateStatus::Pending, submitted);
        db::insert_pending_template(&pool, kind, &row).await.unwrap();
    }
    let mut reused =
        template_row("reuse", &content, TemplateStatus::Pending, now - Duration::minutes(5));
    reused.reused_template_id = Some("t0".to_string());
    db::insert_pending_template(&pool, kind, &reused).await.unwrap();
    let old = template_row("old", &content, TemplateStatus::Pending, now - Duration::minutes(90));
    db::insert_pending_template(&pool, kind, &old).await.unwrap();

    let risk = dedup::estimate_spam_risk(&pool, kind, "acct", &content, 60, 3, now).await.unwrap();
    assert_eq!(risk.count, 3);
    assert!(risk.is_risk);

    let relaxed =
        dedup::estimate_spam_risk(&pool, kind, "acct", &content, 60, 10, now).await.unwrap();
    assert!(!relaxed.is_risk);
}
