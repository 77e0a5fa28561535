pub mod broadcast;
pub mod channels;
pub mod clock;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod retry;
pub mod status;
pub mod tasks;
pub mod templates;
pub mod types;
pub mod window;

pub use config::Config;
pub use error::{CoreError, CoreResult};

use self::broadcast::NewRecipient;
use self::channels::whatsapp::{self as whatsapp_channel, WhatsAppProvider};
use self::channels::MessagingProvider;
use self::clock::{Clock, SystemClock};
use self::config::{load_config, resolve_database_url};
use self::db::DbKind;
use self::retry::RetryPolicy;
use self::tasks::TaskRegistry;
use self::templates::cache::TemplateListCache;
use self::templates::poller;
use self::templates::validator::{self, TemplateRules};
use self::types::HeaderMediaSpec;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const AUTH_HEADER: &str = "X-Campaign-Relay-Token";

/// Shared handles every operation runs against.
#[derive(Clone)]
pub struct Engine {
    pub pool: AnyPool,
    pub kind: DbKind,
    pub provider: Arc<dyn MessagingProvider>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
    pub tasks: TaskRegistry,
    pub template_cache: Arc<TemplateListCache>,
}

impl Engine {
    pub fn new(
        pool: AnyPool,
        kind: DbKind,
        provider: Arc<dyn MessagingProvider>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        let ttl = Duration::seconds(config.templates.list_cache_ttl_seconds.max(0));
        let template_cache = Arc::new(TemplateListCache::new(ttl, clock.clone()));
        Self {
            pool,
            kind,
            provider,
            clock,
            config: Arc::new(config),
            tasks: TaskRegistry::new(),
            template_cache,
        }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub fn rules(&self) -> TemplateRules {
        TemplateRules::from(&self.config.templates)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.provider)
    }

    pub fn free_window(&self) -> Duration {
        Duration::hours(self.config.window.free_window_hours)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub conversations: i64,
    pub messages: i64,
    pub campaigns: i64,
    pub templates: i64,
    pub active_pollers: usize,
}

#[derive(Debug, Deserialize)]
pub struct ValidateTemplateRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub account_id: Option<String>,
    pub to: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub account_id: Option<String>,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddRecipientsRequest {
    pub recipients: Vec<NewRecipient>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub group_id: String,
    pub text: String,
    pub header_media: Option<HeaderMediaSpec>,
}

/// HTTP face of [`CoreError`].
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::ProviderRejection { .. } => StatusCode::BAD_GATEWAY,
            CoreError::ProviderTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Storage(err) => {
                error!("storage error: {err:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({"error": self.0.to_string(), "details": self.0.details()});
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn connect_database(config: &Config) -> anyhow::Result<(AnyPool, DbKind)> {
    sqlx::any::install_default_drivers();
    let db_url = resolve_database_url(config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;
    Ok((pool, db_kind))
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    let config = load_config();
    let (pool, db_kind) = connect_database(&config).await?;

    let provider = Arc::new(WhatsAppProvider::new(
        reqwest::Client::new(),
        config.provider.clone(),
    ));
    let engine = Engine::new(pool, db_kind, provider, Arc::new(SystemClock), config);

    match poller::resume_pollers(&engine).await {
        Ok(count) => info!(count, "template pollers resumed"),
        Err(err) => error!("could not resume template pollers: {err:?}"),
    }
    match broadcast::resume_fan_outs(&engine).await {
        Ok(count) => info!(count, "campaign fan-outs resumed"),
        Err(err) => error!("could not resume campaign fan-outs: {err:?}"),
    }

    let state = AppState { engine };
    let app = build_router(state.clone());
    Ok((state, app))
}

pub fn build_router(state: AppState) -> Router {
    let webhook_path = state.engine.config.provider.webhook_path.clone();

    let authed_routes = Router::new()
        .route("/v1/templates/validate", post(validate_template))
        .route("/v1/templates/:id", get(get_template))
        .route("/v1/templates/:id/check", post(check_template))
        .route("/v1/messages/send", post(send_message))
        .route("/v1/groups", post(create_group))
        .route("/v1/groups/:id/recipients", post(add_recipients))
        .route("/v1/campaigns", post(create_campaign))
        .route("/v1/campaigns/:id", get(get_campaign))
        .route("/v1/campaigns/:id/send", post(send_campaign))
        .route("/v1/campaigns/:id/recipients", get(list_campaign_recipients))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(service_status))
        .route(&webhook_path, get(verify_webhook).post(whatsapp_webhook));

    Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.engine.config.auth.token.as_ref() {
        let header = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

fn account_or_default(state: &AppState, account_id: Option<String>) -> String {
    account_id
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| state.engine.config.provider.account_id.clone())
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn service_status(State(state): State<AppState>) -> impl IntoResponse {
    let pool = &state.engine.pool;
    Json(StatusResponse {
        conversations: db::count_rows(pool, "conversations").await.unwrap_or(0),
        messages: db::count_rows(pool, "messages").await.unwrap_or(0),
        campaigns: db::count_rows(pool, "campaigns").await.unwrap_or(0),
        templates: db::count_rows(pool, "pending_templates").await.unwrap_or(0),
        active_pollers: state.engine.tasks.active(),
    })
}

async fn validate_template(
    State(state): State<AppState>,
    Json(req): Json<ValidateTemplateRequest>,
) -> impl IntoResponse {
    Json(validator::validate_text(&req.text, &state.engine.rules()))
}

async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let engine = &state.engine;
    let record = db::get_pending_template(&engine.pool, engine.kind, &id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::not_found("template", &id))?;
    Ok(Json(record))
}

async fn check_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = poller::check_template(&state.engine, &id).await?;
    Ok(Json(outcome))
}

async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let account_id = account_or_default(&state, req.account_id);
    let result = broadcast::send_message(&state.engine, &account_id, &req.to, &req.text).await?;
    Ok(Json(result))
}

async fn create_group(
    State(state): State<AppState>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<impl IntoResponse> {
    let account_id = account_or_default(&state, req.account_id);
    let group = broadcast::create_group(&state.engine, &account_id, &req.name).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn add_recipients(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AddRecipientsRequest>,
) -> ApiResult<impl IntoResponse> {
    let added = broadcast::add_recipients(&state.engine, &id, &req.recipients).await?;
    Ok(Json(json!({"group_id": id, "added": added})))
}

async fn create_campaign(
    State(state): State<AppState>,
    Json(req): Json<CreateCampaignRequest>,
) -> ApiResult<impl IntoResponse> {
    let campaign =
        broadcast::create_campaign(&state.engine, &req.group_id, &req.text, req.header_media)
            .await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let engine = &state.engine;
    let campaign = db::get_campaign(&engine.pool, engine.kind, &id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::not_found("campaign", &id))?;
    let messages = db::list_campaign_messages(&engine.pool, engine.kind, &id)
        .await
        .map_err(CoreError::from)?;
    Ok(Json(json!({
        "campaign": campaign,
        "queued_messages": broadcast::queued_count(&messages),
    })))
}

/// Claims the send path and answers 202; recipients are sent in the background.
async fn send_campaign(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let result = broadcast::send_campaign(&state.engine, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}

async fn list_campaign_recipients(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let engine = &state.engine;
    db::get_campaign(&engine.pool, engine.kind, &id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::not_found("campaign", &id))?;
    let stats = db::list_recipient_stats(&engine.pool, engine.kind, &id)
        .await
        .map_err(CoreError::from)?;
    Ok(Json(stats))
}

async fn verify_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let challenge = whatsapp_channel::verify_subscription(
        params.get("hub.mode").map(String::as_str),
        params.get("hub.verify_token").map(String::as_str),
        params.get("hub.challenge").map(String::as_str),
        state.engine.config.provider.verify_token.as_deref(),
    );
    match challenge {
        Some(challenge) => (StatusCode::OK, challenge).into_response(),
        None => StatusCode::FORBIDDEN.into_response(),
    }
}

/// Applies one webhook delivery. Any ingestion failure answers 500 so the
/// provider redelivers; events that did apply are deduplicated on the retry.
async fn whatsapp_webhook(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    let engine = &state.engine;
    let batch = whatsapp_channel::parse_webhook(&payload);
    if batch.is_empty() {
        return (StatusCode::OK, Json(json!({"status": "ignored"})));
    }

    let mut applied = 0;
    let mut failures = 0;
    for update in &batch.statuses {
        match status::ingest_status(engine, update).await {
            Ok(status::IngestOutcome::Applied) => applied += 1,
            Ok(_) => {}
            Err(err) => {
                failures += 1;
                error!(
                    provider_message_id = %update.provider_message_id,
                    "status ingest error: {err:?}"
                );
            }
        }
    }

    let account_id = engine.config.provider.account_id.clone();
    for inbound in &batch.inbound {
        if let Err(err) = status::ingest_inbound(engine, &account_id, inbound).await {
            failures += 1;
            error!(
                provider_message_id = %inbound.provider_message_id,
                "inbound ingest error: {err:?}"
            );
        }
    }

    for event in &batch.template_updates {
        match poller::apply_template_event(engine, event).await {
            Ok(0) => warn!(name = ?event.name, "template event matched no pending template"),
            Ok(_) => {}
            Err(err) => {
                failures += 1;
                error!(name = ?event.name, "template event error: {err:?}");
            }
        }
    }

    let status = if failures > 0 {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    let body = json!({
        "status": if failures > 0 { "retry" } else { "accepted" },
        "statuses_applied": applied,
        "inbound": batch.inbound.len(),
        "template_updates": batch.template_updates.len(),
        "failures": failures,
    });
    (status, Json(body))
}
