use super::{MessagingProvider, ProviderError, ProviderTemplate, TemplatePage, TemplateSubmission};
use crate::config::ProviderConfig;
use crate::types::{
    DeliveryStatus, InboundEvent, SendParameters, StatusUpdate, TemplateStatus,
    TemplateStatusEvent,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::debug;

const TEMPLATE_PAGE_SIZE: u32 = 100;
const TEMPLATE_FIELDS: &str = "id,name,status,category,language,components,rejected_reason";

/// WhatsApp Business Cloud API client.
#[derive(Clone)]
pub struct WhatsAppProvider {
    client: Client,
    config: ProviderConfig,
}

impl WhatsAppProvider {
    pub fn new(client: Client, config: ProviderConfig) -> Self {
        Self { client, config }
    }

    fn base(&self) -> String {
        format!(
            "{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.api_version
        )
    }

    fn phone_number_id(&self) -> Result<&str, ProviderError> {
        self.config
            .phone_number_id
            .as_deref()
            .ok_or_else(|| missing_setting("phone_number_id"))
    }

    fn business_account_id(&self) -> Result<&str, ProviderError> {
        self.config
            .business_account_id
            .as_deref()
            .ok_or_else(|| missing_setting("business_account_id"))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match self.config.access_token.as_ref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn execute(&self, req: RequestBuilder) -> Result<Value, ProviderError> {
        let resp = self.authed(req).send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let (code, message) = parse_graph_error(&body);
            return Err(ProviderError::from_status(status.as_u16(), code, message));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|err| ProviderError::Transient(format!("unreadable provider response: {err}")))
    }

    async fn send_payload(&self, payload: Value) -> Result<String, ProviderError> {
        let url = format!("{}/{}/messages", self.base(), self.phone_number_id()?);
        let value = self.execute(self.client.post(url).json(&payload)).await?;
        value
            .get("messages")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|m| m.get("id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::Transient(format!("send response without message id: {value}"))
            })
    }
}

fn missing_setting(name: &str) -> ProviderError {
    ProviderError::Rejected {
        code: None,
        message: format!("provider {name} not configured"),
    }
}

/// Pulls `error.code` and `error.message` out of a Graph API error body.
pub fn parse_graph_error(body: &str) -> (Option<i64>, String) {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));
    let code = error.and_then(|e| e.get("code")).and_then(|v| v.as_i64());
    let message = error
        .and_then(|e| e.get("error_user_msg").or_else(|| e.get("message")))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| body.to_string());
    (code, message)
}

#[async_trait]
impl MessagingProvider for WhatsAppProvider {
    async fn submit_template(
        &self,
        submission: &TemplateSubmission,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/{}/message_templates", self.base(), self.business_account_id()?);
        let value = self.execute(self.client.post(url).json(submission)).await?;
        value
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::Transient(format!("template response without id: {value}"))
            })
    }

    async fn list_templates(&self, after: Option<&str>) -> Result<TemplatePage, ProviderError> {
        let url = format!("{}/{}/message_templates", self.base(), self.business_account_id()?);
        let mut query = vec![
            ("limit", TEMPLATE_PAGE_SIZE.to_string()),
            ("fields", TEMPLATE_FIELDS.to_string()),
        ];
        if let Some(cursor) = after {
            query.push(("after", cursor.to_string()));
        }
        let value = self.execute(self.client.get(url).query(&query)).await?;
        Ok(parse_template_page(&value))
    }

    async fn delete_template(&self, name: &str) -> Result<(), ProviderError> {
        let url = format!("{}/{}/message_templates", self.base(), self.business_account_id()?);
        self.execute(self.client.delete(url).query(&[("name", name)])).await?;
        Ok(())
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<String, ProviderError> {
        self.send_payload(json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {"preview_url": false, "body": body},
        }))
        .await
    }

    async fn send_template(
        &self,
        to: &str,
        name: &str,
        language: &str,
        parameters: &SendParameters,
    ) -> Result<String, ProviderError> {
        self.send_payload(json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "template",
            "template": {
                "name": name,
                "language": {"code": language},
                "components": parameters.to_json(),
            },
        }))
        .await
    }

    async fn upload_media(&self, bytes: Bytes, mime_type: &str) -> Result<String, ProviderError> {
        let url = format!("{}/{}/media", self.base(), self.phone_number_id()?);
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name("header")
            .mime_str(mime_type)
            .map_err(|err| ProviderError::Rejected {
                code: None,
                message: format!("invalid mime type {mime_type}: {err}"),
            })?;
        let form = reqwest::multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", mime_type.to_string())
            .part("file", part);
        let value = self.execute(self.client.post(url).multipart(form)).await?;
        value
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::Transient(format!("media response without id: {value}")))
    }

    async fn fetch_media(&self, url: &str) -> Result<Bytes, ProviderError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::from_status(
                status.as_u16(),
                None,
                format!("media download failed for {url}"),
            ));
        }
        Ok(resp.bytes().await?)
    }
}

pub fn parse_template_page(value: &Value) -> TemplatePage {
    let templates = value
        .get("data")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<ProviderTemplate>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    // Graph keeps returning an `after` cursor on the last page; `next` is the signal.
    let paging = value.get("paging");
    let has_next = paging.and_then(|p| p.get("next")).is_some();
    let after = paging
        .and_then(|p| p.get("cursors"))
        .and_then(|c| c.get("after"))
        .and_then(|v| v.as_str())
        .filter(|_| has_next)
        .map(|s| s.to_string());

    TemplatePage { templates, after }
}

/// Everything one webhook delivery carried, split by event kind.
#[derive(Debug, Clone, Default)]
pub struct WebhookBatch {
    pub statuses: Vec<StatusUpdate>,
    pub inbound: Vec<InboundEvent>,
    pub template_updates: Vec<TemplateStatusEvent>,
}

impl WebhookBatch {
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty() && self.inbound.is_empty() && self.template_updates.is_empty()
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp_field(value: &Value) -> i64 {
    match value.get("timestamp") {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

pub fn parse_webhook(payload: &Value) -> WebhookBatch {
    let mut batch = WebhookBatch::default();
    let entries = payload
        .get("entry")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    for entry in &entries {
        let Some(changes) = entry.get("changes").and_then(|v| v.as_array()) else {
            continue;
        };
        for change in changes {
            let Some(value) = change.get("value") else {
                continue;
            };
            match change.get("field").and_then(|v| v.as_str()) {
                Some("message_template_status_update") => {
                    if let Some(update) = parse_template_update(value) {
                        batch.template_updates.push(update);
                    }
                }
                _ => {
                    if let Some(statuses) = value.get("statuses").and_then(|v| v.as_array()) {
                        batch.statuses.extend(statuses.iter().filter_map(parse_status));
                    }
                    if let Some(messages) = value.get("messages").and_then(|v| v.as_array()) {
                        batch.inbound.extend(messages.iter().filter_map(parse_inbound));
                    }
                }
            }
        }
    }

    debug!(
        statuses = batch.statuses.len(),
        inbound = batch.inbound.len(),
        templates = batch.template_updates.len(),
        "parsed whatsapp webhook"
    );
    batch
}

fn parse_status(value: &Value) -> Option<StatusUpdate> {
    let status = DeliveryStatus::parse(value.get("status")?.as_str()?)?;
    let error = value
        .get("errors")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .map(|e| {
            let code = e.get("code").and_then(|v| v.as_i64());
            let detail = e
                .get("error_data")
                .and_then(|d| d.get("details"))
                .or_else(|| e.get("message"))
                .or_else(|| e.get("title"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            match code {
                Some(code) => format!("{code}: {detail}"),
                None => detail.to_string(),
            }
        });
    Some(StatusUpdate {
        provider_message_id: str_field(value, "id")?,
        status,
        timestamp: timestamp_field(value),
        error,
    })
}

fn parse_inbound(value: &Value) -> Option<InboundEvent> {
    let text = value
        .get("text")
        .and_then(|t| t.get("body"))
        .or_else(|| value.get("button").and_then(|b| b.get("text")))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Some(InboundEvent {
        provider_message_id: str_field(value, "id")?,
        from: str_field(value, "from")?,
        text,
        timestamp: timestamp_field(value),
    })
}

fn parse_template_update(value: &Value) -> Option<TemplateStatusEvent> {
    let event = value.get("event")?.as_str()?;
    let id = str_field(value, "message_template_id");
    let name = str_field(value, "message_template_name");
    if id.is_none() && name.is_none() {
        return None;
    }
    let reason = str_field(value, "reason").filter(|r| !r.is_empty() && r != "NONE");
    Some(TemplateStatusEvent {
        provider_template_id: id,
        name,
        status: TemplateStatus::from_provider(event),
        reason,
    })
}

/// Answers the subscription handshake when mode and token match.
pub fn verify_subscription(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    expected: Option<&str>,
) -> Option<String> {
    let expected = expected?;
    if mode == Some("subscribe") && token == Some(expected) {
        return challenge.map(|c| c.to_string());
    }
    None
}
