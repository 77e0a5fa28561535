pub mod whatsapp;

use crate::types::SendParameters;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("provider rejected request ({}): {message}", code_label(*code))]
    Rejected { code: Option<i64>, message: String },
}

fn code_label(code: Option<i64>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "no code".into())
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// 429 and 5xx are worth retrying; every other non-success status is final.
    pub fn from_status(status: u16, code: Option<i64>, message: String) -> Self {
        if status == 429 || status >= 500 {
            ProviderError::Transient(format!("{status}: {message}"))
        } else {
            ProviderError::Rejected { code, message }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ProviderError::from_status(status.as_u16(), None, err.to_string()),
            None => ProviderError::Transient(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderTemplate {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub components: Value,
    #[serde(default)]
    pub rejected_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplatePage {
    pub templates: Vec<ProviderTemplate>,
    /// Cursor for the next page, `None` on the last one.
    pub after: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateSubmission {
    pub name: String,
    pub category: String,
    pub language: String,
    pub components: Value,
}

/// Contract of the regulated messaging channel.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    async fn submit_template(
        &self,
        submission: &TemplateSubmission,
    ) -> Result<String, ProviderError>;

    async fn list_templates(&self, after: Option<&str>) -> Result<TemplatePage, ProviderError>;

    async fn delete_template(&self, name: &str) -> Result<(), ProviderError>;

    async fn send_text(&self, to: &str, body: &str) -> Result<String, ProviderError>;

    async fn send_template(
        &self,
        to: &str,
        name: &str,
        language: &str,
        parameters: &SendParameters,
    ) -> Result<String, ProviderError>;

    async fn upload_media(&self, bytes: Bytes, mime_type: &str) -> Result<String, ProviderError>;

    /// Downloads media referenced by URL so it can be re-uploaded as a handle.
    async fn fetch_media(&self, url: &str) -> Result<Bytes, ProviderError>;
}
