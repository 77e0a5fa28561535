use crate::channels::ProviderError;
use crate::types::ComponentError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("provider temporarily unavailable: {0}")]
    ProviderTransient(String),

    #[error("provider rejected request: {message}")]
    ProviderRejection { code: Option<i64>, message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn details(&self) -> Vec<String> {
        match self {
            CoreError::Validation(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

impl From<ProviderError> for CoreError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(message) => CoreError::ProviderTransient(message),
            ProviderError::Rejected { code, message } => {
                CoreError::ProviderRejection { code, message }
            }
        }
    }
}

impl From<ComponentError> for CoreError {
    fn from(err: ComponentError) -> Self {
        CoreError::Validation(vec![err.to_string()])
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Storage(err.into())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
