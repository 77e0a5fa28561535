use crate::db::{self, MessageRecord};
use crate::error::{CoreError, CoreResult};
use crate::retry::with_retry;
use crate::types::SendParameters;
use crate::Engine;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub enum SendKind<'a> {
    Free,
    Template {
        name: &'a str,
        language: &'a str,
        parameters: &'a SendParameters,
    },
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Sent { provider_message_id: String },
    Failed { error: CoreError },
    /// Another caller already took this message.
    AlreadyDispatched,
}

/// Sends an existing message row and records the result on it. Provider
/// failures are recorded and returned as `Failed`; only storage errors are `Err`.
pub async fn dispatch(
    engine: &Engine,
    message: &MessageRecord,
    to: &str,
    kind: SendKind<'_>,
) -> CoreResult<DispatchOutcome> {
    let now = engine.now();
    if !db::claim_message_dispatch(&engine.pool, engine.kind, &message.id, now).await? {
        info!(message_id = %message.id, "message already dispatched, skipping");
        return Ok(DispatchOutcome::AlreadyDispatched);
    }

    let policy = engine.retry_policy();
    let provider = engine.provider.clone();
    let result = match kind {
        SendKind::Free => {
            let body = message.body.as_deref().unwrap_or_default();
            with_retry(policy, "send_text", || provider.send_text(to, body)).await
        }
        SendKind::Template {
            name,
            language,
            parameters,
        } => {
            with_retry(policy, "send_template", || {
                provider.send_template(to, name, language, parameters)
            })
            .await
        }
    };

    let template_name = match kind {
        SendKind::Free => None,
        SendKind::Template { name, .. } => Some(name),
    };

    let now = engine.now();
    match result {
        Ok(provider_message_id) => {
            db::mark_message_sent(
                &engine.pool,
                engine.kind,
                &message.id,
                &provider_message_id,
                template_name,
                now,
            )
            .await?;
            db::touch_outbound(&engine.pool, engine.kind, &message.conversation_id, now).await?;
            info!(
                message_id = %message.id,
                provider_message_id = %provider_message_id,
                template = template_name.unwrap_or("-"),
                "message sent"
            );
            Ok(DispatchOutcome::Sent { provider_message_id })
        }
        Err(err) => {
            warn!(message_id = %message.id, "send failed: {err}");
            let reason = err.to_string();
            db::mark_message_failed(&engine.pool, engine.kind, &message.id, &reason, now).await?;
            Ok(DispatchOutcome::Failed { error: err.into() })
        }
    }
}

pub async fn send_free(
    engine: &Engine,
    message: &MessageRecord,
    to: &str,
) -> CoreResult<DispatchOutcome> {
    dispatch(engine, message, to, SendKind::Free).await
}

pub async fn send_template(
    engine: &Engine,
    message: &MessageRecord,
    to: &str,
    name: &str,
    language: &str,
    parameters: &SendParameters,
) -> CoreResult<DispatchOutcome> {
    dispatch(
        engine,
        message,
        to,
        SendKind::Template {
            name,
            language,
            parameters,
        },
    )
    .await
}
