use crate::channels::{MessagingProvider, ProviderError, ProviderTemplate};
use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Upper bound on pages walked per refresh.
const MAX_PAGES: usize = 50;

struct Snapshot {
    fetched_at: DateTime<Utc>,
    templates: Arc<Vec<ProviderTemplate>>,
}

/// Short-lived copy of the provider's template listing, shared by every poller.
pub struct TemplateListCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    snapshot: Mutex<Option<Snapshot>>,
}

impl TemplateListCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            snapshot: Mutex::new(None),
        }
    }

    fn fresh(&self) -> Option<Arc<Vec<ProviderTemplate>>> {
        let guard = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = guard.as_ref()?;
        if self.clock.now() - snapshot.fetched_at < self.ttl {
            Some(snapshot.templates.clone())
        } else {
            None
        }
    }

    pub fn invalidate(&self) {
        let mut guard = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    /// Returns every template, following pagination cursors on a miss.
    pub async fn list(
        &self,
        provider: &dyn MessagingProvider,
    ) -> Result<Arc<Vec<ProviderTemplate>>, ProviderError> {
        if let Some(templates) = self.fresh() {
            return Ok(templates);
        }

        let mut templates = Vec::new();
        let mut after: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = provider.list_templates(after.as_deref()).await?;
            templates.extend(page.templates);
            match page.after {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }
        debug!(count = templates.len(), "refreshed provider template listing");

        let templates = Arc::new(templates);
        let mut guard = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Snapshot {
            fetched_at: self.clock.now(),
            templates: templates.clone(),
        });
        Ok(templates)
    }
}
