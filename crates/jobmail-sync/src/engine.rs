//! Idempotent record -> page sync.

use std::sync::Arc;

use jobmail_core::{
    allowed_stage_value, build_page_content, map_properties, paragraphs, props, PropertySet,
    PropertyValue, Record, SyncOutcome, TriageError,
};
use jobmail_store::{DocumentStore, StoreError};
use tracing::{debug, info, warn};

fn read_failure(err: StoreError) -> TriageError {
    TriageError::RemoteReadFailure(Box::new(err))
}

fn write_failure(err: StoreError) -> TriageError {
    TriageError::RemoteWriteFailure(Box::new(err))
}

/// Drops `Stage` from `properties` when the page's current stage does not
/// allow it. Returns whether the stage (if any) survived.
pub fn guard_stage(current: &PropertySet, properties: &mut PropertySet) -> bool {
    if allowed_stage_value(current.get(props::STAGE), properties.get(props::STAGE)) {
        return true;
    }
    if let Some(dropped) = properties.remove(props::STAGE) {
        debug!(
            current = ?current.get(props::STAGE).map(PropertyValue::as_text),
            candidate = %dropped.as_text(),
            "stage update blocked"
        );
    }
    false
}

#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn DocumentStore>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    /// Row-level sync. Never fails; errors come back as an `ERROR` outcome.
    pub async fn sync(&self, record: &Record) -> SyncOutcome {
        match self.try_sync(record).await {
            Ok(page_id) => SyncOutcome::done(page_id),
            Err(err) => {
                warn!(row = record.label(), error = %err, "sync failed");
                SyncOutcome::failed(&err)
            }
        }
    }

    /// Creates or updates the page for `record` and returns its id.
    pub async fn try_sync(&self, record: &Record) -> Result<String, TriageError> {
        let key = record.thread_key().ok_or(TriageError::MissingThreadKey)?;
        let properties = map_properties(record);
        let content = build_page_content(record);
        let body = record.body.as_deref();

        if let Some(page_id) = record.page_id() {
            let current = self.store.get_page_properties(page_id).await.map_err(read_failure)?;
            self.update_existing(page_id, &current, properties, &content, body)
                .await?;
            return Ok(page_id.to_string());
        }

        let mut matches = self
            .store
            .query_by_thread_key(key.as_str())
            .await
            .map_err(read_failure)?;
        match matches.len() {
            0 => {
                let page_id = self
                    .store
                    .create_page(&properties, &content)
                    .await
                    .map_err(write_failure)?;
                info!(thread_key = %key, page_id = %page_id, "page created");
                Ok(page_id)
            }
            1 => {
                let page = matches.remove(0);
                self.update_existing(&page.id, &page.properties, properties, &content, body)
                    .await?;
                Ok(page.id)
            }
            _ => Err(TriageError::AmbiguousThreadKey(key)),
        }
    }

    async fn update_existing(
        &self,
        page_id: &str,
        current: &PropertySet,
        mut properties: PropertySet,
        content: &str,
        body: Option<&str>,
    ) -> Result<(), TriageError> {
        guard_stage(current, &mut properties);
        properties.insert(props::STATUS_UPDATED.into(), PropertyValue::Bool(true));
        let append = if self.content_present(page_id, body).await {
            None
        } else {
            Some(content)
        };
        self.store
            .update_page(page_id, &properties, append)
            .await
            .map_err(write_failure)?;
        info!(page_id, appended = append.is_some(), "page updated");
        Ok(())
    }

    /// True when the body is already part of the page text. The body is
    /// compared in the paragraph form pages store it in. Fails open: any read
    /// error means the content gets appended.
    async fn content_present(&self, page_id: &str, body: Option<&str>) -> bool {
        let body = paragraphs(body.map(str::trim).unwrap_or_default()).join("\n\n");
        if body.is_empty() {
            return false;
        }
        match self.store.get_page_plaintext(page_id).await {
            Ok(text) => text.contains(&body),
            Err(err) => {
                debug!(page_id, error = %err, "dedup read failed; appending content");
                false
            }
        }
    }

    /// Trigger write-back: stage through the guard, `Action Confirm` cleared
    /// and `Status Updated` set, then the optional log entry.
    pub async fn write_back(
        &self,
        page_id: &str,
        current: &PropertySet,
        mut properties: PropertySet,
        log: Option<&str>,
    ) -> Result<(), TriageError> {
        guard_stage(current, &mut properties);
        properties.insert(props::ACTION_CONFIRM.into(), PropertyValue::Bool(false));
        properties.insert(props::STATUS_UPDATED.into(), PropertyValue::Bool(true));
        self.store
            .update_page(page_id, &properties, None)
            .await
            .map_err(write_failure)?;
        if let Some(line) = log {
            self.store.append_log(page_id, line).await.map_err(write_failure)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choice(stage: &str) -> PropertyValue {
        PropertyValue::Choice(stage.to_string())
    }

    #[test]
    fn guard_keeps_forward_moves() {
        let current = PropertySet::from([(props::STAGE.to_string(), choice("applied"))]);
        let mut update = PropertySet::from([(props::STAGE.to_string(), choice("interviewed"))]);
        assert!(guard_stage(&current, &mut update));
        assert!(update.contains_key(props::STAGE));
    }

    #[test]
    fn guard_drops_stage_on_terminal_pages() {
        let current = PropertySet::from([(props::STAGE.to_string(), choice("rejected"))]);
        let mut update = PropertySet::from([
            (props::STAGE.to_string(), choice("interviewed")),
            (props::SUMMARY.to_string(), PropertyValue::text("Thanks")),
        ]);
        assert!(!guard_stage(&current, &mut update));
        assert!(!update.contains_key(props::STAGE));
        assert!(update.contains_key(props::SUMMARY));
    }
}
