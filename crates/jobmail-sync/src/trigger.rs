//! Trigger poller: executes the actions an operator confirmed in the
//! database and writes the result back onto the page.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobmail_adapters::{
    ActionContext, ActionExecutor, ActionResult, NextActionChange, TriggerAction,
};
use jobmail_core::{property_text, props, PropertySet, PropertyValue, TriageError};
use jobmail_store::RemotePage;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SyncEngine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerOutcome {
    pub page_id: String,
    pub action: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TriggerSummary {
    pub processed: usize,
    pub done: usize,
    pub errors: usize,
    pub skipped: usize,
    pub outcomes: Vec<TriggerOutcome>,
}

pub fn action_context(page: &RemotePage) -> ActionContext {
    let text = |name: &str| property_text(&page.properties, name);
    ActionContext {
        page_id: page.id.clone(),
        name: text(props::NAME),
        company: text(props::COMPANY),
        from: text(props::FROM),
        subject: text(props::SUBJECT),
        conversation_id: text(props::CONVERSATION_ID),
    }
}

/// Properties written for an action result. Absent fields are left alone;
/// a cleared next action is written as empty text.
pub fn result_properties(result: &ActionResult) -> PropertySet {
    let mut properties = PropertySet::new();
    if let Some(stage) = result.stage {
        properties.insert(props::STAGE.into(), PropertyValue::Choice(stage.as_str().into()));
    }
    match result.next_action {
        Some(NextActionChange::Set(action)) => {
            properties.insert(props::NEXT_ACTION.into(), PropertyValue::text(action.as_str()));
        }
        Some(NextActionChange::Clear) => {
            properties.insert(props::NEXT_ACTION.into(), PropertyValue::text(""));
        }
        None => {}
    }
    if let Some(summary) = &result.summary {
        properties.insert(props::SUMMARY.into(), PropertyValue::text(summary));
    }
    if let Some(error) = &result.error {
        properties.insert(props::ERROR.into(), PropertyValue::text(error));
    }
    properties
}

pub fn log_line(action: &str, result: &ActionResult, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y-%m-%d %H:%M UTC");
    match &result.error {
        Some(error) => format!("[{stamp}] Action '{action}' failed: {error}"),
        None => format!("[{stamp}] Action '{action}' completed successfully"),
    }
}

#[derive(Clone)]
pub struct TriggerPoller {
    engine: SyncEngine,
    executor: Arc<dyn ActionExecutor>,
}

impl TriggerPoller {
    pub fn new(engine: SyncEngine, executor: Arc<dyn ActionExecutor>) -> Self {
        Self { engine, executor }
    }

    /// One polling pass. Only the initial query can fail the cycle; every
    /// page-level failure is written back and counted.
    pub async fn run_trigger_cycle(&self) -> Result<TriggerSummary, TriageError> {
        let run_id = Uuid::new_v4();
        async move {
            let pages = self
                .engine
                .store()
                .query_action_requests()
                .await
                .map_err(|e| TriageError::RemoteReadFailure(Box::new(e)))?;
            let mut summary = TriggerSummary::default();
            for page in pages {
                let Some(action) = property_text(&page.properties, props::NEXT_ACTION) else {
                    summary.skipped += 1;
                    continue;
                };
                let outcome = self.process(&page, action.trim()).await;
                summary.processed += 1;
                if outcome.error.is_some() {
                    summary.errors += 1;
                } else {
                    summary.done += 1;
                }
                summary.outcomes.push(outcome);
            }
            info!(
                processed = summary.processed,
                done = summary.done,
                errors = summary.errors,
                "trigger cycle done"
            );
            Ok::<_, TriageError>(summary)
        }
        .instrument(info_span!("trigger_cycle", %run_id))
        .await
    }

    async fn process(&self, page: &RemotePage, label: &str) -> TriggerOutcome {
        let context = action_context(page);
        let result = match TriggerAction::parse(label) {
            Ok(action) => self
                .executor
                .execute(action, &context)
                .await
                .unwrap_or_else(|err| ActionResult::failed(err.to_string())),
            Err(err) => ActionResult::failed(err.to_string()),
        };
        if let Some(error) = &result.error {
            warn!(page_id = %page.id, action = label, error = %error, "action failed");
        } else {
            info!(page_id = %page.id, action = label, "action completed");
        }

        let log = log_line(label, &result, Utc::now());
        let mut error = result.error.clone();
        if let Err(err) = self
            .engine
            .write_back(&page.id, &page.properties, result_properties(&result), Some(&log))
            .await
        {
            warn!(page_id = %page.id, error = %err, "trigger write-back failed");
            let fallback = PropertySet::from([(
                props::ERROR.to_string(),
                PropertyValue::text(err.to_string()),
            )]);
            let note = format!("Error: {err}");
            if let Err(again) = self
                .engine
                .write_back(&page.id, &page.properties, fallback, Some(&note))
                .await
            {
                warn!(page_id = %page.id, error = %again, "error write-back failed");
            }
            error = Some(err.to_string());
        }

        TriggerOutcome {
            page_id: page.id.clone(),
            action: label.to_string(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use jobmail_core::{NextAction, Stage};

    use super::*;

    #[test]
    fn cleared_next_action_is_written_as_empty_text() {
        let result = ActionResult {
            stage: Some(Stage::Withdrawn),
            next_action: Some(NextActionChange::Clear),
            summary: Some("Archived by user".into()),
            error: None,
        };
        let properties = result_properties(&result);
        assert_eq!(properties.get(props::NEXT_ACTION), Some(&PropertyValue::text("")));
        assert_eq!(
            properties.get(props::STAGE),
            Some(&PropertyValue::Choice("withdrawn".into()))
        );
        assert!(!properties.contains_key(props::ERROR));
    }

    #[test]
    fn set_next_action_and_error_are_written() {
        let result = ActionResult {
            next_action: Some(NextActionChange::Set(NextAction::FollowUp)),
            error: Some("Send failed".into()),
            ..Default::default()
        };
        let properties = result_properties(&result);
        assert_eq!(properties.get(props::NEXT_ACTION), Some(&PropertyValue::text("follow_up")));
        assert_eq!(properties.get(props::ERROR), Some(&PropertyValue::text("Send failed")));
        assert!(!properties.contains_key(props::STAGE));
    }

    #[test]
    fn log_lines_are_timestamped() {
        let at = Utc.with_ymd_and_hms(2026, 2, 3, 9, 5, 0).unwrap();
        assert_eq!(
            log_line("archive", &ActionResult::default(), at),
            "[2026-02-03 09:05 UTC] Action 'archive' completed successfully"
        );
        assert_eq!(
            log_line("dance", &ActionResult::failed("Unknown action: dance"), at),
            "[2026-02-03 09:05 UTC] Action 'dance' failed: Unknown action: dance"
        );
    }

    #[test]
    fn context_comes_from_page_properties() {
        let page = RemotePage {
            id: "page-1".into(),
            properties: PropertySet::from([
                (props::COMPANY.to_string(), PropertyValue::text("Acme")),
                (props::FROM.to_string(), PropertyValue::text("Ana <ana@acme.io>")),
                (props::SUBJECT.to_string(), PropertyValue::text("  ")),
            ]),
        };
        let context = action_context(&page);
        assert_eq!(context.page_id, "page-1");
        assert_eq!(context.company.as_deref(), Some("Acme"));
        assert_eq!(context.subject, None);
    }
}
