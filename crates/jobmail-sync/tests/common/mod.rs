#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jobmail_adapters::{AdapterError, Classifier, RowSource};
use jobmail_core::{
    props, Classification, LlmStatus, NextAction, Priority, PropertySet, PropertyValue, Record,
    Stage,
};
use jobmail_store::InMemoryStore;
use jobmail_sync::SyncEngine;

pub fn engine() -> (Arc<InMemoryStore>, SyncEngine) {
    let store = Arc::new(InMemoryStore::new());
    let engine = SyncEngine::new(store.clone());
    (store, engine)
}

pub fn record(conversation_id: &str, body: &str) -> Record {
    Record {
        conversation_id: Some(conversation_id.to_string()),
        message_id: Some(format!("<{conversation_id}@mail.acme.io>")),
        from: Some("Ana Ruiz <ana@acme.io>".into()),
        subject: Some("Your application to Acme".into()),
        company: Some("Acme".into()),
        received_utc: Some("2026-02-03T09:00:00Z".into()),
        body: Some(body.to_string()),
        stage: Some(Stage::Applied),
        priority: Some(Priority::Low),
        next_action: Some(NextAction::Archive),
        summary: Some("Application received".into()),
        importance_score: Some(0.3),
        llm_status: LlmStatus::Done,
        ..Default::default()
    }
}

pub fn page_props(entries: &[(&str, PropertyValue)]) -> PropertySet {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

pub fn keyed(key: &str, stage: &str) -> PropertySet {
    page_props(&[
        (props::CONVERSATION_ID, PropertyValue::text(key)),
        (props::STAGE, PropertyValue::Choice(stage.to_string())),
    ])
}

pub fn stage_of(store: &InMemoryStore, page_id: &str) -> Option<String> {
    store
        .page(page_id)
        .and_then(|p| p.properties.get(props::STAGE).map(PropertyValue::as_text))
}

pub fn flag(store: &InMemoryStore, page_id: &str, name: &str) -> Option<bool> {
    store
        .page(page_id)
        .and_then(|p| p.properties.get(name).and_then(PropertyValue::as_bool))
}

pub fn classification(stage: Stage) -> Classification {
    Classification {
        stage,
        priority: Priority::High,
        next_action: NextAction::Schedule,
        importance_score: 0.8,
        summary: "Pick an interview slot".into(),
        company: "Acme".into(),
        due_date: None,
    }
}

/// Answers every call with the same classification, failing for subjects
/// that contain "garbled".
pub struct ScriptedClassifier {
    answer: Classification,
    seen: Mutex<Vec<Option<String>>>,
}

impl ScriptedClassifier {
    pub fn new(answer: Classification) -> Self {
        Self {
            answer,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<Option<String>> {
        self.seen.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, record: &Record) -> Result<Classification, AdapterError> {
        self.seen.lock().expect("lock").push(record.subject.clone());
        if record.subject.as_deref().is_some_and(|s| s.contains("garbled")) {
            return Err(AdapterError::Classifier("stage invalid: maybe".into()));
        }
        Ok(self.answer.clone())
    }
}

pub struct FixedSource(pub Vec<Record>);

#[async_trait]
impl RowSource for FixedSource {
    fn source_id(&self) -> &'static str {
        "fixed"
    }

    async fn fetch_records(&self) -> Result<Vec<Record>, AdapterError> {
        Ok(self.0.clone())
    }
}
