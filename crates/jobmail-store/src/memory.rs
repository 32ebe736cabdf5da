//! In-process [`DocumentStore`] used by tests and dry runs.

use std::cmp::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use jobmail_core::{paragraphs, props, PropertySet, PropertyValue};

use crate::{DocumentStore, RemotePage, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPage {
    pub id: String,
    pub properties: PropertySet,
    pub blocks: Vec<String>,
}

impl MemoryPage {
    pub fn plaintext(&self) -> String {
        self.blocks.join("\n\n")
    }
}

/// Write calls observed by the store, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Create { page_id: String },
    Update { page_id: String, appended: bool },
    Log { page_id: String },
}

#[derive(Debug, Default)]
struct State {
    pages: Vec<MemoryPage>,
    writes: Vec<WriteOp>,
    next_id: usize,
    fail_plaintext: bool,
    fail_writes: Option<String>,
    fail_queries: Option<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds a page as if it had been created earlier; returns its id.
    pub fn insert_page(&self, properties: PropertySet, content: &str) -> String {
        let mut state = self.lock();
        let id = allocate_id(&mut state);
        state.pages.push(MemoryPage {
            id: id.clone(),
            properties,
            blocks: paragraphs(content).into_iter().map(str::to_string).collect(),
        });
        id
    }

    pub fn pages(&self) -> Vec<MemoryPage> {
        self.lock().pages.clone()
    }

    pub fn page(&self, page_id: &str) -> Option<MemoryPage> {
        self.lock().pages.iter().find(|p| p.id == page_id).cloned()
    }

    pub fn writes(&self) -> Vec<WriteOp> {
        self.lock().writes.clone()
    }

    pub fn set_plaintext_failure(&self, fail: bool) {
        self.lock().fail_plaintext = fail;
    }

    pub fn set_write_failure(&self, message: Option<&str>) {
        self.lock().fail_writes = message.map(str::to_string);
    }

    pub fn set_query_failure(&self, message: Option<&str>) {
        self.lock().fail_queries = message.map(str::to_string);
    }
}

fn allocate_id(state: &mut State) -> String {
    state.next_id += 1;
    format!("page-{}", state.next_id)
}

fn score(page: &RemotePage) -> f64 {
    page.properties
        .get(props::IMPORTANCE_SCORE)
        .and_then(PropertyValue::as_number)
        .unwrap_or(f64::NEG_INFINITY)
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn query_by_thread_key(&self, key: &str) -> Result<Vec<RemotePage>, StoreError> {
        let state = self.lock();
        if let Some(message) = &state.fail_queries {
            return Err(StoreError::Rejected(message.clone()));
        }
        Ok(state
            .pages
            .iter()
            .filter(|p| {
                p.properties
                    .get(props::CONVERSATION_ID)
                    .is_some_and(|v| v.as_text().trim() == key)
            })
            .map(|p| RemotePage {
                id: p.id.clone(),
                properties: p.properties.clone(),
            })
            .collect())
    }

    async fn get_page_properties(&self, page_id: &str) -> Result<PropertySet, StoreError> {
        self.lock()
            .pages
            .iter()
            .find(|p| p.id == page_id)
            .map(|p| p.properties.clone())
            .ok_or_else(|| StoreError::NotFound(page_id.to_string()))
    }

    async fn get_page_plaintext(&self, page_id: &str) -> Result<String, StoreError> {
        let state = self.lock();
        if state.fail_plaintext {
            return Err(StoreError::Rejected("block read failed".into()));
        }
        state
            .pages
            .iter()
            .find(|p| p.id == page_id)
            .map(MemoryPage::plaintext)
            .ok_or_else(|| StoreError::NotFound(page_id.to_string()))
    }

    async fn create_page(
        &self,
        properties: &PropertySet,
        content: &str,
    ) -> Result<String, StoreError> {
        let mut state = self.lock();
        if let Some(message) = &state.fail_writes {
            return Err(StoreError::Rejected(message.clone()));
        }
        let id = allocate_id(&mut state);
        state.pages.push(MemoryPage {
            id: id.clone(),
            properties: properties.clone(),
            blocks: paragraphs(content).into_iter().map(str::to_string).collect(),
        });
        state.writes.push(WriteOp::Create { page_id: id.clone() });
        Ok(id)
    }

    async fn update_page(
        &self,
        page_id: &str,
        properties: &PropertySet,
        content_append: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(message) = &state.fail_writes {
            return Err(StoreError::Rejected(message.clone()));
        }
        let page = state
            .pages
            .iter_mut()
            .find(|p| p.id == page_id)
            .ok_or_else(|| StoreError::NotFound(page_id.to_string()))?;
        for (name, value) in properties {
            page.properties.insert(name.clone(), value.clone());
        }
        if let Some(content) = content_append {
            page.blocks.extend(paragraphs(content).into_iter().map(str::to_string));
        }
        state.writes.push(WriteOp::Update {
            page_id: page_id.to_string(),
            appended: content_append.is_some(),
        });
        Ok(())
    }

    async fn append_log(&self, page_id: &str, line: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(message) = &state.fail_writes {
            return Err(StoreError::Rejected(message.clone()));
        }
        let page = state
            .pages
            .iter_mut()
            .find(|p| p.id == page_id)
            .ok_or_else(|| StoreError::NotFound(page_id.to_string()))?;
        page.blocks.push(line.to_string());
        state.writes.push(WriteOp::Log {
            page_id: page_id.to_string(),
        });
        Ok(())
    }

    async fn query_action_requests(&self) -> Result<Vec<RemotePage>, StoreError> {
        let state = self.lock();
        if let Some(message) = &state.fail_queries {
            return Err(StoreError::Rejected(message.clone()));
        }
        let mut pages: Vec<RemotePage> = state
            .pages
            .iter()
            .filter(|p| {
                p.properties
                    .get(props::ACTION_CONFIRM)
                    .and_then(PropertyValue::as_bool)
                    .unwrap_or(false)
            })
            .map(|p| RemotePage {
                id: p.id.clone(),
                properties: p.properties.clone(),
            })
            .collect();
        pages.sort_by(|a, b| score(b).partial_cmp(&score(a)).unwrap_or(Ordering::Equal));
        Ok(pages)
    }
}
