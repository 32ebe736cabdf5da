//! Document store contract consumed by the sync engine, with a Notion client
//! and an in-memory implementation.

use async_trait::async_trait;
use jobmail_core::PropertySet;
use thiserror::Error;

pub mod http;
pub mod memory;
pub mod notion;

pub use http::{BackoffPolicy, HttpClientConfig, HttpError, RequestKind, RetryingClient};
pub use memory::{InMemoryStore, MemoryPage, WriteOp};
pub use notion::{NotionConfig, NotionStore};

pub const CRATE_NAME: &str = "jobmail-store";

/// A page as returned by a query: id plus decoded properties.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePage {
    pub id: String,
    pub properties: PropertySet,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("page not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Rejected(String),
}

impl StoreError {
    /// Notion answers 400 with this text when a filter names a property the
    /// database does not have.
    pub fn is_missing_property(&self) -> bool {
        match self {
            StoreError::Http(HttpError::Status { detail, .. }) => {
                detail.contains("Could not find property")
            }
            _ => false,
        }
    }
}

/// Capabilities the sync engine and trigger poller need from the database.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Pages whose thread key property equals `key`. May return 0, 1 or more.
    async fn query_by_thread_key(&self, key: &str) -> Result<Vec<RemotePage>, StoreError>;

    async fn get_page_properties(&self, page_id: &str) -> Result<PropertySet, StoreError>;

    /// Concatenated text of all content blocks, paragraphs separated by a blank line.
    async fn get_page_plaintext(&self, page_id: &str) -> Result<String, StoreError>;

    async fn create_page(
        &self,
        properties: &PropertySet,
        content: &str,
    ) -> Result<String, StoreError>;

    async fn update_page(
        &self,
        page_id: &str,
        properties: &PropertySet,
        content_append: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Appends one action-log entry to the page, rendered apart from the
    /// email content.
    async fn append_log(&self, page_id: &str, line: &str) -> Result<(), StoreError> {
        self.update_page(page_id, &PropertySet::new(), Some(line)).await
    }

    /// Pages with `Action Confirm` checked, most important first.
    async fn query_action_requests(&self) -> Result<Vec<RemotePage>, StoreError>;

    /// Create any database properties the mapper writes that do not exist yet.
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
