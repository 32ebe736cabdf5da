//! Row sources, the LLM classifier and the action executor.

use async_trait::async_trait;
use jobmail_core::Record;
use jobmail_store::HttpError;
use thiserror::Error;

pub mod classifier;
pub mod executor;
pub mod mailbox;
pub mod spreadsheet;

pub use classifier::{AnthropicClassifier, AnthropicConfig, Classifier};
pub use executor::{
    ActionContext, ActionExecutor, ActionResult, CliOutput, JobApplyCli, NextActionChange,
    RecordingExecutor, TriggerAction,
};
pub use mailbox::{FetchPlan, ImapConfig, ImapSource};
pub use spreadsheet::{copy_and_merge_to_local, merge_local_copy, Cell, MergeStats, Sheet};

pub const CRATE_NAME: &str = "jobmail-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Config(String),
    #[error("imap: {0}")]
    Imap(#[from] imap::Error),
    #[error("tls: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("mail parse: {0}")]
    Mail(#[from] mailparse::MailParseError),
    #[error("spreadsheet: {0}")]
    Spreadsheet(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("{0}")]
    Classifier(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Producer of records with the fixed row shape: classification fields
/// empty, `llm_status` NEW unless the source already stores a status.
#[async_trait]
pub trait RowSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_records(&self) -> Result<Vec<Record>, AdapterError>;
}
