//! Sync orchestration: the idempotent sync engine, batch drivers, the
//! classification pass, the trigger poller and the CLI pipelines.

use std::path::PathBuf;
use std::time::Duration;

use jobmail_adapters::{
    AdapterError, AnthropicClassifier, AnthropicConfig, FetchPlan, ImapConfig, ImapSource,
    JobApplyCli,
};
use jobmail_store::{HttpClientConfig, NotionConfig, NotionStore, StoreError};

pub mod batch;
pub mod classify;
pub mod engine;
pub mod pipeline;
pub mod trigger;

pub use batch::{should_sync_row, sync_records, sync_sheet, BatchSummary};
pub use classify::{classify_records, classify_sheet, ClassifySummary};
pub use engine::{guard_stage, SyncEngine};
pub use pipeline::{
    build_scheduler, run_excel, run_loop, run_pull, run_push, CycleSummary, ExcelOptions, ExcelRun,
    FullCycle, PushSummary,
};
pub use trigger::{TriggerOutcome, TriggerPoller, TriggerSummary};

pub const CRATE_NAME: &str = "jobmail-sync";

#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub notion_token: String,
    pub notion_database_id: String,
    pub notion_query_properties: Vec<String>,
    pub anthropic_api_key: String,
    pub anthropic_model: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_user: String,
    pub imap_password: String,
    pub job_apply_dir: PathBuf,
    pub node_bin: String,
    pub jobs_source_xlsx: Option<PathBuf>,
    pub jobs_local_xlsx: PathBuf,
    pub http_timeout_secs: u64,
    pub sync_cron: String,
}

impl TriageConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            notion_token: var("NOTION_TOKEN").unwrap_or_default(),
            notion_database_id: var("NOTION_DATABASE_ID").unwrap_or_default(),
            notion_query_properties: var("NOTION_QUERY_PROPERTIES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|| {
                    jobmail_store::notion::DEFAULT_QUERY_PROPERTIES
                        .iter()
                        .map(|p| p.to_string())
                        .collect()
                }),
            anthropic_api_key: var("ANTHROPIC_API_KEY").unwrap_or_default(),
            anthropic_model: var("ANTHROPIC_MODEL")
                .unwrap_or_else(|| jobmail_adapters::classifier::DEFAULT_MODEL.to_string()),
            imap_host: var("IMAP_HOST").unwrap_or_else(|| "imap.gmail.com".to_string()),
            imap_port: var("IMAP_PORT").and_then(|v| v.parse().ok()).unwrap_or(993),
            imap_user: var("FROM_EMAIL").unwrap_or_default(),
            imap_password: var("GMAIL_APP_PASSWORD").unwrap_or_default(),
            job_apply_dir: var("JOB_APPLY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            node_bin: var("NODE_BIN").unwrap_or_else(|| "node".to_string()),
            jobs_source_xlsx: var("JOBS_SOURCE_XLSX").map(PathBuf::from),
            jobs_local_xlsx: var("JOBS_LOCAL_XLSX")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./Jobs.xlsx")),
            http_timeout_secs: var("TRIAGE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            sync_cron: var("TRIAGE_SYNC_CRON").unwrap_or_else(|| "0 */15 * * * *".to_string()),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            ..HttpClientConfig::default()
        }
    }

    pub fn notion_store(&self) -> Result<NotionStore, StoreError> {
        let mut config = NotionConfig::new(&self.notion_token, &self.notion_database_id);
        config.query_properties = self.notion_query_properties.clone();
        config.http = self.http_config();
        NotionStore::new(config)
    }

    pub fn classifier(&self) -> Result<AnthropicClassifier, AdapterError> {
        let mut config = AnthropicConfig::new(&self.anthropic_api_key);
        config.model = self.anthropic_model.clone();
        config.http = self.http_config();
        AnthropicClassifier::new(config)
    }

    pub fn imap_source(&self, plan: FetchPlan) -> ImapSource {
        let mut config = ImapConfig::new(&self.imap_user, &self.imap_password);
        config.host = self.imap_host.clone();
        config.port = self.imap_port;
        ImapSource::new(config, plan)
    }

    pub fn executor(&self) -> JobApplyCli {
        JobApplyCli::new(&self.node_bin, &self.job_apply_dir)
    }
}
