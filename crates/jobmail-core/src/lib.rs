//! Core record model, property types and sync-safety rules for jobmail.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mapping;
pub mod stage;

pub use mapping::{build_page_content, map_properties, paragraphs, sanitize_body};
pub use stage::{allowed_stage_update, allowed_stage_value, FORWARD_STAGES, TERMINAL_STAGES};

pub const CRATE_NAME: &str = "jobmail-core";

/// Property names of the triage database.
pub mod props {
    pub const NAME: &str = "Name";
    pub const CONVERSATION_ID: &str = "Conversation ID";
    pub const MESSAGE_ID: &str = "Message ID";
    pub const EMAIL_LINK: &str = "Email Link";
    pub const FROM: &str = "From";
    pub const COMPANY: &str = "Company";
    pub const SUBJECT: &str = "Subject";
    pub const RECEIVED_UTC: &str = "Received UTC";
    pub const STAGE: &str = "Stage";
    pub const PRIORITY: &str = "Priority";
    pub const IMPORTANCE_SCORE: &str = "Importance Score";
    pub const NEXT_ACTION: &str = "Next Action";
    pub const SUMMARY: &str = "Summary";
    pub const DESCRIPTION: &str = "Description";
    pub const LLM_STATUS: &str = "LLM Status";
    pub const ERROR: &str = "Error";
    pub const DUE_DATE: &str = "Due date";
    pub const EFFORT_LEVEL: &str = "Effort level";
    pub const TASK_TYPE: &str = "Task type";
    pub const ACTION_CONFIRM: &str = "Action Confirm";
    pub const STATUS_UPDATED: &str = "Status Updated";
}

/// Application stage of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Applied,
    Received,
    InterviewScheduled,
    Interviewed,
    FinalRound,
    Offer,
    Rejected,
    Withdrawn,
    NeedsAction,
    Forwarded,
    Other,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::Applied,
        Stage::Received,
        Stage::InterviewScheduled,
        Stage::Interviewed,
        Stage::FinalRound,
        Stage::Offer,
        Stage::Rejected,
        Stage::Withdrawn,
        Stage::NeedsAction,
        Stage::Forwarded,
        Stage::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Applied => "applied",
            Stage::Received => "received",
            Stage::InterviewScheduled => "interview_scheduled",
            Stage::Interviewed => "interviewed",
            Stage::FinalRound => "final_round",
            Stage::Offer => "offer",
            Stage::Rejected => "rejected",
            Stage::Withdrawn => "withdrawn",
            Stage::NeedsAction => "needs_action",
            Stage::Forwarded => "forwarded",
            Stage::Other => "other",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|s| s.as_str() == label)
    }

    pub fn is_terminal(self) -> bool {
        TERMINAL_STAGES.contains(&self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "extremely high")]
    ExtremelyHigh,
    #[serde(rename = "high")]
    High,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "low")]
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::ExtremelyHigh,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::ExtremelyHigh => "extremely high",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase().replace('_', " ");
        Self::ALL.into_iter().find(|p| p.as_str() == label)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the candidate should do next, as decided by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Reply,
    Schedule,
    SubmitMaterials,
    CompleteAssessment,
    SignOffer,
    FollowUp,
    Archive,
    Ignore,
    Escalate,
}

impl NextAction {
    pub const ALL: [NextAction; 9] = [
        NextAction::Reply,
        NextAction::Schedule,
        NextAction::SubmitMaterials,
        NextAction::CompleteAssessment,
        NextAction::SignOffer,
        NextAction::FollowUp,
        NextAction::Archive,
        NextAction::Ignore,
        NextAction::Escalate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NextAction::Reply => "reply",
            NextAction::Schedule => "schedule",
            NextAction::SubmitMaterials => "submit_materials",
            NextAction::CompleteAssessment => "complete_assessment",
            NextAction::SignOffer => "sign_offer",
            NextAction::FollowUp => "follow_up",
            NextAction::Archive => "archive",
            NextAction::Ignore => "ignore",
            NextAction::Escalate => "escalate",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|a| a.as_str() == label)
    }
}

impl fmt::Display for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a row. Written by the classifier pass and by sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LlmStatus {
    #[default]
    New,
    Done,
    Error,
}

impl LlmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmStatus::New => "NEW",
            LlmStatus::Done => "DONE",
            LlmStatus::Error => "ERROR",
        }
    }

    /// Blank cells parse as `None`; unknown labels too.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "NEW" => Some(LlmStatus::New),
            "DONE" => Some(LlmStatus::Done),
            "ERROR" => Some(LlmStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LlmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blank means empty after trimming. Spreadsheet `NaN` cells are cleared by
/// the spreadsheet reader before they get here.
pub fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !is_blank(v))
}

fn clean(value: Option<String>) -> Option<String> {
    value.filter(|v| !is_blank(v))
}

/// One email / application event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub web_link: Option<String>,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub company: Option<String>,
    pub received_utc: Option<String>,
    pub body: Option<String>,
    pub stage: Option<Stage>,
    pub priority: Option<Priority>,
    pub next_action: Option<NextAction>,
    pub summary: Option<String>,
    pub importance_score: Option<f64>,
    pub due_date: Option<NaiveDate>,
    pub llm_status: LlmStatus,
    pub llm_processed_utc: Option<String>,
    pub error_msg: Option<String>,
    pub notion_page_id: Option<String>,
}

impl Record {
    /// Clears blank text fields and non-finite scores. Row sources call this
    /// once so downstream code only sees `Some` for real values.
    pub fn normalized(self) -> Self {
        Self {
            message_id: clean(self.message_id).map(|v| v.trim().to_string()),
            conversation_id: clean(self.conversation_id).map(|v| v.trim().to_string()),
            web_link: clean(self.web_link).map(|v| v.trim().to_string()),
            from: clean(self.from),
            subject: clean(self.subject),
            company: clean(self.company),
            received_utc: clean(self.received_utc),
            body: clean(self.body),
            summary: clean(self.summary),
            importance_score: self.importance_score.filter(|s| s.is_finite()),
            llm_processed_utc: clean(self.llm_processed_utc),
            error_msg: clean(self.error_msg),
            notion_page_id: clean(self.notion_page_id).map(|v| v.trim().to_string()),
            ..self
        }
    }

    pub fn thread_key(&self) -> Option<ThreadKey> {
        resolve_thread_key(self)
    }

    /// Known remote page id, if the row has been synced before.
    pub fn page_id(&self) -> Option<&str> {
        non_blank(self.notion_page_id.as_deref()).map(str::trim)
    }

    pub fn apply_classification(
        &mut self,
        classification: Classification,
        processed_at: DateTime<Utc>,
    ) {
        self.stage = Some(classification.stage);
        self.priority = Some(classification.priority);
        self.next_action = Some(classification.next_action);
        self.importance_score = Some(classification.importance_score);
        self.summary = clean(Some(classification.summary));
        if let Some(company) = clean(Some(classification.company)) {
            self.company = Some(company);
        }
        self.due_date = classification.due_date;
        self.llm_status = LlmStatus::Done;
        self.llm_processed_utc = Some(processed_at.to_rfc3339_opts(SecondsFormat::Secs, false));
        self.error_msg = None;
    }

    pub fn mark_classification_failed(
        &mut self,
        message: impl Into<String>,
        processed_at: DateTime<Utc>,
    ) {
        self.llm_status = LlmStatus::Error;
        self.llm_processed_utc = Some(processed_at.to_rfc3339_opts(SecondsFormat::Secs, false));
        self.error_msg = Some(message.into());
    }

    pub fn apply_outcome(&mut self, outcome: &SyncOutcome) {
        if let Some(page_id) = &outcome.page_id {
            self.notion_page_id = Some(page_id.clone());
        }
        self.llm_status = outcome.status;
        self.error_msg = outcome.error.clone();
    }

    /// Display label for log lines.
    pub fn label(&self) -> &str {
        non_blank(self.company.as_deref())
            .or(non_blank(self.from.as_deref()))
            .unwrap_or("?")
    }
}

/// Structured classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub stage: Stage,
    pub priority: Priority,
    pub next_action: NextAction,
    pub importance_score: f64,
    pub summary: String,
    pub company: String,
    pub due_date: Option<NaiveDate>,
}

/// Stable identifier of one email conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadKey(String);

impl ThreadKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn resolve_thread_key(record: &Record) -> Option<ThreadKey> {
    [record.conversation_id.as_deref(), record.message_id.as_deref()]
        .into_iter()
        .find_map(non_blank)
        .map(|v| ThreadKey(v.trim().to_string()))
}

/// Abstract property value. Store clients coerce it to their wire types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Date(String),
    Choice(String),
    Labels(Vec<String>),
}

impl PropertyValue {
    pub fn text(value: impl Into<String>) -> Self {
        PropertyValue::Text(value.into())
    }

    /// String form used for comparisons such as the stage guard.
    pub fn as_text(&self) -> String {
        match self {
            PropertyValue::Text(s) | PropertyValue::Date(s) | PropertyValue::Choice(s) => s.clone(),
            PropertyValue::Number(n) => n.to_string(),
            PropertyValue::Bool(b) => b.to_string(),
            PropertyValue::Labels(labels) => labels.join(", "),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            PropertyValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

pub type PropertySet = BTreeMap<String, PropertyValue>;

/// Text of a property, `None` when absent or blank.
pub fn property_text(props: &PropertySet, name: &str) -> Option<String> {
    props
        .get(name)
        .map(PropertyValue::as_text)
        .filter(|v| !is_blank(v))
}

/// Result of syncing one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub status: LlmStatus,
    pub page_id: Option<String>,
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn done(page_id: impl Into<String>) -> Self {
        Self {
            status: LlmStatus::Done,
            page_id: Some(page_id.into()),
            error: None,
        }
    }

    pub fn failed(error: &TriageError) -> Self {
        Self {
            status: LlmStatus::Error,
            page_id: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == LlmStatus::Done
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Row-scoped failures. None of these abort a batch.
#[derive(Debug, Error)]
pub enum TriageError {
    #[error("missing thread key")]
    MissingThreadKey,
    #[error("multiple pages found for {0}")]
    AmbiguousThreadKey(ThreadKey),
    #[error("{0}")]
    RemoteReadFailure(#[source] BoxError),
    #[error("{0}")]
    RemoteWriteFailure(#[source] BoxError),
    #[error("{0}")]
    ClassifierFailure(String),
    #[error("Unknown action: {0}")]
    UnknownAction(String),
}
