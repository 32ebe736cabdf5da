//! LLM classifier behind a narrow trait. The Anthropic implementation forces
//! a single tool call whose input schema is the classification shape.

use async_trait::async_trait;
use chrono::NaiveDate;
use jobmail_core::{sanitize_body, Classification, NextAction, Priority, Record, Stage};
use jobmail_store::{HttpClientConfig, RequestKind, RetryingClient};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::AdapterError;

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-20241022";
pub const TOOL_NAME: &str = "classify_email";

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, record: &Record) -> Result<Classification, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub max_tokens: u32,
    pub http: HttpClientConfig,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            api_base: ANTHROPIC_API_BASE.to_string(),
            max_tokens: 1024,
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct AnthropicClassifier {
    api_key: String,
    model: String,
    endpoint: String,
    max_tokens: u32,
    http: RetryingClient,
}

impl AnthropicClassifier {
    pub fn new(config: AnthropicConfig) -> Result<Self, AdapterError> {
        if config.api_key.trim().is_empty() {
            return Err(AdapterError::Config("ANTHROPIC_API_KEY is required".into()));
        }
        Ok(Self {
            api_key: config.api_key,
            model: config.model,
            endpoint: format!("{}/v1/messages", config.api_base.trim_end_matches('/')),
            max_tokens: config.max_tokens,
            http: RetryingClient::new(&config.http)?,
        })
    }

    pub fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "tools": [{
                "name": TOOL_NAME,
                "description": "Classify a job application email into structured triage fields.",
                "input_schema": tool_schema(),
            }],
            "tool_choice": { "type": "tool", "name": TOOL_NAME },
            "messages": [{ "role": "user", "content": prompt }],
        })
    }
}

#[async_trait]
impl Classifier for AnthropicClassifier {
    async fn classify(&self, record: &Record) -> Result<Classification, AdapterError> {
        let body = self.request_body(&build_prompt(record));
        let response = self
            .http
            .send_json(RequestKind::Idempotent, |c| {
                c.post(&self.endpoint)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body)
            })
            .await?;
        let usage = response.get("usage").unwrap_or(&Value::Null);
        debug!(model = %self.model, %usage, "classifier call");
        parse_classification(tool_input(&response)?)
    }
}

fn labels<T: Copy>(all: &[T], as_str: fn(T) -> &'static str) -> Vec<&'static str> {
    all.iter().map(|v| as_str(*v)).collect()
}

/// JSON schema of the classification tool input.
pub fn tool_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["stage", "priority", "next_action", "importance_score", "summary", "company"],
        "properties": {
            "stage": {
                "type": "string",
                "enum": labels(&Stage::ALL, Stage::as_str),
                "description": "Where the application stands. Precedence: rejected, \
                    withdrawn, needs_action, forwarded, then the furthest of offer, \
                    final_round, interviewed, interview_scheduled, received, applied; \
                    other when nothing fits. needs_action means the candidate must act; \
                    forwarded means the process moved to a new contact.",
            },
            "priority": {
                "type": "string",
                "enum": labels(&Priority::ALL, Priority::as_str),
                "description": "extremely high for explicit deadlines within 24 hours; \
                    high for interview or offer actions; medium for non-urgent actions; \
                    low when nothing is required.",
            },
            "next_action": {
                "type": "string",
                "enum": labels(&NextAction::ALL, NextAction::as_str),
                "description": "The single next step for the candidate. \
                    Closed threads are usually archive.",
            },
            "importance_score": {
                "type": "number",
                "minimum": 0.0,
                "maximum": 1.0,
                "description": "Importance in [0, 1] from explicit urgency and \
                    interview or offer relevance.",
            },
            "summary": {
                "type": "string",
                "description": "Short action-oriented summary: the ask, who to answer, \
                    any explicit deadline.",
            },
            "company": {
                "type": "string",
                "description": "Employer name; keep a reliable hint, empty string when unsure.",
            },
            "due_date": {
                "type": ["string", "null"],
                "description": "Explicit candidate deadline as YYYY-MM-DD, \
                    null when none is stated.",
            },
        },
    })
}

pub fn build_prompt(record: &Record) -> String {
    let field = |value: &Option<String>| value.as_deref().unwrap_or_default().to_string();
    let body = sanitize_body(record.body.as_deref().unwrap_or_default());
    format!(
        "Triage this job application email with the {TOOL_NAME} tool.\n\
Use only the metadata and body below; do not invent facts, dates or deadlines.\n\
\n\
from: {}\n\
subject: {}\n\
company_hint: {}\n\
received_utc: {}\n\
\n\
Email body:\n\
{body}",
        field(&record.from),
        field(&record.subject),
        field(&record.company),
        field(&record.received_utc),
    )
}

/// Input of the first `tool_use` block of a Messages API response.
pub fn tool_input(response: &Value) -> Result<&Value, AdapterError> {
    response
        .get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| {
            blocks
                .iter()
                .find(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
        })
        .and_then(|block| block.get("input"))
        .ok_or_else(|| AdapterError::Classifier("classifier returned no tool_use output".into()))
}

fn required_label<T>(
    input: &Value,
    field: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<T, AdapterError> {
    let raw = input.get(field).and_then(Value::as_str).unwrap_or_default();
    parse(raw).ok_or_else(|| AdapterError::Classifier(format!("{field} invalid: {raw}")))
}

/// Validates tool input into a [`Classification`].
pub fn parse_classification(input: &Value) -> Result<Classification, AdapterError> {
    let stage = required_label(input, "stage", Stage::parse)?;
    let priority = required_label(input, "priority", Priority::parse)?;
    let next_action = required_label(input, "next_action", NextAction::parse)?;

    let importance_score = input
        .get("importance_score")
        .and_then(Value::as_f64)
        .ok_or_else(|| AdapterError::Classifier("importance_score missing".into()))?;
    if !(0.0..=1.0).contains(&importance_score) {
        return Err(AdapterError::Classifier(format!(
            "importance_score out of range: {importance_score}"
        )));
    }

    let text = |field: &str| {
        input
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string()
    };
    let due_date = match input.get("due_date").and_then(Value::as_str).map(str::trim) {
        Some("") | None => None,
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => Some(date),
            Err(_) => {
                warn!(due_date = raw, "ignoring non-ISO due date");
                None
            }
        },
    };

    Ok(Classification {
        stage,
        priority,
        next_action,
        importance_score,
        summary: text("summary"),
        company: text("company"),
        due_date,
    })
}
