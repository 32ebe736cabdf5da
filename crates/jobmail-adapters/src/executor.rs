//! Action executor: turns a confirmed trigger action into state updates.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobmail_core::{NextAction, Stage, TriageError};
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::AdapterError;

/// Action labels an operator may confirm from the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerAction {
    SendCold,
    Reply,
    FollowUp,
    Archive,
    Ignore,
    Schedule,
}

impl TriggerAction {
    pub const ALL: [TriggerAction; 6] = [
        TriggerAction::SendCold,
        TriggerAction::Reply,
        TriggerAction::FollowUp,
        TriggerAction::Archive,
        TriggerAction::Ignore,
        TriggerAction::Schedule,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerAction::SendCold => "send_cold",
            TriggerAction::Reply => "reply",
            TriggerAction::FollowUp => "follow_up",
            TriggerAction::Archive => "archive",
            TriggerAction::Ignore => "ignore",
            TriggerAction::Schedule => "schedule",
        }
    }

    pub fn parse(label: &str) -> Result<Self, TriageError> {
        let normalized = label.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or(TriageError::UnknownAction(normalized))
    }
}

/// Row context handed to the executor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionContext {
    pub page_id: String,
    pub name: Option<String>,
    pub company: Option<String>,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextActionChange {
    Set(NextAction),
    Clear,
}

/// State updates written back after an action. `error` set means failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionResult {
    pub stage: Option<Stage>,
    pub next_action: Option<NextActionChange>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

impl ActionResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: TriggerAction,
        context: &ActionContext,
    ) -> Result<ActionResult, AdapterError>;
}

/// Results of the actions that never leave the process.
pub fn local_result(action: TriggerAction) -> Option<ActionResult> {
    match action {
        TriggerAction::Archive => Some(ActionResult {
            stage: Some(Stage::Withdrawn),
            next_action: Some(NextActionChange::Clear),
            summary: Some("Archived by user".into()),
            error: None,
        }),
        TriggerAction::Ignore => Some(ActionResult {
            next_action: Some(NextActionChange::Clear),
            summary: Some("Ignored by user".into()),
            ..Default::default()
        }),
        TriggerAction::Schedule => Some(ActionResult {
            next_action: Some(NextActionChange::Set(NextAction::FollowUp)),
            summary: Some("Scheduled for follow-up".into()),
            ..Default::default()
        }),
        TriggerAction::SendCold | TriggerAction::Reply | TriggerAction::FollowUp => None,
    }
}

fn email_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\w.+-]+@[\w.-]+").expect("email pattern"))
}

fn digits_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("digits pattern"))
}

pub fn extract_email(from: &str) -> Option<&str> {
    email_pattern().find(from).map(|m| m.as_str())
}

/// Contact id printed by `add-contact`: digits on the first line mentioning an id.
pub fn parse_contact_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter(|line| line.to_ascii_lowercase().contains("id"))
        .find_map(|line| digits_pattern().find(line).map(|m| m.as_str().to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    fn failure(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Subprocess bridge to the job-apply Node CLI (`<dir>/src/index.js`).
#[derive(Debug, Clone)]
pub struct JobApplyCli {
    pub node_bin: String,
    pub project_dir: PathBuf,
    pub timeout: Duration,
    pub send_timeout: Duration,
    pub template: String,
}

impl JobApplyCli {
    pub fn new(node_bin: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_bin: node_bin.into(),
            project_dir: project_dir.into(),
            timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(120),
            template: "cold_general".to_string(),
        }
    }

    fn entry(&self) -> PathBuf {
        self.project_dir.join("src").join("index.js")
    }

    pub async fn run(&self, args: &[&str], timeout: Duration) -> CliOutput {
        let entry = self.entry();
        let mut command = Command::new(&self.node_bin);
        command
            .arg(&entry)
            .args(args)
            .current_dir(&self.project_dir)
            .kill_on_drop(true);
        debug!(command = ?args, "running job-apply cli");

        match tokio::time::timeout(timeout, command.output()).await {
            Err(_) => CliOutput::failure("Command timed out"),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                CliOutput::failure(format!("CLI not found at {}", entry.display()))
            }
            Ok(Err(err)) => CliOutput::failure(err.to_string()),
            Ok(Ok(output)) => CliOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            },
        }
    }

    /// add company, add contact, schedule the cold template, send.
    async fn send_cold(&self, context: &ActionContext) -> ActionResult {
        let from = context.from.as_deref().unwrap_or_default();
        let Some(email) = extract_email(from) else {
            return ActionResult::failed(format!("No email found in From: {from}"));
        };
        let company = context.company.as_deref().unwrap_or_default();
        let name = context.name.as_deref().unwrap_or_default();

        let mut steps = vec![
            self.run(&["add-company", "-n", company, "-p", "5"], self.timeout)
                .await,
        ];
        let contact = self
            .run(
                &["add-contact", "-e", email, "-n", name, "-c", company, "--source", "notion"],
                self.timeout,
            )
            .await;
        if !contact.success {
            return ActionResult::failed(format!("Failed to add contact: {}", contact.stderr));
        }
        let Some(contact_id) = parse_contact_id(&contact.stdout) else {
            return ActionResult::failed("Could not determine contact ID");
        };
        steps.push(contact);
        steps.push(
            self.run(
                &["schedule", "-c", contact_id.as_str(), "-t", self.template.as_str()],
                self.timeout,
            )
            .await,
        );
        steps.push(self.run(&["send"], self.send_timeout).await);

        if let Some(failed) = steps.iter().find(|s| !s.success) {
            warn!(stderr = %failed.stderr, "cold email step failed");
            return ActionResult::failed("Send failed");
        }
        info!(contact_id = %contact_id, "cold email sent");
        ActionResult {
            stage: Some(Stage::Applied),
            next_action: Some(NextActionChange::Set(NextAction::FollowUp)),
            summary: Some(format!("Cold email sent to {email}")),
            error: None,
        }
    }

    async fn queue_followups(&self) -> ActionResult {
        let output = self.run(&["queue"], self.timeout).await;
        if !output.success {
            let message = if output.stderr.is_empty() {
                "Followup scheduling failed".to_string()
            } else {
                output.stderr
            };
            return ActionResult::failed(message);
        }
        ActionResult {
            next_action: Some(NextActionChange::Clear),
            summary: Some(format!("Followup queued at {}", Utc::now().format("%Y-%m-%d %H:%M"))),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ActionExecutor for JobApplyCli {
    async fn execute(
        &self,
        action: TriggerAction,
        context: &ActionContext,
    ) -> Result<ActionResult, AdapterError> {
        if let Some(result) = local_result(action) {
            return Ok(result);
        }
        Ok(match action {
            TriggerAction::SendCold => self.send_cold(context).await,
            _ => self.queue_followups().await,
        })
    }
}

/// In-memory executor: records calls and answers with the local results, or
/// with a scripted result per action.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<(TriggerAction, ActionContext)>>,
    scripted: Mutex<Vec<(TriggerAction, Result<ActionResult, String>)>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, action: TriggerAction, result: ActionResult) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((action, Ok(result)));
    }

    /// Makes `action` fail at the executor level instead of returning a result.
    pub fn script_failure(&self, action: TriggerAction, message: &str) {
        self.scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((action, Err(message.to_string())));
    }

    pub fn calls(&self) -> Vec<(TriggerAction, ActionContext)> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(
        &self,
        action: TriggerAction,
        context: &ActionContext,
    ) -> Result<ActionResult, AdapterError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((action, context.clone()));
        let scripted = self
            .scripted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|(a, _)| *a == action)
            .map(|(_, r)| r.clone());
        match scripted {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(AdapterError::Message(message)),
            None => Ok(local_result(action).unwrap_or(ActionResult {
                next_action: Some(NextActionChange::Clear),
                summary: Some(format!("{} done", action.as_str())),
                ..Default::default()
            })),
        }
    }
}
