//! IMAP mailbox row source. Mailboxes are opened read-only.

use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use jobmail_core::{non_blank, LlmStatus, Record};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use regex::Regex;
use scraper::Html;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{AdapterError, RowSource};

pub const BODY_CHAR_LIMIT: usize = 5000;

const GENERIC_PROVIDERS: [&str; 5] =
    ["gmail.com", "yahoo.com", "outlook.com", "hotmail.com", "icloud.com"];

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub folder: String,
}

impl ImapConfig {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: "imap.gmail.com".to_string(),
            port: 993,
            user: user.into(),
            password: password.into(),
            folder: "INBOX".to_string(),
        }
    }

    fn validate(&self) -> Result<(), AdapterError> {
        if self.user.trim().is_empty() || self.password.trim().is_empty() {
            return Err(AdapterError::Config(
                "FROM_EMAIL and GMAIL_APP_PASSWORD are required".into(),
            ));
        }
        Ok(())
    }
}

/// Which messages a [`RowSource::fetch_records`] call returns.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchPlan {
    Unseen { limit: usize },
    Recent { days: i64, limit: usize },
    FromContacts { addresses: Vec<String>, limit: usize },
}

pub fn since_criteria(today: NaiveDate, days: i64) -> String {
    let since = today - Duration::days(days.max(0));
    format!("(SINCE \"{}\")", since.format("%d-%b-%Y"))
}

pub fn from_criteria(address: &str) -> String {
    format!("(FROM \"{}\")", address.trim().replace('"', ""))
}

/// First occurrence of each message id, in order. Messages without a
/// message id are dropped.
pub fn unique_by_message_id(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| match &record.message_id {
            Some(id) => seen.insert(id.clone()),
            None => false,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ImapSource {
    config: ImapConfig,
    plan: FetchPlan,
}

impl ImapSource {
    pub fn new(config: ImapConfig, plan: FetchPlan) -> Self {
        Self { config, plan }
    }

    /// Last `limit` messages matching `criteria` (0 = no limit), oldest first.
    pub async fn fetch_emails(
        &self,
        criteria: String,
        limit: usize,
    ) -> Result<Vec<Record>, AdapterError> {
        self.config.validate()?;
        let config = self.config.clone();
        let raws = tokio::task::spawn_blocking(move || fetch_raw(&config, &criteria, limit))
            .await
            .map_err(|e| AdapterError::Message(format!("imap worker failed: {e}")))??;

        let now = Utc::now();
        let mut records = Vec::with_capacity(raws.len());
        for raw in raws {
            match parse_message(&raw, now) {
                Ok(record) => records.push(record),
                Err(err) => warn!(error = %err, "skipping unparseable message"),
            }
        }
        Ok(records)
    }

    pub async fn fetch_recent(&self, days: i64, limit: usize) -> Result<Vec<Record>, AdapterError> {
        let criteria = since_criteria(Utc::now().date_naive(), days);
        self.fetch_emails(criteria, limit).await
    }

    /// Messages from any of `addresses`, deduplicated by message id.
    pub async fn fetch_from_contacts(
        &self,
        addresses: &[String],
        limit: usize,
    ) -> Result<Vec<Record>, AdapterError> {
        let mut fetched = Vec::new();
        for address in addresses.iter().filter(|a| !a.trim().is_empty()) {
            fetched.extend(self.fetch_emails(from_criteria(address), limit).await?);
        }
        Ok(unique_by_message_id(fetched))
    }
}

#[async_trait]
impl RowSource for ImapSource {
    fn source_id(&self) -> &'static str {
        "imap"
    }

    async fn fetch_records(&self) -> Result<Vec<Record>, AdapterError> {
        let records = match &self.plan {
            FetchPlan::Unseen { limit } => self.fetch_emails("UNSEEN".to_string(), *limit).await?,
            FetchPlan::Recent { days, limit } => self.fetch_recent(*days, *limit).await?,
            FetchPlan::FromContacts { addresses, limit } => {
                self.fetch_from_contacts(addresses, *limit).await?
            }
        };
        info!(host = %self.config.host, count = records.len(), "fetched messages");
        Ok(records)
    }
}

fn fetch_raw(
    config: &ImapConfig,
    criteria: &str,
    limit: usize,
) -> Result<Vec<Vec<u8>>, AdapterError> {
    let tls = native_tls::TlsConnector::builder().build()?;
    let client = imap::connect((config.host.as_str(), config.port), &config.host, &tls)?;
    let mut session = client
        .login(&config.user, &config.password)
        .map_err(|(err, _client)| err)?;
    session.examine(&config.folder)?;

    let mut seqs: Vec<u32> = session.search(criteria)?.into_iter().collect();
    seqs.sort_unstable();
    if limit > 0 && seqs.len() > limit {
        seqs.drain(..seqs.len() - limit);
    }
    debug!(criteria, matched = seqs.len(), "imap search");

    let mut fetched = Vec::with_capacity(seqs.len());
    if !seqs.is_empty() {
        let set = seqs.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        let messages = session.fetch(set, "RFC822")?;
        for message in messages.iter() {
            if let Some(body) = message.body() {
                fetched.push((message.message, body.to_vec()));
            }
        }
    }
    session.logout()?;

    fetched.sort_by_key(|(seq, _)| *seq);
    Ok(fetched.into_iter().map(|(_, raw)| raw).collect())
}

/// Builds a NEW record from one RFC 822 message.
pub fn parse_message(raw: &[u8], now: DateTime<Utc>) -> Result<Record, AdapterError> {
    let mail = mailparse::parse_mail(raw)?;
    let header = |name: &str| {
        mail.headers
            .get_first_value(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let from = header("From");
    let message_id = header("Message-ID");
    let received = header("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or(now);
    let conversation_id = conversation_id(
        header("References").as_deref(),
        header("In-Reply-To").as_deref(),
        message_id.as_deref(),
    );
    let company = from.as_deref().and_then(company_from_sender);
    let body: String = extract_body(&mail).chars().take(BODY_CHAR_LIMIT).collect();

    Ok(Record {
        message_id,
        conversation_id,
        subject: header("Subject"),
        from,
        company,
        received_utc: Some(received.to_rfc3339_opts(SecondsFormat::Secs, false)),
        body: Some(body),
        llm_status: LlmStatus::New,
        ..Default::default()
    }
    .normalized())
}

/// 16 hex chars of SHA-256 over the thread root: first `References` entry,
/// else `In-Reply-To`, else `Message-ID`.
pub fn conversation_id(
    references: Option<&str>,
    in_reply_to: Option<&str>,
    message_id: Option<&str>,
) -> Option<String> {
    let seed = references
        .and_then(|r| r.split_whitespace().next())
        .or_else(|| non_blank(in_reply_to).map(str::trim))
        .or_else(|| non_blank(message_id).map(str::trim))?;
    let digest = hex::encode(Sha256::digest(seed.as_bytes()));
    Some(digest[..16].to_string())
}

fn sender_domain() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([\w.-]+)").expect("sender domain pattern"))
}

fn title_case(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut boundary = true;
    for ch in word.chars() {
        if boundary {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        boundary = !ch.is_alphabetic();
    }
    out
}

/// Employer guess from the sender's domain label; generic providers give `None`.
pub fn company_from_sender(from: &str) -> Option<String> {
    let domain = sender_domain().captures(from)?.get(1)?.as_str().to_lowercase();
    if GENERIC_PROVIDERS.contains(&domain.as_str()) {
        return None;
    }
    let label = domain.split('.').next().filter(|l| !l.is_empty())?;
    Some(title_case(label))
}

fn is_attachment(part: &ParsedMail<'_>) -> bool {
    part.get_content_disposition().disposition == DispositionType::Attachment
}

fn find_part<'m, 'a>(mail: &'m ParsedMail<'a>, mimetype: &str) -> Option<&'m ParsedMail<'a>> {
    if mail.subparts.is_empty() {
        let wanted = mail.ctype.mimetype.eq_ignore_ascii_case(mimetype);
        return (wanted && !is_attachment(mail)).then_some(mail);
    }
    mail.subparts.iter().find_map(|part| find_part(part, mimetype))
}

/// text/plain body, falling back to text/html stripped to its text.
pub fn extract_body(mail: &ParsedMail<'_>) -> String {
    if let Some(part) = find_part(mail, "text/plain") {
        return part.get_body().unwrap_or_default();
    }
    if let Some(part) = find_part(mail, "text/html") {
        return html_to_text(&part.get_body().unwrap_or_default());
    }
    String::new()
}

pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|el| el.name().to_string()))
            .is_some_and(|name| matches!(name.as_str(), "script" | "style" | "title"));
        if !hidden {
            out.push_str(text);
        }
    }
    out.trim().to_string()
}
