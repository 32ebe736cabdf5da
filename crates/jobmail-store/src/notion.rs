//! Notion REST client implementing [`DocumentStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use jobmail_core::{paragraphs, props, PropertySet, PropertyValue};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::http::{HttpClientConfig, RequestKind, RetryingClient};
use crate::{DocumentStore, RemotePage, StoreError};

pub const NOTION_API_BASE: &str = "https://api.notion.com/v1";
pub const NOTION_VERSION: &str = "2022-06-28";
pub const DEFAULT_QUERY_PROPERTIES: [&str; 4] =
    ["Conversation ID", "Identity", "Name", "Message ID"];

const RICH_TEXT_LIMIT: usize = 2000;
const CHILDREN_PER_REQUEST: usize = 100;
const PAGE_SIZE: usize = 100;

/// Database property types the mapper writes. Types discovered on the live
/// database take precedence.
pub const PROPERTY_TYPES: &[(&str, &str)] = &[
    (props::NAME, "title"),
    (props::COMPANY, "rich_text"),
    (props::CONVERSATION_ID, "rich_text"),
    (props::ACTION_CONFIRM, "checkbox"),
    (props::STATUS_UPDATED, "checkbox"),
    (props::EMAIL_LINK, "url"),
    (props::ERROR, "rich_text"),
    (props::FROM, "rich_text"),
    (props::IMPORTANCE_SCORE, "number"),
    (props::LLM_STATUS, "select"),
    (props::MESSAGE_ID, "rich_text"),
    (props::NEXT_ACTION, "rich_text"),
    (props::PRIORITY, "select"),
    (props::RECEIVED_UTC, "date"),
    (props::STAGE, "select"),
    (props::SUBJECT, "rich_text"),
    (props::SUMMARY, "rich_text"),
    (props::DESCRIPTION, "rich_text"),
    (props::EFFORT_LEVEL, "select"),
    (props::TASK_TYPE, "multi_select"),
    (props::DUE_DATE, "date"),
];

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub token: String,
    pub database_id: String,
    pub api_base: String,
    pub query_properties: Vec<String>,
    pub http: HttpClientConfig,
}

impl NotionConfig {
    pub fn new(token: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            database_id: database_id.into(),
            api_base: NOTION_API_BASE.to_string(),
            query_properties: DEFAULT_QUERY_PROPERTIES.iter().map(|p| p.to_string()).collect(),
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct NotionStore {
    token: String,
    database_id: String,
    api_base: String,
    query_properties: Vec<String>,
    http: RetryingClient,
    schema: RwLock<HashMap<String, String>>,
}

impl NotionStore {
    pub fn new(config: NotionConfig) -> Result<Self, StoreError> {
        if config.token.trim().is_empty() {
            return Err(StoreError::Config("Notion token is required".into()));
        }
        if config.database_id.trim().is_empty() {
            return Err(StoreError::Config("Notion database_id is required".into()));
        }
        let query_properties = if config.query_properties.is_empty() {
            DEFAULT_QUERY_PROPERTIES.iter().map(|p| p.to_string()).collect()
        } else {
            config.query_properties
        };
        Ok(Self {
            token: config.token,
            database_id: config.database_id,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            query_properties,
            http: RetryingClient::new(&config.http)?,
            schema: RwLock::new(HashMap::new()),
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Value, StoreError> {
        Ok(self
            .http
            .send_json(RequestKind::Idempotent, |c| self.authorize(c.get(url)).query(query))
            .await?)
    }

    async fn post(&self, kind: RequestKind, url: &str, body: &Value) -> Result<Value, StoreError> {
        Ok(self
            .http
            .send_json(kind, |c| self.authorize(c.post(url)).json(body))
            .await?)
    }

    async fn patch(&self, kind: RequestKind, url: &str, body: &Value) -> Result<Value, StoreError> {
        Ok(self
            .http
            .send_json(kind, |c| self.authorize(c.patch(url)).json(body))
            .await?)
    }

    fn database_url(&self) -> String {
        format!("{}/databases/{}", self.api_base, self.database_id)
    }

    async fn query_database(
        &self,
        filter: Value,
        sorts: Option<Value>,
    ) -> Result<Vec<RemotePage>, StoreError> {
        let url = format!("{}/query", self.database_url());
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut body = json!({ "filter": filter, "page_size": PAGE_SIZE });
            if let Some(sorts) = &sorts {
                body["sorts"] = sorts.clone();
            }
            if let Some(cursor) = &cursor {
                body["start_cursor"] = json!(cursor);
            }
            let data = self.post(RequestKind::Idempotent, &url, &body).await?;
            pages.extend(decode_results(&url, &data)?);
            cursor = next_cursor(&data);
            if cursor.is_none() {
                return Ok(pages);
            }
        }
    }

    /// Appends add blocks again when resent, so only rate limits and failed
    /// connects are retried.
    async fn append_children(&self, page_id: &str, children: &[Value]) -> Result<(), StoreError> {
        let url = format!("{}/blocks/{}/children", self.api_base, page_id);
        for batch in children.chunks(CHILDREN_PER_REQUEST) {
            self.patch(RequestKind::NonIdempotent, &url, &json!({ "children": batch }))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for NotionStore {
    async fn query_by_thread_key(&self, key: &str) -> Result<Vec<RemotePage>, StoreError> {
        let mut last_error = None;
        for prop in &self.query_properties {
            match self
                .query_database(json!({ "property": prop, "rich_text": { "equals": key } }), None)
                .await
            {
                Ok(pages) => return Ok(pages),
                Err(err) if err.is_missing_property() => {
                    debug!(property = %prop, "query property missing on database");
                    last_error = Some(err);
                    continue;
                }
                Err(err) => last_error = Some(err),
            }
            // the property exists but is not rich text; Name is usually the title
            match self
                .query_database(json!({ "property": prop, "title": { "equals": key } }), None)
                .await
            {
                Ok(pages) => return Ok(pages),
                Err(err) => last_error = Some(err),
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(Vec::new()),
        }
    }

    async fn get_page_properties(&self, page_id: &str) -> Result<PropertySet, StoreError> {
        let url = format!("{}/pages/{}", self.api_base, page_id);
        let data = self.get(&url, &[]).await?;
        Ok(decode_properties(data.get("properties").unwrap_or(&Value::Null)))
    }

    async fn get_page_plaintext(&self, page_id: &str) -> Result<String, StoreError> {
        let url = format!("{}/blocks/{}/children", self.api_base, page_id);
        let mut texts = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![("page_size", PAGE_SIZE.to_string())];
            if let Some(cursor) = &cursor {
                query.push(("start_cursor", cursor.clone()));
            }
            let data = self.get(&url, &query).await?;
            if let Some(results) = data.get("results").and_then(Value::as_array) {
                texts.extend(results.iter().map(block_text).filter(|t| !t.is_empty()));
            }
            cursor = next_cursor(&data);
            if cursor.is_none() {
                break;
            }
        }
        Ok(texts.join("\n\n"))
    }

    async fn create_page(
        &self,
        properties: &PropertySet,
        content: &str,
    ) -> Result<String, StoreError> {
        let url = format!("{}/pages", self.api_base);
        let payload = {
            let schema = self.schema.read().await;
            properties_payload(&schema, properties)
        };
        let children = children_from_content(content);
        let (first, rest) = children.split_at(children.len().min(CHILDREN_PER_REQUEST));
        let body = json!({
            "parent": { "database_id": self.database_id },
            "properties": payload,
            "children": first,
        });
        let data = self.post(RequestKind::NonIdempotent, &url, &body).await?;
        let page_id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Decode {
                url: url.clone(),
                message: "created page has no id".into(),
            })?
            .to_string();
        if !rest.is_empty() {
            self.append_children(&page_id, rest).await?;
        }
        Ok(page_id)
    }

    async fn update_page(
        &self,
        page_id: &str,
        properties: &PropertySet,
        content_append: Option<&str>,
    ) -> Result<(), StoreError> {
        let url = format!("{}/pages/{}", self.api_base, page_id);
        let payload = {
            let schema = self.schema.read().await;
            properties_payload(&schema, properties)
        };
        self.patch(RequestKind::Idempotent, &url, &json!({ "properties": payload }))
            .await?;
        if let Some(content) = content_append {
            let children = children_from_content(content);
            if !children.is_empty() {
                self.append_children(page_id, &children).await?;
            }
        }
        Ok(())
    }

    async fn append_log(&self, page_id: &str, line: &str) -> Result<(), StoreError> {
        self.append_children(page_id, &[callout_block(line)]).await
    }

    async fn query_action_requests(&self) -> Result<Vec<RemotePage>, StoreError> {
        self.query_database(
            json!({
                "and": [{ "property": props::ACTION_CONFIRM, "checkbox": { "equals": true } }]
            }),
            Some(json!([{ "property": props::IMPORTANCE_SCORE, "direction": "descending" }])),
        )
        .await
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let url = self.database_url();
        let db = self.get(&url, &[]).await?;
        let existing: HashMap<String, String> = db
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .filter_map(|(name, meta)| {
                        meta.get("type")
                            .and_then(Value::as_str)
                            .map(|t| (name.clone(), t.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut to_add = Map::new();
        for (name, ptype) in PROPERTY_TYPES {
            if !existing.contains_key(*name) && *ptype != "title" {
                to_add.insert(name.to_string(), schema_definition(ptype));
            }
        }

        let mut schema = self.schema.write().await;
        schema.extend(existing);
        if !to_add.is_empty() {
            let added: Vec<String> = to_add.keys().cloned().collect();
            let body = json!({ "properties": Value::Object(to_add) });
            self.patch(RequestKind::Idempotent, &url, &body).await?;
            for (name, ptype) in PROPERTY_TYPES {
                if added.iter().any(|a| a == name) {
                    schema.insert(name.to_string(), ptype.to_string());
                }
            }
            info!(added = ?added, "created missing database properties");
        }
        Ok(())
    }
}

fn next_cursor(data: &Value) -> Option<String> {
    if !data.get("has_more").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    data.get("next_cursor").and_then(Value::as_str).map(str::to_string)
}

fn decode_results(url: &str, data: &Value) -> Result<Vec<RemotePage>, StoreError> {
    let results = data
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::Decode {
            url: url.to_string(),
            message: "missing results array".into(),
        })?;
    Ok(results
        .iter()
        .filter_map(|page| {
            let id = page.get("id")?.as_str()?.to_string();
            let properties = decode_properties(page.get("properties").unwrap_or(&Value::Null));
            Some(RemotePage { id, properties })
        })
        .collect())
}

fn property_type<'a>(schema: &'a HashMap<String, String>, name: &str) -> &'a str {
    if let Some(found) = schema.get(name) {
        return found;
    }
    PROPERTY_TYPES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, t)| *t)
        .unwrap_or("rich_text")
}

fn schema_definition(ptype: &str) -> Value {
    match ptype {
        "select" => json!({ "select": { "options": [] } }),
        "multi_select" => json!({ "multi_select": { "options": [] } }),
        "number" | "title" | "url" | "date" | "checkbox" => json!({ ptype: {} }),
        _ => json!({ "rich_text": {} }),
    }
}

/// Rich text array for `content`, split into Notion's per-item length limit.
fn rich_text(content: &str) -> Value {
    let mut items = Vec::new();
    let mut chunk = String::new();
    for ch in content.chars() {
        if chunk.chars().count() >= RICH_TEXT_LIMIT {
            items.push(json!({ "type": "text", "text": { "content": chunk } }));
            chunk = String::new();
        }
        chunk.push(ch);
    }
    if !chunk.is_empty() {
        items.push(json!({ "type": "text", "text": { "content": chunk } }));
    }
    Value::Array(items)
}

fn truthy(text: &str) -> bool {
    matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "y")
}

/// Wire payload for a property set, typed by the database schema.
pub fn properties_payload(schema: &HashMap<String, String>, properties: &PropertySet) -> Value {
    let mut payload = Map::new();
    for (name, value) in properties {
        let text = value.as_text();
        let encoded = match property_type(schema, name) {
            "number" => match value.as_number() {
                Some(n) => json!({ "number": n }),
                None => json!({ "rich_text": rich_text(&text) }),
            },
            "title" => json!({ "title": rich_text(&text) }),
            "url" => {
                if text.trim().is_empty() {
                    json!({ "url": null })
                } else {
                    json!({ "url": text })
                }
            }
            "date" => json!({ "date": { "start": text } }),
            "checkbox" => json!({ "checkbox": value.as_bool().unwrap_or_else(|| truthy(&text)) }),
            "select" | "status" => {
                if text.trim().is_empty() {
                    json!({ "select": null })
                } else {
                    json!({ "select": { "name": text } })
                }
            }
            "multi_select" => {
                let names: Vec<String> = match value {
                    PropertyValue::Labels(labels) => labels.clone(),
                    _ => vec![text],
                };
                let options: Vec<Value> = names
                    .into_iter()
                    .filter(|n| !n.trim().is_empty())
                    .map(|n| json!({ "name": n }))
                    .collect();
                json!({ "multi_select": options })
            }
            _ => json!({ "rich_text": rich_text(&text) }),
        };
        payload.insert(name.clone(), encoded);
    }
    Value::Object(payload)
}

/// One paragraph block per blank-line separated paragraph.
pub fn children_from_content(content: &str) -> Vec<Value> {
    paragraphs(content)
        .into_iter()
        .map(|p| {
            json!({
                "object": "block",
                "type": "paragraph",
                "paragraph": { "rich_text": rich_text(p) },
            })
        })
        .collect()
}

pub fn callout_block(line: &str) -> Value {
    json!({
        "object": "block",
        "type": "callout",
        "callout": {
            "icon": { "type": "emoji", "emoji": "\u{1f4e7}" },
            "rich_text": rich_text(line),
        },
    })
}

fn rich_text_plain(items: Option<&Value>) -> String {
    items
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|rt| {
                    rt.get("plain_text")
                        .and_then(Value::as_str)
                        .or_else(|| {
                            rt.get("text")
                                .and_then(|t| t.get("content"))
                                .and_then(Value::as_str)
                        })
                })
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn block_text(block: &Value) -> String {
    let Some(btype) = block.get("type").and_then(Value::as_str) else {
        return String::new();
    };
    rich_text_plain(block.get(btype).and_then(|b| b.get("rich_text")))
}

fn decode_property(value: &Value) -> Option<PropertyValue> {
    let ptype = value.get("type")?.as_str()?;
    let inner = value.get(ptype)?;
    match ptype {
        "title" | "rich_text" => Some(PropertyValue::Text(rich_text_plain(Some(inner)))),
        "select" | "status" => inner
            .get("name")
            .and_then(Value::as_str)
            .map(|n| PropertyValue::Choice(n.to_string())),
        "multi_select" => Some(PropertyValue::Labels(
            inner
                .as_array()?
                .iter()
                .filter_map(|o| o.get("name").and_then(Value::as_str).map(str::to_string))
                .collect(),
        )),
        "number" => inner.as_f64().map(PropertyValue::Number),
        "checkbox" => inner.as_bool().map(PropertyValue::Bool),
        "url" | "email" | "phone_number" => {
            inner.as_str().map(|s| PropertyValue::Text(s.to_string()))
        }
        "date" => inner
            .get("start")
            .and_then(Value::as_str)
            .map(|s| PropertyValue::Date(s.to_string())),
        _ => None,
    }
}

/// Decodes a Notion `properties` object. Empty and unsupported values are skipped.
pub fn decode_properties(value: &Value) -> PropertySet {
    value
        .as_object()
        .map(|props| {
            props
                .iter()
                .filter_map(|(name, v)| decode_property(v).map(|pv| (name.clone(), pv)))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_credentials() {
        let err = NotionStore::new(NotionConfig::new("", "db")).unwrap_err();
        assert_eq!(err.to_string(), "Notion token is required");
        let err = NotionStore::new(NotionConfig::new("secret", " ")).unwrap_err();
        assert_eq!(err.to_string(), "Notion database_id is required");
    }

    #[test]
    fn payload_uses_static_types_then_discovered_ones() {
        let mut props = PropertySet::new();
        props.insert("Name".into(), PropertyValue::text("Offer letter"));
        props.insert("Stage".into(), PropertyValue::Choice("offer".into()));
        props.insert("Importance Score".into(), PropertyValue::Number(0.9));
        props.insert("Action Confirm".into(), PropertyValue::Bool(false));
        props.insert("Task type".into(), PropertyValue::Labels(vec!["Sign Offer".into()]));
        props.insert("Next Action".into(), PropertyValue::text(""));

        let mut schema = HashMap::new();
        let payload = properties_payload(&schema, &props);
        assert_eq!(payload["Name"]["title"][0]["text"]["content"], "Offer letter");
        assert_eq!(payload["Stage"]["select"]["name"], "offer");
        assert_eq!(payload["Importance Score"]["number"], 0.9);
        assert_eq!(payload["Action Confirm"]["checkbox"], false);
        assert_eq!(payload["Task type"]["multi_select"][0]["name"], "Sign Offer");
        assert_eq!(payload["Next Action"]["rich_text"], json!([]));

        schema.insert("Stage".to_string(), "rich_text".to_string());
        let payload = properties_payload(&schema, &props);
        assert_eq!(payload["Stage"]["rich_text"][0]["text"]["content"], "offer");
    }

    #[test]
    fn long_paragraphs_are_chunked_within_one_block() {
        let long = "a".repeat(RICH_TEXT_LIMIT + 10);
        let children = children_from_content(&format!("From: x\nSubject: y\n\n{long}"));
        assert_eq!(children.len(), 2);
        let items = children[1]["paragraph"]["rich_text"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["text"]["content"], "a".repeat(10));
        assert_eq!(block_text(&children[1]), long);
    }

    #[test]
    fn log_entries_are_callouts() {
        let block = callout_block("[2026-02-03 09:05 UTC] Action 'reply' completed successfully");
        assert_eq!(block["type"], "callout");
        assert_eq!(block["callout"]["icon"]["emoji"], "\u{1f4e7}");
        assert_eq!(
            block_text(&block),
            "[2026-02-03 09:05 UTC] Action 'reply' completed successfully"
        );
    }

    #[test]
    fn decodes_page_properties() {
        let raw = json!({
            "Name": {
                "type": "title",
                "title": [{ "plain_text": "Interview " }, { "plain_text": "invite" }]
            },
            "Stage": { "type": "select", "select": { "name": "applied" } },
            "Priority": { "type": "select", "select": null },
            "Importance Score": { "type": "number", "number": 0.4 },
            "Action Confirm": { "type": "checkbox", "checkbox": true },
            "Email Link": { "type": "url", "url": "https://mail.example/1" },
            "Received UTC": { "type": "date", "date": { "start": "2026-02-01" } },
            "Task type": { "type": "multi_select", "multi_select": [{ "name": "Reply" }] },
            "Owner": { "type": "people", "people": [] }
        });
        let props = decode_properties(&raw);
        assert_eq!(props["Name"], PropertyValue::text("Interview invite"));
        assert_eq!(props["Stage"], PropertyValue::Choice("applied".into()));
        assert!(!props.contains_key("Priority"));
        assert!(!props.contains_key("Owner"));
        assert_eq!(props["Importance Score"], PropertyValue::Number(0.4));
        assert_eq!(props["Action Confirm"], PropertyValue::Bool(true));
        assert_eq!(props["Received UTC"], PropertyValue::Date("2026-02-01".into()));
        assert_eq!(props["Task type"], PropertyValue::Labels(vec!["Reply".into()]));
    }

    #[test]
    fn cursor_only_follows_has_more() {
        assert_eq!(next_cursor(&json!({ "has_more": false, "next_cursor": "c" })), None);
        assert_eq!(
            next_cursor(&json!({ "has_more": true, "next_cursor": "c2" })),
            Some("c2".to_string())
        );
    }

    #[test]
    fn missing_property_errors_are_recognized() {
        let err = StoreError::Http(crate::HttpError::Status {
            status: 400,
            url: "https://api.notion.com/v1/databases/x/query".into(),
            detail: "{\"message\":\"Could not find property with name or id: Identity\"}".into(),
        });
        assert!(err.is_missing_property());
        assert!(!StoreError::NotFound("p".into()).is_missing_property());
    }
}
