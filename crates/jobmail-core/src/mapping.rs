//! Record -> database property mapping and page content.

use crate::{non_blank, props, resolve_thread_key, NextAction, PropertySet, PropertyValue, Record};

const GMAIL_SEARCH_LINK: &str = "https://mail.google.com/mail/u/0/#search/rfc822msgid:";

pub fn effort_level(action: NextAction) -> &'static str {
    match action {
        NextAction::CompleteAssessment | NextAction::SubmitMaterials | NextAction::SignOffer => {
            "High"
        }
        NextAction::Schedule | NextAction::Reply | NextAction::Escalate => "Medium",
        NextAction::FollowUp | NextAction::Archive | NextAction::Ignore => "Low",
    }
}

pub fn task_type(action: NextAction) -> &'static str {
    match action {
        NextAction::Reply => "Reply",
        NextAction::Schedule => "Schedule",
        NextAction::SubmitMaterials => "Submit Materials",
        NextAction::CompleteAssessment => "Assessment",
        NextAction::SignOffer => "Sign Offer",
        NextAction::FollowUp => "Follow Up",
        NextAction::Archive => "Archive",
        NextAction::Ignore => "Ignore",
        NextAction::Escalate => "Escalate",
    }
}

/// Deep link into webmail search for a message id; angle brackets stripped.
pub fn webmail_link(message_id: &str) -> Option<String> {
    let id = message_id.trim().trim_start_matches('<').trim_end_matches('>');
    if id.is_empty() {
        None
    } else {
        Some(format!("{GMAIL_SEARCH_LINK}{id}"))
    }
}

fn put_text(props: &mut PropertySet, name: &str, value: Option<&str>) {
    if let Some(value) = non_blank(value) {
        props.insert(name.to_string(), PropertyValue::text(value));
    }
}

/// Maps a record onto the database schema. Absent values are omitted, never
/// written as nulls. `Action Confirm` is always cleared.
pub fn map_properties(record: &Record) -> PropertySet {
    let mut props = PropertySet::new();
    let thread_key = resolve_thread_key(record);

    put_text(&mut props, props::CONVERSATION_ID, record.conversation_id.as_deref());
    put_text(&mut props, props::MESSAGE_ID, record.message_id.as_deref());
    put_text(&mut props, props::FROM, record.from.as_deref());
    put_text(&mut props, props::COMPANY, record.company.as_deref());
    put_text(&mut props, props::SUBJECT, record.subject.as_deref());
    if let Some(received) = non_blank(record.received_utc.as_deref()) {
        props.insert(props::RECEIVED_UTC.into(), PropertyValue::Date(received.trim().to_string()));
    }
    if let Some(stage) = record.stage {
        props.insert(props::STAGE.into(), PropertyValue::Choice(stage.as_str().into()));
    }
    if let Some(priority) = record.priority {
        props.insert(props::PRIORITY.into(), PropertyValue::Choice(priority.as_str().into()));
    }
    if let Some(score) = record.importance_score.filter(|s| s.is_finite()) {
        props.insert(props::IMPORTANCE_SCORE.into(), PropertyValue::Number(score));
    }
    if let Some(action) = record.next_action {
        props.insert(props::NEXT_ACTION.into(), PropertyValue::text(action.as_str()));
    }
    put_text(&mut props, props::SUMMARY, record.summary.as_deref());
    props.insert(
        props::LLM_STATUS.into(),
        PropertyValue::Choice(record.llm_status.as_str().into()),
    );
    put_text(&mut props, props::ERROR, record.error_msg.as_deref());
    if let Some(due) = record.due_date {
        props.insert(props::DUE_DATE.into(), PropertyValue::Date(due.to_string()));
    }

    if let Some(key) = &thread_key {
        props
            .entry(props::CONVERSATION_ID.into())
            .or_insert_with(|| PropertyValue::text(key.as_str()));
    }

    let name = non_blank(record.subject.as_deref())
        .or(thread_key.as_ref().map(|k| k.as_str()))
        .or(non_blank(record.company.as_deref()));
    if let Some(name) = name {
        props.insert(props::NAME.into(), PropertyValue::text(name));
    }

    let link = non_blank(record.web_link.as_deref())
        .map(|l| l.trim().to_string())
        .or_else(|| non_blank(record.message_id.as_deref()).and_then(webmail_link));
    if let Some(link) = link {
        props.insert(props::EMAIL_LINK.into(), PropertyValue::Text(link));
    }

    if let Some(summary) = non_blank(record.summary.as_deref()) {
        props.insert(props::DESCRIPTION.into(), PropertyValue::text(summary.trim()));
    }

    if let Some(action) = record.next_action {
        props.insert(
            props::EFFORT_LEVEL.into(),
            PropertyValue::Choice(effort_level(action).into()),
        );
        props.insert(
            props::TASK_TYPE.into(),
            PropertyValue::Labels(vec![task_type(action).into()]),
        );
    }

    props.insert(props::ACTION_CONFIRM.into(), PropertyValue::Bool(false));
    props
}

/// Page body for a record: a short header followed by the email body.
pub fn build_page_content(record: &Record) -> String {
    let from = record.from.as_deref().unwrap_or_default();
    let subject = record.subject.as_deref().unwrap_or_default();
    let body = record.body.as_deref().unwrap_or_default();
    format!("From: {from}\nSubject: {subject}\n\n{body}")
}

/// Splits content into paragraphs on blank lines, dropping empty ones.
pub fn paragraphs(content: &str) -> Vec<&str> {
    content.split("\n\n").filter(|p| !p.trim().is_empty()).collect()
}

/// Removes spreadsheet line-break escapes and collapses runs of blank lines.
pub fn sanitize_body(text: &str) -> String {
    let mut text = text.replace("_x000D_", "").replace("_x000A_", "\n").replace("\r\n", "\n");
    while text.contains("\n\n\n") {
        text = text.replace("\n\n\n", "\n\n");
    }
    text.trim().to_string()
}
