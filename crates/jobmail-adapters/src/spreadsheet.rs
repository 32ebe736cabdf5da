//! Legacy spreadsheet path: first worksheet of an `.xlsx` workbook, one
//! record per row, headers in the first row.

use std::collections::HashSet;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDate;
use jobmail_core::{
    is_blank, sanitize_body, LlmStatus, NextAction, Priority, Record, Stage, SyncOutcome,
};
use rust_xlsxwriter::Workbook;
use tracing::{info, warn};

use crate::AdapterError;

/// Columns of a fresh sheet, in order.
pub const COLUMNS: [&str; 18] = [
    "message_id",
    "conversation_id",
    "web_link",
    "received_utc",
    "from",
    "subject",
    "company",
    "body",
    "llm_status",
    "llm_processed_utc",
    "error_msg",
    "notion_page_id",
    "stage",
    "priority",
    "next_action",
    "summary",
    "importance_score",
    "due_date",
];

/// Blank text, or a `NaN` left behind by a dataframe export.
fn is_missing(text: &str) -> bool {
    is_blank(text) || text.trim().eq_ignore_ascii_case("nan")
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Cell {
    fn from_data(data: &Data) -> Self {
        match data {
            Data::Empty | Data::Error(_) => Cell::Empty,
            Data::String(s) => Cell::Text(s.clone()),
            Data::Int(n) => Cell::Number(*n as f64),
            Data::Float(f) => Cell::Number(*f),
            Data::Bool(b) => Cell::Bool(*b),
            Data::DateTime(dt) => match dt.as_datetime() {
                Some(at) if at.time() == chrono::NaiveTime::MIN => {
                    Cell::Text(at.date().to_string())
                }
                Some(at) => Cell::Text(at.format("%Y-%m-%dT%H:%M:%S").to_string()),
                None => Cell::Text(dt.to_string()),
            },
            Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
        }
    }

    fn from_text(value: Option<&str>) -> Self {
        match value {
            Some(v) if !is_missing(v) => Cell::Text(v.to_string()),
            _ => Cell::Empty,
        }
    }

    /// Text form; `None` for empty or blank cells.
    pub fn text(&self) -> Option<String> {
        let text = match self {
            Cell::Empty => return None,
            Cell::Text(s) => s.clone(),
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Cell::Number(n) => n.to_string(),
            Cell::Bool(b) => b.to_string(),
        };
        (!is_missing(&text)).then_some(text)
    }

    pub fn number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            Cell::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

fn spreadsheet_error(path: &Path, err: impl std::fmt::Display) -> AdapterError {
    AdapterError::Spreadsheet(format!("{}: {err}", path.display()))
}

fn parse_label<T>(
    row: usize,
    column: &str,
    label: Option<String>,
    parse: fn(&str) -> Option<T>,
) -> Option<T> {
    let label = label?;
    let parsed = parse(&label);
    if parsed.is_none() {
        warn!(row, column, label = %label, "dropping unrecognized label");
    }
    parsed
}

impl Sheet {
    pub fn with_columns() -> Self {
        Self {
            headers: COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn from_records(records: &[Record]) -> Self {
        let mut sheet = Self::with_columns();
        for record in records {
            let row = sheet.push_row();
            sheet.store_record(row, record);
        }
        sheet
    }

    pub fn read(path: &Path) -> Result<Self, AdapterError> {
        let mut workbook = open_workbook_auto(path).map_err(|e| spreadsheet_error(path, e))?;
        let Some(name) = workbook.sheet_names().first().cloned() else {
            return Ok(Self::default());
        };
        let range = workbook.worksheet_range(&name).map_err(|e| spreadsheet_error(path, e))?;

        let mut rows = range.rows();
        let headers: Vec<String> = match rows.next() {
            Some(header) => header
                .iter()
                .map(|c| Cell::from_data(c).text().unwrap_or_default().trim().to_string())
                .collect(),
            None => return Ok(Self::default()),
        };
        let width = headers.len();
        let rows = rows
            .map(|row| {
                let mut cells: Vec<Cell> = row.iter().take(width).map(Cell::from_data).collect();
                cells.resize(width, Cell::Empty);
                cells
            })
            .filter(|cells| cells.iter().any(|c| c.text().is_some()))
            .collect();
        Ok(Self { headers, rows })
    }

    /// Rewrites the whole workbook with this sheet as its only worksheet.
    pub fn write(&self, path: &Path) -> Result<(), AdapterError> {
        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        for (col, name) in self.headers.iter().enumerate() {
            worksheet
                .write_string(0, col as u16, name)
                .map_err(|e| spreadsheet_error(path, e))?;
        }
        for (r, row) in self.rows.iter().enumerate() {
            let r = (r + 1) as u32;
            for (c, cell) in row.iter().enumerate() {
                let c = c as u16;
                let written = match cell {
                    Cell::Empty => continue,
                    Cell::Text(s) => worksheet.write_string(r, c, s).map(|_| ()),
                    Cell::Number(n) => worksheet.write_number(r, c, *n).map(|_| ()),
                    Cell::Bool(b) => worksheet.write_boolean(r, c, *b).map(|_| ()),
                };
                written.map_err(|e| spreadsheet_error(path, e))?;
            }
        }
        workbook.save(path).map_err(|e| spreadsheet_error(path, e))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column(name) {
            return idx;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.push(Cell::Empty);
        }
        self.headers.len() - 1
    }

    fn push_row(&mut self) -> usize {
        self.rows.push(vec![Cell::Empty; self.headers.len()]);
        self.rows.len() - 1
    }

    pub fn cell(&self, row: usize, name: &str) -> Option<&Cell> {
        let col = self.column(name)?;
        self.rows.get(row)?.get(col)
    }

    pub fn text(&self, row: usize, name: &str) -> Option<String> {
        self.cell(row, name).and_then(Cell::text)
    }

    pub fn set(&mut self, row: usize, name: &str, value: Cell) {
        let col = self.ensure_column(name);
        if let Some(cells) = self.rows.get_mut(row) {
            cells[col] = value;
        }
    }

    /// Raw `llm_status` label, `None` when the cell is blank.
    pub fn status(&self, row: usize) -> Option<String> {
        self.text(row, "llm_status").map(|s| s.trim().to_ascii_uppercase())
    }

    /// Validated record for one row. Unrecognized enum labels are dropped.
    pub fn record(&self, row: usize) -> Record {
        let text = |name: &str| self.text(row, name);
        Record {
            message_id: text("message_id"),
            conversation_id: text("conversation_id"),
            web_link: text("web_link"),
            from: text("from"),
            subject: text("subject"),
            company: text("company"),
            received_utc: text("received_utc"),
            body: text("body"),
            stage: parse_label(row, "stage", text("stage"), Stage::parse),
            priority: parse_label(row, "priority", text("priority"), Priority::parse),
            next_action: parse_label(row, "next_action", text("next_action"), NextAction::parse),
            summary: text("summary"),
            importance_score: self.cell(row, "importance_score").and_then(Cell::number),
            due_date: text("due_date")
                .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok()),
            llm_status: parse_label(row, "llm_status", text("llm_status"), LlmStatus::parse)
                .unwrap_or_default(),
            llm_processed_utc: text("llm_processed_utc"),
            error_msg: text("error_msg"),
            notion_page_id: text("notion_page_id"),
        }
        .normalized()
    }

    pub fn records(&self) -> Vec<Record> {
        (0..self.rows.len()).map(|row| self.record(row)).collect()
    }

    /// Writes every record field back into `row`, adding missing columns.
    pub fn store_record(&mut self, row: usize, record: &Record) {
        let fields: [(&str, Option<&str>); 13] = [
            ("message_id", record.message_id.as_deref()),
            ("conversation_id", record.conversation_id.as_deref()),
            ("web_link", record.web_link.as_deref()),
            ("received_utc", record.received_utc.as_deref()),
            ("from", record.from.as_deref()),
            ("subject", record.subject.as_deref()),
            ("company", record.company.as_deref()),
            ("body", record.body.as_deref()),
            ("llm_processed_utc", record.llm_processed_utc.as_deref()),
            ("error_msg", record.error_msg.as_deref()),
            ("notion_page_id", record.notion_page_id.as_deref()),
            ("summary", record.summary.as_deref()),
            ("llm_status", Some(record.llm_status.as_str())),
        ];
        for (name, value) in fields {
            self.set(row, name, Cell::from_text(value));
        }
        self.set(row, "stage", Cell::from_text(record.stage.map(Stage::as_str)));
        self.set(row, "priority", Cell::from_text(record.priority.map(Priority::as_str)));
        self.set(row, "next_action", Cell::from_text(record.next_action.map(NextAction::as_str)));
        self.set(
            row,
            "importance_score",
            record.importance_score.map(Cell::Number).unwrap_or_default(),
        );
        let due = record.due_date.map(|d| d.to_string());
        self.set(row, "due_date", Cell::from_text(due.as_deref()));
    }

    /// Sync result write-back: page id (when known), status and error.
    pub fn apply_outcome(&mut self, row: usize, outcome: &SyncOutcome) {
        if let Some(page_id) = &outcome.page_id {
            self.set(row, "notion_page_id", Cell::Text(page_id.clone()));
        }
        self.set(row, "llm_status", Cell::Text(outcome.status.as_str().to_string()));
        self.set(row, "error_msg", Cell::from_text(outcome.error.as_deref()));
    }

    /// Rows still waiting for classification: blank or NEW status.
    pub fn pending_count(&self) -> usize {
        (0..self.rows.len())
            .filter(|&row| matches!(self.status(row).as_deref(), None | Some("NEW")))
            .count()
    }

    pub fn sanitize_bodies(&mut self) {
        let Some(col) = self.column("body") else {
            return;
        };
        for row in &mut self.rows {
            if let Cell::Text(body) = &row[col] {
                row[col] = Cell::Text(sanitize_body(body));
            }
        }
    }

    fn message_key(&self, row: usize) -> Option<String> {
        self.text(row, "message_id").map(|m| m.trim().to_string())
    }

    fn append_from(&mut self, other: &Sheet, row: usize) {
        let target = self.push_row();
        for (col, name) in other.headers.iter().enumerate() {
            if let Some(cell) = other.rows[row].get(col) {
                self.set(target, name, cell.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub kept: usize,
    pub pending: usize,
}

/// Keeps every local row that has a message id and adds the source rows the
/// local copy does not know yet. Without a usable local copy the source is
/// taken as-is.
pub fn merge_local_copy(source: Sheet, local: Option<Sheet>) -> (Sheet, MergeStats) {
    let keyed = source.column("message_id").is_some();
    let usable = local.filter(|l| keyed && !l.is_empty() && l.column("message_id").is_some());
    let Some(local) = usable else {
        let added = source.len();
        return (source, MergeStats { added, ..Default::default() });
    };

    let mut merged = Sheet {
        headers: local.headers.clone(),
        rows: Vec::new(),
    };
    let mut seen = HashSet::new();
    let mut stats = MergeStats::default();
    for row in 0..local.len() {
        let Some(key) = local.message_key(row) else {
            continue;
        };
        if seen.insert(key) {
            merged.append_from(&local, row);
        }
        stats.kept += 1;
    }
    for row in 0..source.len() {
        if let Some(key) = source.message_key(row) {
            if !seen.insert(key) {
                continue;
            }
        }
        merged.append_from(&source, row);
        stats.added += 1;
    }
    (merged, stats)
}

/// Merges `source_path` into the working copy at `local_path`, cleans bodies
/// and writes the working copy.
pub fn copy_and_merge_to_local(
    source_path: &Path,
    local_path: &Path,
    force_refresh: bool,
) -> Result<MergeStats, AdapterError> {
    if !source_path.exists() {
        return Err(AdapterError::Spreadsheet(format!(
            "source file not found: {}",
            source_path.display()
        )));
    }
    let source = Sheet::read(source_path)?;

    let local = if local_path.exists() && !force_refresh {
        match Sheet::read(local_path) {
            Ok(sheet) => Some(sheet),
            Err(err) => {
                warn!(error = %err, "could not read local copy; using source as-is");
                None
            }
        }
    } else {
        None
    };

    let (mut merged, mut stats) = merge_local_copy(source, local);
    merged.sanitize_bodies();
    merged.write(local_path)?;
    stats.pending = merged.pending_count();
    info!(
        local = %local_path.display(),
        added = stats.added,
        kept = stats.kept,
        pending = stats.pending,
        "local copy ready"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(message_id: &str, status: &str, body: &str) -> Record {
        Record {
            message_id: Some(message_id.into()),
            subject: Some(format!("About {message_id}")),
            body: Some(body.into()),
            llm_status: LlmStatus::parse(status).unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn record_parsing_drops_unknown_labels_and_blank_cells() {
        let mut sheet = Sheet::with_columns();
        let r = sheet.push_row();
        sheet.set(r, "message_id", Cell::Text(" <m1> ".into()));
        sheet.set(r, "stage", Cell::Text("Interviewed".into()));
        sheet.set(r, "priority", Cell::Text("urgent!!".into()));
        sheet.set(r, "importance_score", Cell::Text("0.75".into()));
        sheet.set(r, "notion_page_id", Cell::Text("nan".into()));
        sheet.set(r, "due_date", Cell::Text("2026-03-01".into()));
        sheet.set(r, "row_id", Cell::Number(7.0));

        let record = sheet.record(r);
        assert_eq!(record.message_id.as_deref(), Some("<m1>"));
        assert_eq!(record.stage, Some(Stage::Interviewed));
        assert_eq!(record.priority, None);
        assert_eq!(record.importance_score, Some(0.75));
        assert_eq!(record.notion_page_id, None);
        assert_eq!(record.llm_status, LlmStatus::New);
        assert_eq!(record.due_date, NaiveDate::from_ymd_opt(2026, 3, 1));
        assert_eq!(sheet.text(r, "row_id").as_deref(), Some("7"));
    }

    #[test]
    fn nan_cells_read_as_empty() {
        let mut sheet = Sheet::with_columns();
        let r = sheet.push_row();
        sheet.set(r, "conversation_id", Cell::Text("NaN".into()));
        sheet.set(r, "message_id", Cell::Text("<m2>".into()));
        sheet.set(r, "importance_score", Cell::Number(f64::NAN));

        let record = sheet.record(r);
        assert_eq!(record.conversation_id, None);
        assert_eq!(record.importance_score, None);
        assert_eq!(record.thread_key().unwrap().as_str(), "<m2>");
    }

    #[test]
    fn outcome_write_back_keeps_unknown_columns() {
        let mut sheet = Sheet {
            headers: vec!["message_id".into(), "kw_hits".into()],
            rows: vec![vec![Cell::Text("m1".into()), Cell::Number(3.0)]],
        };
        sheet.apply_outcome(0, &SyncOutcome::done("page-9"));
        assert_eq!(sheet.text(0, "notion_page_id").as_deref(), Some("page-9"));
        assert_eq!(sheet.status(0).as_deref(), Some("DONE"));
        assert_eq!(sheet.cell(0, "error_msg"), Some(&Cell::Empty));
        assert_eq!(sheet.cell(0, "kw_hits"), Some(&Cell::Number(3.0)));
    }

    #[test]
    fn merge_keeps_local_rows_and_adds_new_source_rows() {
        let local = Sheet::from_records(&[row("m1", "DONE", "local body"), row("m2", "", "two")]);
        let source = Sheet::from_records(&[row("m1", "", "source body"), row("m3", "", "three")]);
        let (merged, stats) = merge_local_copy(source, Some(local));
        assert_eq!(stats, MergeStats { added: 1, kept: 2, pending: 0 });
        let ids: Vec<String> = merged.records().into_iter().filter_map(|r| r.message_id).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(merged.text(0, "body").as_deref(), Some("local body"));
        assert_eq!(merged.pending_count(), 2);
    }

    #[test]
    fn merge_without_local_copy_takes_source_as_is() {
        let source = Sheet::from_records(&[row("m1", "", "a"), row("m2", "", "b")]);
        let (merged, stats) = merge_local_copy(source.clone(), None);
        assert_eq!(merged, source);
        assert_eq!(stats.added, 2);
        assert_eq!(stats.kept, 0);
    }

    #[test]
    fn workbook_round_trip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source_path = dir.path().join("source.xlsx");
        let local_path = dir.path().join("Jobs.xlsx");

        let mut record = row("m1", "NEW", "Hi\n\n\n\nthere  ");
        record.importance_score = Some(0.5);
        Sheet::from_records(&[record]).write(&source_path).expect("write source");

        let stats = copy_and_merge_to_local(&source_path, &local_path, false).expect("merge");
        assert_eq!(stats, MergeStats { added: 1, kept: 0, pending: 1 });

        let local = Sheet::read(&local_path).expect("read local");
        let records = local.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body.as_deref(), Some("Hi\n\nthere"));
        assert_eq!(records[0].importance_score, Some(0.5));

        let missing = dir.path().join("missing.xlsx");
        let err = copy_and_merge_to_local(&missing, &local_path, false).unwrap_err();
        assert!(err.to_string().contains("source file not found"));
    }
}
