//! Batch drivers over in-memory records and spreadsheet rows.

use jobmail_adapters::Sheet;
use jobmail_core::{LlmStatus, Record};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::SyncEngine;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub synced: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchSummary {
    fn count(&mut self, status: LlmStatus) {
        match status {
            LlmStatus::Done => self.synced += 1,
            _ => self.failed += 1,
        }
    }
}

/// Sheet row selection. NEW rows wait for classification; DONE rows that
/// already have a page are only re-sent with `reprocess`.
pub fn should_sync_row(status: Option<&str>, has_page_id: bool, reprocess: bool) -> bool {
    match status {
        Some("NEW") => false,
        Some("DONE") if has_page_id => reprocess,
        _ => true,
    }
}

/// Syncs every record in order and returns updated copies.
pub async fn sync_records(engine: &SyncEngine, records: &[Record]) -> (Vec<Record>, BatchSummary) {
    let run_id = Uuid::new_v4();
    async move {
        let mut summary = BatchSummary::default();
        let mut updated = Vec::with_capacity(records.len());
        for record in records {
            let outcome = engine.sync(record).await;
            summary.count(outcome.status);
            let mut record = record.clone();
            record.apply_outcome(&outcome);
            updated.push(record);
        }
        info!(synced = summary.synced, failed = summary.failed, "records synced");
        (updated, summary)
    }
    .instrument(info_span!("sync_records", %run_id, rows = records.len()))
    .await
}

/// Syncs the selected rows and writes page id, status and error back into
/// the sheet. The caller persists the sheet.
pub async fn sync_sheet(engine: &SyncEngine, sheet: &mut Sheet, reprocess: bool) -> BatchSummary {
    let run_id = Uuid::new_v4();
    let rows = sheet.len();
    async move {
        let mut summary = BatchSummary::default();
        for row in 0..sheet.len() {
            let record = sheet.record(row);
            let status = sheet.status(row);
            if !should_sync_row(status.as_deref(), record.page_id().is_some(), reprocess) {
                summary.skipped += 1;
                continue;
            }
            let outcome = engine.sync(&record).await;
            summary.count(outcome.status);
            sheet.apply_outcome(row, &outcome);
        }
        info!(
            synced = summary.synced,
            failed = summary.failed,
            skipped = summary.skipped,
            "sheet synced"
        );
        summary
    }
    .instrument(info_span!("sync_sheet", %run_id, rows))
    .await
}
