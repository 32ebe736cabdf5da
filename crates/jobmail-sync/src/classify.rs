//! Classification pass over rows that have not been classified yet.

use chrono::Utc;
use jobmail_adapters::{Classifier, Sheet};
use jobmail_core::{LlmStatus, Record, TriageError};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifySummary {
    pub classified: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Classifies one record in place; failures mark it `ERROR`.
async fn classify_one(
    classifier: &dyn Classifier,
    record: &mut Record,
    summary: &mut ClassifySummary,
) {
    match classifier.classify(record).await {
        Ok(classification) => {
            record.apply_classification(classification, Utc::now());
            summary.classified += 1;
        }
        Err(err) => {
            let err = TriageError::ClassifierFailure(err.to_string());
            warn!(row = record.label(), error = %err, "classification failed");
            record.mark_classification_failed(err.to_string(), Utc::now());
            summary.failed += 1;
        }
    }
}

pub async fn classify_records(
    classifier: &dyn Classifier,
    mut records: Vec<Record>,
) -> (Vec<Record>, ClassifySummary) {
    let run_id = Uuid::new_v4();
    let rows = records.len();
    async move {
        let mut summary = ClassifySummary::default();
        for record in &mut records {
            if record.llm_status != LlmStatus::New {
                summary.skipped += 1;
                continue;
            }
            classify_one(classifier, record, &mut summary).await;
        }
        info!(classified = summary.classified, failed = summary.failed, "classification pass done");
        (records, summary)
    }
    .instrument(info_span!("classify", %run_id, rows))
    .await
}

/// Classifies pending sheet rows and stores the results back into the sheet.
pub async fn classify_sheet(classifier: &dyn Classifier, sheet: &mut Sheet) -> ClassifySummary {
    let run_id = Uuid::new_v4();
    let rows = sheet.len();
    async move {
        let mut summary = ClassifySummary::default();
        for row in 0..sheet.len() {
            if !matches!(sheet.status(row).as_deref(), None | Some("NEW")) {
                summary.skipped += 1;
                continue;
            }
            let mut record = sheet.record(row);
            classify_one(classifier, &mut record, &mut summary).await;
            sheet.store_record(row, &record);
        }
        info!(
            classified = summary.classified,
            failed = summary.failed,
            skipped = summary.skipped,
            "sheet classification done"
        );
        summary
    }
    .instrument(info_span!("classify_sheet", %run_id, rows))
    .await
}
