//! Push, pull, full, loop and excel pipelines plus the cron scheduler.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobmail_adapters::{
    copy_and_merge_to_local, ActionExecutor, Classifier, FetchPlan, MergeStats, RowSource, Sheet,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    classify_records, classify_sheet, sync_records, sync_sheet, BatchSummary, ClassifySummary,
    SyncEngine, TriageConfig, TriggerPoller, TriggerSummary,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushSummary {
    pub fetched: usize,
    pub classify: ClassifySummary,
    pub sync: BatchSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub push: PushSummary,
    pub pull: TriggerSummary,
}

/// Fetch, classify and sync new mail.
pub async fn run_push(
    source: &dyn RowSource,
    classifier: &dyn Classifier,
    engine: &SyncEngine,
) -> Result<PushSummary> {
    let run_id = Uuid::new_v4();
    async move {
        let records = source
            .fetch_records()
            .await
            .with_context(|| format!("fetching records from {}", source.source_id()))?;
        let fetched = records.len();
        if records.is_empty() {
            info!("no new emails");
            return Ok(PushSummary::default());
        }
        engine
            .store()
            .ensure_schema()
            .await
            .context("ensuring database schema")?;
        let (records, classify) = classify_records(classifier, records).await;
        let (_, sync) = sync_records(engine, &records).await;
        info!(fetched, synced = sync.synced, failed = sync.failed, "push done");
        Ok::<_, anyhow::Error>(PushSummary { fetched, classify, sync })
    }
    .instrument(info_span!("push", %run_id))
    .await
}

pub async fn run_pull(poller: &TriggerPoller) -> Result<TriggerSummary> {
    poller
        .run_trigger_cycle()
        .await
        .context("polling action requests")
}

/// Everything one `full` cycle needs.
#[derive(Clone)]
pub struct FullCycle {
    pub source: Arc<dyn RowSource>,
    pub classifier: Arc<dyn Classifier>,
    pub engine: SyncEngine,
    pub poller: TriggerPoller,
}

impl FullCycle {
    pub fn new(
        source: Arc<dyn RowSource>,
        classifier: Arc<dyn Classifier>,
        engine: SyncEngine,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        let poller = TriggerPoller::new(engine.clone(), executor);
        Self {
            source,
            classifier,
            engine,
            poller,
        }
    }

    pub fn from_config(config: &TriageConfig, plan: FetchPlan) -> Result<Self> {
        let store = config.notion_store().context("building Notion client")?;
        let classifier = config.classifier().context("building classifier")?;
        Ok(Self::new(
            Arc::new(config.imap_source(plan)),
            Arc::new(classifier),
            SyncEngine::new(Arc::new(store)),
            Arc::new(config.executor()),
        ))
    }

    /// Push then pull. A failed push aborts the cycle.
    pub async fn run(&self) -> Result<CycleSummary> {
        let push = run_push(self.source.as_ref(), self.classifier.as_ref(), &self.engine).await?;
        let pull = run_pull(&self.poller).await?;
        Ok(CycleSummary { push, pull })
    }
}

/// Runs full cycles every `interval` until `shutdown` resolves. A running
/// cycle is allowed to finish. Returns the number of cycles started.
pub async fn run_loop<F>(cycle: &FullCycle, interval: Duration, shutdown: F) -> usize
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut cycles = 0;
    loop {
        cycles += 1;
        info!(cycle = cycles, "starting cycle");
        match cycle.run().await {
            Ok(summary) => info!(
                cycle = cycles,
                synced = summary.push.sync.synced,
                actions = summary.pull.processed,
                "cycle done"
            ),
            Err(err) => warn!(cycle = cycles, error = %err, "cycle failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut shutdown => {
                info!(cycles, "loop stopped");
                return cycles;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExcelOptions {
    pub force_refresh: bool,
    pub reprocess: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExcelRun {
    NothingPending(MergeStats),
    Completed {
        merge: MergeStats,
        classify: ClassifySummary,
        sync: BatchSummary,
    },
}

/// Legacy spreadsheet path: merge the source workbook into the local copy,
/// classify pending rows, sync and write the copy back.
pub async fn run_excel(
    classifier: &dyn Classifier,
    engine: &SyncEngine,
    source: &Path,
    local: &Path,
    options: ExcelOptions,
) -> Result<ExcelRun> {
    let run_id = Uuid::new_v4();
    async move {
        let merge = copy_and_merge_to_local(source, local, options.force_refresh)
            .context("preparing local copy")?;
        if merge.pending == 0 && !options.reprocess {
            info!(kept = merge.kept, added = merge.added, "nothing pending");
            return Ok(ExcelRun::NothingPending(merge));
        }

        let mut sheet = Sheet::read(local).with_context(|| format!("reading {}", local.display()))?;
        let classify = classify_sheet(classifier, &mut sheet).await;
        sheet
            .write(local)
            .with_context(|| format!("writing {}", local.display()))?;

        engine
            .store()
            .ensure_schema()
            .await
            .context("ensuring database schema")?;
        let sync = sync_sheet(engine, &mut sheet, options.reprocess).await;
        sheet
            .write(local)
            .with_context(|| format!("writing {}", local.display()))?;
        Ok::<_, anyhow::Error>(ExcelRun::Completed { merge, classify, sync })
    }
    .instrument(info_span!("excel", %run_id, local = %local.display()))
    .await
}

pub async fn build_scheduler(cycle: Arc<FullCycle>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let cycle = Arc::clone(&cycle);
        Box::pin(async move {
            match cycle.run().await {
                Ok(summary) => info!(
                    synced = summary.push.sync.synced,
                    actions = summary.pull.processed,
                    "scheduled cycle done"
                ),
                Err(err) => warn!(error = %err, "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
