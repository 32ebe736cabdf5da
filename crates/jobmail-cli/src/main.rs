use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jobmail_adapters::FetchPlan;
use jobmail_sync::{
    build_scheduler, run_excel, run_loop, run_pull, run_push, ExcelOptions, ExcelRun, FullCycle,
    SyncEngine, TriageConfig, TriggerPoller,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobmail")]
#[command(about = "Job-application email triage synced to Notion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Args)]
struct FetchArgs {
    /// Look back this many days.
    #[arg(long, default_value_t = 7)]
    days: i64,
    /// Keep at most this many of the newest messages.
    #[arg(long, default_value_t = 50)]
    limit: usize,
    /// Only unread messages, regardless of age.
    #[arg(long, conflicts_with = "from")]
    unseen: bool,
    /// Only messages from these senders; repeatable.
    #[arg(long = "from", value_name = "ADDRESS")]
    from: Vec<String>,
}

impl Default for FetchArgs {
    fn default() -> Self {
        Self {
            days: 7,
            limit: 50,
            unseen: false,
            from: Vec::new(),
        }
    }
}

impl FetchArgs {
    fn plan(self) -> FetchPlan {
        if !self.from.is_empty() {
            FetchPlan::FromContacts {
                addresses: self.from,
                limit: self.limit,
            }
        } else if self.unseen {
            FetchPlan::Unseen { limit: self.limit }
        } else {
            FetchPlan::Recent {
                days: self.days,
                limit: self.limit,
            }
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch recent mail, classify it and sync it.
    Push {
        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Run confirmed actions from the database.
    Pull,
    /// Push then pull.
    Full {
        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Repeat full cycles until Ctrl-C.
    Loop {
        /// Seconds between cycles.
        #[arg(long, default_value_t = 120)]
        interval: u64,
        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Legacy spreadsheet path.
    Excel {
        /// Source workbook; defaults to JOBS_SOURCE_XLSX.
        #[arg(long)]
        source: Option<PathBuf>,
        /// Local working copy; defaults to JOBS_LOCAL_XLSX.
        #[arg(long)]
        local: Option<PathBuf>,
        /// Rebuild the local copy from the source.
        #[arg(long)]
        force_refresh: bool,
        /// Re-send rows that already have a page.
        #[arg(long)]
        reprocess: bool,
    },
    /// Run full cycles on TRIAGE_SYNC_CRON.
    Schedule {
        #[command(flatten)]
        fetch: FetchArgs,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

fn engine(config: &TriageConfig) -> Result<SyncEngine> {
    let store = config.notion_store().context("building Notion client")?;
    Ok(SyncEngine::new(Arc::new(store)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = TriageConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Full {
        fetch: FetchArgs::default(),
    });
    match command {
        Commands::Push { fetch } => {
            let source = config.imap_source(fetch.plan());
            let classifier = config.classifier().context("building classifier")?;
            let summary = run_push(&source, &classifier, &engine(&config)?).await?;
            println!(
                "push complete: fetched={} classified={} classify_errors={} \
                 synced={} sync_errors={}",
                summary.fetched,
                summary.classify.classified,
                summary.classify.failed,
                summary.sync.synced,
                summary.sync.failed
            );
        }
        Commands::Pull => {
            let poller = TriggerPoller::new(engine(&config)?, Arc::new(config.executor()));
            let summary = run_pull(&poller).await?;
            println!(
                "pull complete: processed={} done={} errors={}",
                summary.processed, summary.done, summary.errors
            );
        }
        Commands::Full { fetch } => {
            let cycle = FullCycle::from_config(&config, fetch.plan())?;
            let summary = cycle.run().await?;
            println!(
                "full cycle complete: fetched={} synced={} actions={} action_errors={}",
                summary.push.fetched,
                summary.push.sync.synced,
                summary.pull.processed,
                summary.pull.errors
            );
        }
        Commands::Loop { interval, fetch } => {
            let cycle = FullCycle::from_config(&config, fetch.plan())?;
            info!(interval, "starting loop; Ctrl-C to stop");
            let cycles = run_loop(&cycle, Duration::from_secs(interval), ctrl_c()).await;
            println!("loop stopped after {cycles} cycles");
        }
        Commands::Excel {
            source,
            local,
            force_refresh,
            reprocess,
        } => {
            let source = source
                .or_else(|| config.jobs_source_xlsx.clone())
                .context("--source or JOBS_SOURCE_XLSX is required")?;
            let local = local.unwrap_or_else(|| config.jobs_local_xlsx.clone());
            let classifier = config.classifier().context("building classifier")?;
            let options = ExcelOptions {
                force_refresh,
                reprocess,
            };
            match run_excel(&classifier, &engine(&config)?, &source, &local, options).await? {
                ExcelRun::NothingPending(merge) => println!(
                    "nothing pending: kept={} added={} local={}",
                    merge.kept,
                    merge.added,
                    local.display()
                ),
                ExcelRun::Completed { merge, classify, sync } => println!(
                    "excel complete: added={} classified={} classify_errors={} \
                     synced={} sync_errors={} skipped={}",
                    merge.added,
                    classify.classified,
                    classify.failed,
                    sync.synced,
                    sync.failed,
                    sync.skipped
                ),
            }
        }
        Commands::Schedule { fetch } => {
            let cycle = Arc::new(FullCycle::from_config(&config, fetch.plan())?);
            let mut sched = build_scheduler(cycle, &config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; Ctrl-C to stop");
            ctrl_c().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
