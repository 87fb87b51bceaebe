use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use task_scheduler::catalog::{self, TaskCatalog};
use task_scheduler::cli::{self, Console};
use task_scheduler::config::SchedulerConfig;
use task_scheduler::history::{self, RunHistory};
use task_scheduler::processor::{DryRunExecutor, ProcessorRegistry, SqlTaskProcessor};
use task_scheduler::run::{InMemoryStateManager, SessionContext, UserIdentity};
use task_scheduler::scheduler::Dispatcher;
use task_scheduler::store::LibSqlStatusLog;
use task_scheduler::task::JobKind;
use task_scheduler::trace;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SchedulerConfig::from_env().context("invalid configuration")?;

    // Initialize tracing; the guard flushes the file writer on exit.
    let env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "task-scheduler.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("Task scheduler v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Status log: {}", config.db_path.display());
    eprintln!("   Workers: {}", config.task_runs_concurrency);
    eprintln!("   Databases: {}", config.databases.join(", "));
    eprintln!("   Type 'help' for commands, 'quit' to exit.\n");

    let tracer = trace::init_tracer(&config).cloned();

    // ── Status log and recovery ──────────────────────────────────────────
    let log = Arc::new(
        LibSqlStatusLog::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open status log at {}", config.db_path.display()))?,
    );
    let history = Arc::new(RunHistory::new(log));
    let report = history.recover().await.context("status log recovery failed")?;
    if report.recovered > 0 {
        eprintln!(
            "   Recovered {} runs ({} interrupted, {} quarantined)",
            report.recovered,
            report.interrupted.len(),
            report.quarantined.len()
        );
    }

    // ── Job logic ────────────────────────────────────────────────────────
    let registry = Arc::new(ProcessorRegistry::new());
    let executor = Arc::new(DryRunExecutor);
    for kind in [JobKind::Sql, JobKind::Statistics, JobKind::MvRefresh] {
        registry.register_sync(
            kind,
            Arc::new(SqlTaskProcessor::new(kind.as_str(), executor.clone())),
        );
    }

    // ── Dispatcher ───────────────────────────────────────────────────────
    let ambient = SessionContext::new(
        "default_cluster",
        UserIdentity::new("root", "%"),
        Arc::new(InMemoryStateManager::new(config.databases.clone())),
    )
    .with_remote_addr("127.0.0.1");
    let mut dispatcher = Dispatcher::new(config.clone(), ambient, history.clone(), registry);
    if let Some(tracer) = tracer {
        dispatcher = dispatcher.with_tracer(tracer);
    }
    let dispatcher = Arc::new(dispatcher);
    dispatcher.start().await;

    let _sweep = history::spawn_retention_sweep(history.clone(), config.retention_sweep_interval);
    let catalog = Arc::new(TaskCatalog::new());
    let _ticker =
        catalog::spawn_cron_ticker(catalog.clone(), dispatcher.clone(), Duration::from_secs(1));

    let console = Console::new(catalog, dispatcher.clone());
    cli::run_repl(&console).await.context("console failed")?;

    dispatcher.shutdown().await;
    Ok(())
}
