//! Execution-context lifecycle tool.
//!
//! Connects execution contexts to a data source, probes them and runs
//! coordinated invalidations, printing structured JSON reports.
//!
//! # Security Guarantees
//! - No credentials stored or logged
//! - Reports carry context names and error kinds, never connection URLs

mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cli::{Cli, Command, InvalidateArgs, KeepAliveArgs};
use dbctx_core::driver::DriverRegistry;
use dbctx_core::logging::init_logging;
use dbctx_core::{
    CoordinatorConfig, DataSource, ExecutionContext, InvalidationCoordinator, InvalidationReport,
    KeepAliveConfig, KeepAliveMonitor, ProgressMonitor,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet)?;

    match &cli.command {
        Command::Test => test_connection(&cli).await,
        Command::Invalidate(args) => run_invalidation(&cli, args).await,
        Command::KeepAlive(args) => run_keepalive(&cli, args).await,
        Command::Drivers => {
            list_drivers();
            Ok(())
        }
    }
}

/// Monitor cancelled on Ctrl-C.
fn interrupt_monitor() -> ProgressMonitor {
    let monitor = ProgressMonitor::new();
    let token = monitor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            token.cancel();
        }
    });
    monitor
}

async fn open_source(cli: &Cli) -> Result<Arc<DataSource>> {
    let config = cli.source.resolve().await?;
    info!("Using data source '{}' ({})", config.name, config.connection.target());
    let source = DataSource::from_registry(config, &DriverRegistry::with_builtin_drivers())?;
    Ok(Arc::new(source))
}

async fn open_contexts(
    source: &DataSource,
    count: u16,
    monitor: &ProgressMonitor,
) -> Result<Vec<Arc<ExecutionContext>>> {
    let mut contexts = Vec::with_capacity(usize::from(count));
    for index in 1..=count {
        let context = source
            .open_context(format!("Context {}", index), monitor)
            .await
            .with_context(|| format!("Failed to open context {} of {}", index, count))?;
        contexts.push(context);
    }
    Ok(contexts)
}

/// Connects one context and probes it
async fn test_connection(cli: &Cli) -> Result<()> {
    info!("Testing connection...");
    let monitor = interrupt_monitor();
    let source = open_source(cli).await?;

    let result = async {
        let context = source.open_context("Connection test", &monitor).await?;
        context.check_context_alive(&monitor).await?;
        Ok::<_, dbctx_core::ContextError>(context)
    }
    .await;
    source.disconnect().await;

    match result {
        Ok(context) => {
            info!("✓ Connection test successful");
            println!(
                "Connection to '{}' successful ({} dialect)",
                source.name(),
                context.dialect()
            );
            Ok(())
        }
        Err(e) => {
            error!("Connection test failed: {}", e);
            Err(e.into())
        }
    }
}

/// Opens contexts and invalidates them together
async fn run_invalidation(cli: &Cli, args: &InvalidateArgs) -> Result<()> {
    let monitor = interrupt_monitor();
    let source = open_source(cli).await?;
    open_contexts(&source, args.contexts, &monitor).await?;

    let coordinator = InvalidationCoordinator::new(
        CoordinatorConfig::default()
            .with_mode(args.mode.into())
            .with_max_concurrency(args.concurrency),
    );
    let report = source.invalidate(&coordinator, &monitor).await;
    source.disconnect().await;

    write_report(&report, args.output.as_deref()).await?;

    if let Some(handler) = &report.disable_handler_suggestion {
        warn!(
            "Network handler '{}' broke the invalidation; consider disabling it",
            handler
        );
    }
    if !report.is_success() {
        bail!(
            "{} of {} context(s) could not be reconnected",
            report.counters.failed,
            report.counters.total
        );
    }
    info!(
        "✓ Invalidation complete: {} reconnected, {} already valid, {} alive",
        report.counters.reconnected, report.counters.already_valid, report.counters.alive
    );
    Ok(())
}

async fn write_report(report: &InvalidationReport, output: Option<&std::path::Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    match output {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Keeps contexts alive until Ctrl-C
async fn run_keepalive(cli: &Cli, args: &KeepAliveArgs) -> Result<()> {
    let monitor = interrupt_monitor();
    let source = open_source(cli).await?;
    open_contexts(&source, args.contexts, &monitor).await?;

    let config = KeepAliveConfig::new(Duration::from_secs(args.interval))
        .with_auto_reconnect(!args.no_reconnect);
    config.validate()?;

    info!(
        "Keeping {} context(s) of '{}' alive every {}s (Ctrl-C to stop)",
        args.contexts,
        source.name(),
        args.interval
    );
    let handle = KeepAliveMonitor::new(Arc::clone(&source), config).spawn(monitor.clone());

    monitor.cancelled().await;
    if let Err(e) = handle.await {
        warn!("Keep-alive task ended abnormally: {}", e);
    }
    source.disconnect().await;
    Ok(())
}

/// Lists known drivers and their connection string formats
fn list_drivers() {
    let registry = DriverRegistry::with_builtin_drivers();

    println!("Drivers:");
    println!();
    for (scheme, entry) in registry.entries() {
        let descriptor = entry.descriptor();
        let status = match (&descriptor.feature, descriptor.compiled_in) {
            (_, true) => "available".to_string(),
            (Some(feature), false) => format!("not compiled in (--features {})", feature),
            (None, false) => "not compiled in".to_string(),
        };
        println!("  {:<12} {:<12} {}", format!("{}://", scheme), descriptor.name, status);
    }

    println!();
    println!("SQLite also accepts plain paths ending in .db, .sqlite or .sqlite3.");
}
