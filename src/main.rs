//! PageAudit - multi-module web page analyzer
//!
//! Submits one page for analysis, runs the fetch and analyzer worker pools
//! in-process until the analysis reaches a terminal status, and writes a
//! report.
//!
//! Exit codes:
//!   0 - Success (no findings above threshold, or no --fail-on set)
//!   1 - Runtime error, or the analysis failed or was cancelled
//!   2 - Findings found at or above the --fail-on threshold

mod aggregator;
mod analyzers;
mod assets;
mod cli;
mod config;
mod error;
mod fetcher;
mod intake;
mod lifecycle;
mod models;
mod queue;
mod report;
mod retry;
mod store;
mod worker;

use aggregator::{CompletionAggregator, ReportSignal};
use analyzers::{AnalyzerRegistry, RuleCatalog};
use anyhow::{Context, Result};
use assets::{AssetStore, FsAssetStore, MemoryAssetStore};
use cli::{Args, OutputFormat};
use config::{Config, CONFIG_FILE};
use fetcher::HttpCapturer;
use indicatif::{ProgressBar, ProgressStyle};
use intake::{ActiveAnalysisQuota, AnalysisRequest, Intake, QuotaPolicy, Unlimited};
use models::{Analysis, AnalysisStatus, Severity};
use queue::MemoryQueue;
use report::AnalysisReport;
use retry::RetryPolicy;
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::SqliteStatusStore;
use tokio::sync::mpsc;
use tokio::time::error::Elapsed;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use worker::{Components, Runtime};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("PageAudit v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run_analysis(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Analysis failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .pageaudit.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content).with_context(|| format!("Failed to write {}", CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE);
    println!("   Edit it to customize the store, worker pools, modules, and more.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run one analysis end to end. Returns the exit code.
async fn run_analysis(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    let modules = config.analyzers.modules()?;

    // Step 1: Wire the components
    let store = Arc::new(
        SqliteStatusStore::connect(
            &config.store.database_url,
            config.store.max_connections,
            Duration::from_millis(config.store.busy_timeout_ms),
        )
        .await
        .with_context(|| format!("Failed to open status store {}", config.store.database_url))?,
    );
    let queue = Arc::new(MemoryQueue::new(config.queue.settings()));
    let capturer = Arc::new(
        HttpCapturer::new(
            Duration::from_secs(config.fetch.timeout_seconds),
            &config.fetch.user_agent,
        )
        .context("Failed to create HTTP client")?,
    );

    let builtin = AnalyzerRegistry::builtin(config.analyzers.performance.clone());
    let mut registry = AnalyzerRegistry::new();
    for module in &modules {
        if let Some(analyzer) = builtin.get(*module) {
            registry.register(analyzer);
        }
    }

    let assets: Arc<dyn AssetStore> = if config.assets.in_memory() {
        Arc::new(MemoryAssetStore::new())
    } else {
        Arc::new(FsAssetStore::new(&config.assets.root))
    };

    let (signal, mut finished_rx) = ReportSignal::channel();
    let aggregator =
        Arc::new(CompletionAggregator::new(store.clone()).with_listener(Arc::new(signal)));

    let components = Components {
        store: store.clone(),
        assets,
        queue: queue.clone(),
        capturer,
        registry,
        catalog: Arc::new(RuleCatalog::builtin()),
        aggregator,
    };

    let quota: Arc<dyn QuotaPolicy> = if config.quota.max_active_per_tenant > 0 {
        Arc::new(ActiveAnalysisQuota::new(
            store.clone(),
            config.quota.max_active_per_tenant,
        ))
    } else {
        Arc::new(Unlimited)
    };
    let intake = Intake::new(store.clone(), queue.clone(), quota, RetryPolicy::default());

    println!("🚀 Starting workers...");
    let settings = config.worker_settings();
    let runtime = Runtime::start(&components, &settings);
    println!(
        "   Modules: {}",
        modules
            .iter()
            .map(|m| m.display_name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("   Workers: {}", runtime.worker_count());

    // Step 2: Submit
    let submission = match intake
        .submit(AnalysisRequest {
            target_url: args.target_url().to_string(),
            tenant_id: config.general.tenant.clone(),
            modules,
        })
        .await
    {
        Ok(submission) => submission,
        Err(e) => {
            runtime.shutdown().await;
            return Err(e.into());
        }
    };
    let analysis_id = submission.analysis.id.clone();
    println!("\n🔬 Analyzing {}", submission.analysis.target_url);
    println!("   Analysis: {}", analysis_id);

    // Step 3: Wait for the terminal status
    let spinner = (!args.quiet).then(|| {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message("Waiting for analysis to finish...");
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    });

    let deadline = config.general.deadline();
    let waited = tokio::select! {
        waited = wait_for(&mut finished_rx, &analysis_id, deadline) => match waited {
            Ok(Some(analysis)) => Ok(analysis),
            Ok(None) => Err("lost its completion signal"),
            Err(_) => {
                warn!(
                    analysis_id = %analysis_id,
                    "No result after {}s, cancelling analysis",
                    deadline.as_secs()
                );
                cancel(&intake, &analysis_id).await;
                Err("did not finish before the deadline and was cancelled")
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!(analysis_id = %analysis_id, "Interrupted, cancelling analysis");
            cancel(&intake, &analysis_id).await;
            Err("was cancelled")
        }
    };

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    runtime.shutdown().await;

    for dead in queue.dead_letters() {
        warn!(
            queue = %dead.queue,
            payload = %dead.payload,
            "Task was dead-lettered: {}",
            dead.reason
        );
    }
    debug!("Unsettled deliveries at shutdown: {}", queue.in_flight());

    let finished = match waited {
        Ok(finished) => finished,
        Err(reason) => {
            eprintln!("\n⛔ Analysis {} {}.", analysis_id, reason);
            return Ok(1);
        }
    };
    debug!(analysis_id = %finished.id, status = %finished.status, "Completion signal received");

    // Step 4: Build and save the report
    println!("\n📝 Generating report...");
    let report = AnalysisReport::load(store.as_ref(), &analysis_id)
        .await
        .context("Failed to load analysis results")?;

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };

    std::fs::write(&args.output, &output)
        .with_context(|| format!("Failed to write report to {}", args.output.display()))?;

    print_summary(&report, start_time.elapsed().as_secs_f64());
    println!("\n✅ Report saved to: {}", args.output.display());

    if report.analysis.status == AnalysisStatus::Failed {
        eprintln!("\n❌ Analysis failed; see the report for details.");
        return Ok(1);
    }

    // Check --fail-on threshold
    if let Some(fail_level) = args.fail_on {
        let threshold = Severity::from(fail_level);
        if report.has_findings_at_or_above(threshold) {
            eprintln!(
                "\n⛔ Findings at or above {} severity. Failing (exit code 2).",
                threshold
            );
            return Ok(2);
        }
    }

    Ok(0)
}

/// Wait until the completion signal for `analysis_id` arrives, at most
/// `deadline`. `Ok(None)` if every sender went away first.
async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<Analysis>,
    analysis_id: &str,
    deadline: Duration,
) -> Result<Option<Analysis>, Elapsed> {
    tokio::time::timeout(deadline, async {
        while let Some(analysis) = rx.recv().await {
            if analysis.id == analysis_id {
                return Some(analysis);
            }
        }
        None
    })
    .await
}

async fn cancel(intake: &Intake, analysis_id: &str) {
    if let Err(e) = intake.cancel(analysis_id).await {
        error!("Failed to cancel analysis: {}", e);
    }
}

fn print_summary(report: &AnalysisReport, duration: f64) {
    let summary = &report.summary;

    println!("\n📊 Analysis Summary:");
    println!("   Status: {}", report.analysis.status);
    if let Some(score) = report.analysis.score {
        println!("   Score: {:.1} / 100", score);
    }
    for module in &report.modules {
        println!(
            "   - {}: {} ({} findings)",
            module.module.display_name(),
            module.status,
            module.findings.len()
        );
    }
    println!("   Total findings: {}", summary.total);
    println!(
        "   - 🔴 Critical: {} | 🟠 Serious: {} | 🟡 Moderate: {} | 🟢 Minor: {}",
        summary.critical, summary.serious, summary.moderate, summary.minor
    );
    println!("   Duration: {:.1}s", duration);
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::CompletionListener;
    use chrono::Utc;

    fn finished(id: &str) -> Analysis {
        Analysis {
            id: id.to_string(),
            tenant_id: "local".to_string(),
            target_url: "https://example.com/".to_string(),
            asset_path: format!("local/{}", id),
            status: AnalysisStatus::Completed,
            score: Some(100.0),
            findings_count: Some(0),
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_wait_skips_other_analyses() {
        let (signal, mut rx) = ReportSignal::channel();
        signal.on_complete(&finished("other")).await.unwrap();
        signal.on_complete(&finished("mine")).await.unwrap();

        let waited = wait_for(&mut rx, "mine", Duration::from_secs(1)).await;
        assert_eq!(waited.unwrap().unwrap().id, "mine");
    }

    #[tokio::test]
    async fn test_wait_gives_up_at_deadline() {
        let (_signal, mut rx) = ReportSignal::channel();

        let waited = wait_for(&mut rx, "stuck", Duration::from_millis(50)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_wait_ends_when_senders_are_gone() {
        let (signal, mut rx) = ReportSignal::channel();
        drop(signal);

        let waited = wait_for(&mut rx, "a1", Duration::from_secs(1)).await;
        assert!(waited.unwrap().is_none());
    }
}
