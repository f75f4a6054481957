use anyhow::{Context, Result};
use clap::Parser;
use rig_core::{
    Config, HttpInvoker, MockBehavior, MockInvoker, RunController, RunReport, StagePlan,
    TargetInvoker, ThresholdRule,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "runner")]
#[command(about = "Drives a staged virtual-user load test and evaluates its thresholds")]
struct Args {
    /// Path to scenario file
    #[arg(long, default_value = "config/orders.toml")]
    config: PathBuf,

    /// Invocation mode: mock or http
    #[arg(long, default_value = "http")]
    mode: String,

    /// Write the JSON run report here
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print the stage schedule and exit without sending requests
    #[arg(long)]
    plan_only: bool,

    /// Extra threshold rule, e.g. "http_req_duration p(99)<500" (repeatable)
    #[arg(long = "threshold")]
    thresholds: Vec<String>,

    /// Simulated latency in mock mode
    #[arg(long, default_value = "50")]
    mock_latency_ms: u64,

    /// HTTP status returned in mock mode
    #[arg(long, default_value = "200")]
    mock_status: u16,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut run_config = config.run_config().context("Invalid scenario")?;
    for raw in &args.thresholds {
        let rule: ThresholdRule = raw
            .parse()
            .with_context(|| format!("Invalid --threshold {raw:?}"))?;
        run_config.rules.push(rule);
    }

    let controller = RunController::new(run_config).context("Invalid scenario")?;
    print_stage_schedule(controller.plan());
    if args.plan_only {
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        "Starting scenario '{}' in {} mode",
        controller.config().scenario,
        args.mode
    );
    for rule in &controller.config().rules {
        info!("Threshold: {}", rule);
    }

    let invoker: Arc<dyn TargetInvoker> = match args.mode.as_str() {
        "mock" => Arc::new(
            MockInvoker::new(Duration::from_millis(args.mock_latency_ms))
                .with_behavior(MockBehavior::Respond {
                    status: args.mock_status,
                    body_len: 2,
                })
                .with_checks(config.checks.clone()),
        ),
        "http" => {
            let template = config
                .request_template()
                .context("Invalid request target")?;
            let invoker = HttpInvoker::new(template, config.target.pool_max_idle_per_host)
                .context("Failed to create HTTP invoker")?;
            info!("Target: {} {}", config.target.method, invoker.url());
            Arc::new(invoker)
        }
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };

    info!("Using invoker: {}", invoker.name());

    let abort = controller.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, draining virtual users...");
            abort.cancel();
        }
    });

    let report = controller.run(invoker).await?;

    if let Some(path) = &args.output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let report_json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, report_json)
            .with_context(|| format!("Failed to write report to {:?}", path))?;
        info!("Report written to {:?}", path);
    }

    print_summary(&report);

    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_stage_schedule(plan: &StagePlan) {
    println!("\n=== Stage Schedule ===");
    println!("Total duration: {}ms", plan.total_duration().as_millis());
    println!("Peak virtual users: {}", plan.max_concurrency());
    println!();

    for (idx, stage) in plan.stages().iter().enumerate() {
        println!(
            "Stage {}: {} -> {} users over {}ms",
            idx, stage.start_concurrency, stage.end_concurrency, stage.duration_ms
        );
    }
    println!();
}

fn print_summary(report: &RunReport) {
    let summary = &report.summary;
    let rps = if report.duration_ms > 0 {
        summary.total_requests as f64 * 1000.0 / report.duration_ms as f64
    } else {
        0.0
    };

    println!("\n=== Scenario {} Summary ===", report.scenario);
    for (key, value) in &report.tags {
        println!("{}: {}", key, value);
    }
    println!("State: {:?}", report.state);
    println!("Duration: {}ms", report.duration_ms);
    println!("Peak virtual users: {}", report.peak_concurrency);
    println!("Requests: {}", summary.total_requests);
    println!(
        "Errors: {} ({:.2}%)",
        summary.total_errors,
        summary.error_rate * 100.0
    );
    println!("  HTTP errors: {}", summary.http_errors);
    println!("  Transport errors: {}", summary.transport_errors);
    println!("  Timeouts: {}", summary.timeouts);
    println!("Checks: {} passed, {} failed", summary.checks_passed, summary.checks_failed);
    println!("Received: {} bytes", summary.bytes_received);
    println!("Achieved RPS: {:.1}", rps);
    println!(
        "Latency min/avg/max: {:.1}/{:.1}/{:.1}ms",
        summary.latency_min_ms, summary.latency_mean_ms, summary.latency_max_ms
    );
    println!("Latency p50: {:.1}ms", summary.latency_p50_ms);
    println!("Latency p90: {:.1}ms", summary.latency_p90_ms);
    println!("Latency p95: {:.1}ms", summary.latency_p95_ms);
    println!("Latency p99: {:.1}ms", summary.latency_p99_ms);

    if !report.verdict.outcomes.is_empty() {
        println!("\nThresholds:");
        for outcome in &report.verdict.outcomes {
            println!(
                "  [{}] {} (observed {:.3})",
                if outcome.passed { "PASS" } else { "FAIL" },
                outcome.rule,
                outcome.observed
            );
        }
    }
    println!(
        "\nVerdict: {}",
        if report.passed() { "PASSED" } else { "FAILED" }
    );
    println!();
}
