use anyhow::{Context, Result};
use clap::Parser;
use rig_core::invoker::join_path;
use rig_core::{Config, HttpInvoker, RunController, SampleStatus, TargetInvoker};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "preflight")]
#[command(about = "Preflight checks for a load scenario (config, target URL, single request)")]
struct Args {
    /// Path to scenario file
    #[arg(long, default_value = "config/orders.toml")]
    config: PathBuf,

    /// Additional GET paths that must answer 200, e.g. /health (repeatable)
    #[arg(long = "require")]
    required_paths: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    info!("Validating scenario...");
    let run_config = cfg.run_config().context("Invalid scenario")?;
    let controller = RunController::new(run_config).context("Invalid scenario")?;
    let plan = controller.plan();

    info!("Validating target base URL...");
    let base = validate_base_url(&cfg.target.base_url)
        .with_context(|| format!("Invalid target.base_url: {}", cfg.target.base_url))?;

    let template = cfg.request_template().context("Invalid request target")?;
    let invoker = HttpInvoker::new(template, cfg.target.pool_max_idle_per_host)
        .context("Failed to create HTTP invoker")?;

    println!();
    println!("=== Preflight: {} ===", controller.config().scenario);
    println!(
        "Stages: {} over {}ms, peak {} users",
        plan.stages().len(),
        plan.total_duration().as_millis(),
        plan.max_concurrency()
    );
    println!("Thresholds: {}", controller.config().rules.len());
    println!("Target: {} {}", cfg.target.method, invoker.url());
    println!("Timeout: {}ms", cfg.target.timeout_ms);
    println!();

    let mut failures = 0u64;

    // One request exactly as the runner would send it.
    let sample = invoker.invoke(cfg.request_timeout()).await;
    match sample.http_status {
        Some(status) => println!(
            "{} {:<10} -> {} ({:.0}ms, {} bytes)",
            cfg.target.method, cfg.target.path, status, sample.latency_ms, sample.byte_size
        ),
        None => println!(
            "{} {:<10} -> {:?} ({:.0}ms)",
            cfg.target.method, cfg.target.path, sample.status, sample.latency_ms
        ),
    }
    match sample.status {
        SampleStatus::Success => {}
        SampleStatus::HttpError => {
            warn!("Target answered with an HTTP error; the run will count these as failures");
        }
        SampleStatus::TransportError | SampleStatus::Timeout => {
            warn!("Request did not complete: {:?}", sample.status);
            failures = failures.saturating_add(1);
        }
    }
    if sample.checks_failed > 0 {
        warn!("{} response check(s) failed", sample.checks_failed);
    }

    if !args.required_paths.is_empty() {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout().max(Duration::from_millis(1)))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        for path in &args.required_paths {
            if !check_required(&client, &base, path).await? {
                failures = failures.saturating_add(1);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("Preflight failed: {failures} required check(s) failed");
    }

    println!();
    println!("Preflight OK.");
    Ok(())
}

fn validate_base_url(raw: &str) -> Result<url::Url> {
    let url = url::Url::parse(raw).with_context(|| format!("Invalid URL: {raw}"))?;

    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("Base URL must be http:// or https:// (got {raw})");
    }
    if !url.username().is_empty() || url.password().is_some() {
        anyhow::bail!("Base URL must not include credentials (got {raw})");
    }
    url.host_str().context("Base URL must include a hostname")?;

    // The request path comes from target.path.
    if url.query().is_some() || url.fragment().is_some() {
        anyhow::bail!("Base URL must not include query/fragment (got {raw})");
    }

    Ok(url)
}

async fn check_required(client: &reqwest::Client, base: &url::Url, path: &str) -> Result<bool> {
    let url = join_path(base, path)?;
    let start = Instant::now();
    let resp = client.get(url).send().await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match resp {
        Ok(r) => {
            let status = r.status().as_u16();
            println!("GET {:<10} -> {} ({}ms)", path, status, latency_ms);
            if status != 200 {
                warn!("Required endpoint returned non-200: {} {}", path, status);
                Ok(false)
            } else {
                Ok(true)
            }
        }
        Err(e) => {
            println!("GET {:<10} -> ERROR ({}ms)", path, latency_ms);
            warn!("Required endpoint request failed: {} error={}", path, e);
            Ok(false)
        }
    }
}
