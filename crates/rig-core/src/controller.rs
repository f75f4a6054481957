use crate::error::{ConfigError, RunError};
use crate::invoker::TargetInvoker;
use crate::scheduler::{SchedulerOptions, SchedulerPhase, SchedulerStatus, VirtualUserScheduler};
use crate::stage::{Stage, StagePlan};
use crate::stats::{MetricAggregator, StatsSummary};
use crate::threshold::{self, RunVerdict, ThresholdRule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lifecycle of a run.
///
/// `Pending -> Running -> Draining -> Completed` when every stage elapses,
/// `Pending -> Running -> Draining -> Aborted` on external cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Draining,
    Completed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub scenario: String,
    pub tags: BTreeMap<String, String>,
    pub stages: Vec<Stage>,
    pub rules: Vec<ThresholdRule>,
    pub request_timeout: Duration,
    pub tick_interval: Duration,
    pub progress_interval: Duration,
    /// Abort the run once this much wall time has passed.
    pub max_duration: Option<Duration>,
    pub sample_buffer: usize,
}

impl RunConfig {
    pub fn new(stages: Vec<Stage>, rules: Vec<ThresholdRule>) -> Self {
        Self {
            scenario: "scenario".to_string(),
            tags: BTreeMap::new(),
            stages,
            rules,
            request_timeout: crate::invoker::DEFAULT_REQUEST_TIMEOUT,
            tick_interval: crate::scheduler::DEFAULT_TICK_INTERVAL,
            progress_interval: Duration::from_secs(5),
            max_duration: None,
            sample_buffer: 10_000,
        }
    }
}

/// Final, structured output of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub scenario: String,
    pub tags: BTreeMap<String, String>,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub peak_concurrency: u64,
    pub users_spawned: u64,
    pub summary: StatsSummary,
    pub verdict: RunVerdict,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verdict.passed
    }
}

pub struct RunController {
    config: RunConfig,
    plan: StagePlan,
    abort: CancellationToken,
    state_tx: watch::Sender<RunState>,
}

impl RunController {
    /// Validate the whole declaration up front; nothing is started on error.
    pub fn new(config: RunConfig) -> Result<Self, ConfigError> {
        let plan = StagePlan::new(config.stages.clone())?;
        for rule in &config.rules {
            rule.validate()?;
        }
        if config.tick_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("tick interval"));
        }
        if config.progress_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("progress interval"));
        }
        if config.request_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("request timeout"));
        }
        if config.sample_buffer == 0 {
            return Err(ConfigError::ZeroInterval("sample buffer"));
        }

        let (state_tx, _) = watch::channel(RunState::Pending);
        Ok(Self {
            config,
            plan,
            abort: CancellationToken::new(),
            state_tx,
        })
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Cancelling the returned token aborts the run: remaining stages are
    /// skipped, users drain, and a partial verdict is still produced.
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: RunState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!("Run state: {:?} -> {:?}", previous, next);
        }
    }

    pub async fn run(self, invoker: Arc<dyn TargetInvoker>) -> Result<RunReport, RunError> {
        let started_at = Utc::now();
        let started = Instant::now();

        let aggregator = MetricAggregator::new();
        let (sample_tx, sample_rx) = mpsc::channel(self.config.sample_buffer);
        let collector = tokio::spawn(aggregator.clone().collect(sample_rx));

        let handle = VirtualUserScheduler::start(
            self.config.stages.clone(),
            invoker,
            sample_tx,
            SchedulerOptions {
                tick_interval: self.config.tick_interval,
                request_timeout: self.config.request_timeout,
                abort: self.abort.clone(),
            },
        )?;
        self.set_state(RunState::Running);

        let mut status = handle.status();
        let mut last_status = *status.borrow();

        let mut progress = tokio::time::interval(self.config.progress_interval);
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
        progress.tick().await;

        let deadline = self.config.max_duration.map(|d| started + d);
        let cap = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(cap);
        let mut capped = false;

        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    last_status = *status.borrow_and_update();
                    if last_status.phase != SchedulerPhase::Ramping {
                        self.set_state(RunState::Draining);
                    }
                    if last_status.phase == SchedulerPhase::Finished {
                        break;
                    }
                }
                _ = progress.tick() => {
                    log_progress(&aggregator, &last_status, started.elapsed());
                }
                _ = &mut cap, if !capped => {
                    capped = true;
                    warn!(
                        "Run reached max duration of {}ms, aborting",
                        started.elapsed().as_millis()
                    );
                    self.abort.cancel();
                }
            }
        }

        self.set_state(RunState::Draining);
        let scheduler = handle.wait().await?;
        let folded = collector.await?;

        let stats = aggregator.snapshot();
        let verdict = threshold::evaluate(&stats, &self.config.rules);
        let state = if scheduler.aborted {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        self.set_state(state);

        info!(
            "Run {} finished: {} samples, passed={}",
            self.config.scenario, folded, verdict.passed
        );
        for rule in &verdict.failed_rules {
            warn!("Threshold failed: {}", rule);
        }

        Ok(RunReport {
            scenario: self.config.scenario.clone(),
            tags: self.config.tags.clone(),
            state,
            started_at,
            finished_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            peak_concurrency: scheduler.peak_active,
            users_spawned: scheduler.users_spawned,
            summary: stats.summary(),
            verdict,
        })
    }
}

fn log_progress(aggregator: &MetricAggregator, status: &SchedulerStatus, elapsed: Duration) {
    let stats = aggregator.snapshot();
    let elapsed_s = elapsed.as_secs_f64();
    let rps = if elapsed_s > 0.0 {
        stats.total_requests as f64 / elapsed_s
    } else {
        0.0
    };

    info!(
        "Progress: elapsed={:.0}s vus={}/{} requests={} errors={} rps={:.1} p50={:.1}ms p95={:.1}ms p99={:.1}ms",
        elapsed_s,
        status.active,
        status.target,
        stats.total_requests,
        stats.total_errors,
        rps,
        stats.percentile(50.0),
        stats.percentile(95.0),
        stats.percentile(99.0)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::{MockBehavior, MockInvoker};
    use crate::threshold::{Comparator, ThresholdMetric};

    #[tokio::test(start_paused = true)]
    async fn test_completed_run_walks_states() {
        let controller = RunController::new(RunConfig::new(
            vec![Stage::new(2_000, 2, 2)],
            vec![ThresholdRule::new(
                ThresholdMetric::ErrorRate,
                Comparator::Lte,
                0.0,
            )],
        ))
        .unwrap();

        let mut state = controller.state();
        assert_eq!(*state.borrow_and_update(), RunState::Pending);

        let observer = tokio::spawn(async move {
            let mut seen = vec![*state.borrow()];
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                if seen.last() != Some(&current) {
                    seen.push(current);
                }
                if current.is_terminal() {
                    break;
                }
            }
            seen
        });

        let report = controller
            .run(Arc::new(MockInvoker::new(Duration::from_millis(100))))
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Completed);
        assert!(report.passed());
        assert_eq!(report.peak_concurrency, 2);
        assert!(report.summary.total_requests >= 38);

        let seen = observer.await.unwrap();
        assert_eq!(seen.first(), Some(&RunState::Pending));
        assert!(seen.contains(&RunState::Draining));
        assert_eq!(seen.last(), Some(&RunState::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_abort_yields_partial_verdict() {
        let controller = RunController::new(RunConfig::new(
            vec![Stage::new(600_000, 3, 3)],
            vec![ThresholdRule::new(
                ThresholdMetric::TotalRequests,
                Comparator::Gt,
                0.0,
            )],
        ))
        .unwrap();
        let abort = controller.abort_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            abort.cancel();
        });

        let report = controller
            .run(Arc::new(MockInvoker::new(Duration::from_millis(50))))
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Aborted);
        assert!(report.duration_ms < 4_000);
        assert!(report.passed());
        assert_eq!(report.summary.total_requests, report.verdict.stats.total_requests);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_aborts() {
        let mut config = RunConfig::new(vec![Stage::new(60_000, 1, 1)], Vec::new());
        config.max_duration = Some(Duration::from_secs(2));
        let controller = RunController::new(config).unwrap();

        let report = controller
            .run(Arc::new(MockInvoker::new(Duration::from_millis(10))))
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert!(report.duration_ms < 3_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_comes_from_run_config() {
        let mut config = RunConfig::new(vec![Stage::new(10_000, 5, 5)], Vec::new());
        config.request_timeout = Duration::from_millis(500);
        let controller = RunController::new(config).unwrap();

        let report = controller
            .run(Arc::new(
                MockInvoker::new(Duration::from_millis(10)).with_behavior(MockBehavior::Hang),
            ))
            .await
            .unwrap();

        let summary = &report.summary;
        assert!(summary.total_requests >= 100, "got {}", summary.total_requests);
        assert_eq!(summary.timeouts, summary.total_requests);
        assert!(summary.latency_max_ms < 510.0);
        assert!(report.duration_ms < 11_000);
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(matches!(
            RunController::new(RunConfig::new(vec![Stage::new(-10, 1, 1)], Vec::new())).err(),
            Some(ConfigError::NegativeDuration { .. })
        ));

        let bad_rule = ThresholdRule::new(ThresholdMetric::Percentile(0.0), Comparator::Lt, 1.0);
        assert!(matches!(
            RunController::new(RunConfig::new(vec![Stage::new(10, 1, 1)], vec![bad_rule])).err(),
            Some(ConfigError::MalformedRule { .. })
        ));

        let mut config = RunConfig::new(vec![Stage::new(10, 1, 1)], Vec::new());
        config.request_timeout = Duration::ZERO;
        assert!(RunController::new(config).is_err());
    }
}
