//! Virtual-user scheduler.
//!
//! A single tick loop owns the stage clock. On every tick it reads the target
//! concurrency from the [`StagePlan`] and grows or shrinks the pool of virtual
//! users to match. Users are never stopped by identity: shrinking the pool
//! issues stop tokens, and whichever users reach their loop checkpoint first
//! take them and exit. An in-flight request is always allowed to finish or
//! time out on its own.

use crate::error::{ConfigError, RunError};
use crate::invoker::{TargetInvoker, DEFAULT_REQUEST_TIMEOUT};
use crate::sample::MetricSample;
use crate::stage::{Stage, StagePlan};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Ramping,
    Draining,
    Finished,
}

/// Published after every tick and phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub elapsed_ms: u64,
    pub stage_index: Option<usize>,
    pub target: u64,
    pub active: u64,
    pub phase: SchedulerPhase,
}

impl SchedulerStatus {
    fn initial() -> Self {
        Self {
            elapsed_ms: 0,
            stage_index: None,
            target: 0,
            active: 0,
            phase: SchedulerPhase::Ramping,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerReport {
    pub peak_active: u64,
    pub users_spawned: u64,
    pub ticks: u64,
    pub aborted: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick_interval: Duration,
    /// Bound on every single request attempt.
    pub request_timeout: Duration,
    /// Cancelling this token skips the remaining stages and drains to zero.
    pub abort: CancellationToken,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            abort: CancellationToken::new(),
        }
    }
}

/// Pending stop requests, consumed one per exiting virtual user.
#[derive(Debug, Default)]
struct StopTokens(AtomicU64);

impl StopTokens {
    fn issue(&self, count: u64) {
        self.0.fetch_add(count, Ordering::AcqRel);
    }

    /// Withdraw up to `count` unclaimed tokens, returning how many were taken.
    fn reclaim(&self, count: u64) -> u64 {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                Some(pending - pending.min(count))
            })
            .unwrap_or(0);
        previous.min(count)
    }

    fn try_take(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                pending.checked_sub(1)
            })
            .is_ok()
    }
}

/// State shared by every virtual user of one run.
struct UserContext {
    invoker: Arc<dyn TargetInvoker>,
    request_timeout: Duration,
    sink: mpsc::Sender<MetricSample>,
    stops: StopTokens,
    abort: CancellationToken,
    active: AtomicU64,
}

/// Decrements the live-user count however the user task ends.
struct ActiveGuard(Arc<UserContext>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn virtual_user(id: u64, ctx: Arc<UserContext>) {
    let _guard = ActiveGuard(Arc::clone(&ctx));
    let mut iterations = 0u64;

    loop {
        if ctx.abort.is_cancelled() || ctx.stops.try_take() {
            break;
        }

        let sample = ctx.invoker.invoke(ctx.request_timeout).await;
        iterations += 1;

        if ctx.sink.send(sample).await.is_err() {
            warn!("Virtual user {} lost its sample sink, stopping", id);
            break;
        }
    }

    debug!("Virtual user {} exited after {} iterations", id, iterations);
}

pub struct VirtualUserScheduler {
    plan: StagePlan,
    tick_interval: Duration,
    ctx: Arc<UserContext>,
    status_tx: watch::Sender<SchedulerStatus>,
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    status_rx: watch::Receiver<SchedulerStatus>,
    abort: CancellationToken,
    task: JoinHandle<SchedulerReport>,
}

impl SchedulerHandle {
    pub fn status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status_rx.clone()
    }

    /// Skip the remaining stages and drain every virtual user.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Wait until every virtual user has exited.
    pub async fn wait(self) -> Result<SchedulerReport, RunError> {
        Ok(self.task.await?)
    }
}

impl VirtualUserScheduler {
    /// Validate `stages` and start driving `invoker`. Every sample produced is
    /// delivered to `sink`.
    pub fn start(
        stages: Vec<Stage>,
        invoker: Arc<dyn TargetInvoker>,
        sink: mpsc::Sender<MetricSample>,
        options: SchedulerOptions,
    ) -> Result<SchedulerHandle, ConfigError> {
        let plan = StagePlan::new(stages)?;
        if options.tick_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("tick interval"));
        }
        if options.request_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("request timeout"));
        }

        let (status_tx, status_rx) = watch::channel(SchedulerStatus::initial());
        let abort = options.abort.clone();
        let scheduler = VirtualUserScheduler {
            plan,
            tick_interval: options.tick_interval,
            ctx: Arc::new(UserContext {
                invoker,
                request_timeout: options.request_timeout,
                sink,
                stops: StopTokens::default(),
                abort: options.abort,
                active: AtomicU64::new(0),
            }),
            status_tx,
        };

        Ok(SchedulerHandle {
            status_rx,
            abort,
            task: tokio::spawn(scheduler.run()),
        })
    }

    async fn run(self) -> SchedulerReport {
        let started = Instant::now();
        let end = started + self.plan.total_duration();
        let mut users = JoinSet::new();
        let mut assigned = 0u64;
        let mut report = SchedulerReport {
            peak_active: 0,
            users_spawned: 0,
            ticks: 0,
            aborted: false,
            elapsed_ms: 0,
        };
        let mut current_stage = None;

        info!(
            "Scheduler starting: {} stages over {}ms, invoker={}",
            self.plan.stages().len(),
            self.plan.total_duration().as_millis(),
            self.ctx.invoker.name()
        );

        loop {
            let elapsed = started.elapsed();
            let Some(target) = self.plan.target_concurrency(elapsed) else {
                break;
            };
            report.ticks += 1;

            let stage_index = self.plan.stage_index_at(elapsed);
            if stage_index != current_stage {
                if let Some(idx) = stage_index {
                    let stage = &self.plan.stages()[idx];
                    info!(
                        "Entering stage {}: {} -> {} users over {}ms",
                        idx, stage.start_concurrency, stage.end_concurrency, stage.duration_ms
                    );
                }
                current_stage = stage_index;
            }

            self.reap(&mut users, &mut assigned);
            self.adjust(target, &mut assigned, &mut users, &mut report);

            let active = self.ctx.active.load(Ordering::Acquire);
            report.peak_active = report.peak_active.max(active);
            self.status_tx.send_replace(SchedulerStatus {
                elapsed_ms: elapsed.as_millis() as u64,
                stage_index,
                target,
                active,
                phase: SchedulerPhase::Ramping,
            });

            let next_tick = (Instant::now() + self.tick_interval).min(end);
            tokio::select! {
                _ = sleep_until(next_tick) => {}
                _ = self.ctx.abort.cancelled() => {
                    info!("Abort requested, skipping remaining stages");
                    report.aborted = true;
                    break;
                }
            }
        }

        info!("Draining {} virtual users", assigned);
        self.ctx.stops.issue(assigned);
        self.publish_phase(started, 0, SchedulerPhase::Draining);

        while let Some(result) = users.join_next().await {
            if let Err(e) = result {
                error!("Virtual user task failed: {}", e);
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.publish_phase(started, 0, SchedulerPhase::Finished);
        info!(
            "Scheduler finished: peak={} spawned={} elapsed={}ms",
            report.peak_active, report.users_spawned, report.elapsed_ms
        );
        report
    }

    fn adjust(
        &self,
        target: u64,
        assigned: &mut u64,
        users: &mut JoinSet<()>,
        report: &mut SchedulerReport,
    ) {
        if target > *assigned {
            let wanted = target - *assigned;
            let reclaimed = self.ctx.stops.reclaim(wanted);
            for _ in reclaimed..wanted {
                let id = report.users_spawned;
                report.users_spawned += 1;
                self.ctx.active.fetch_add(1, Ordering::AcqRel);
                users.spawn(virtual_user(id, Arc::clone(&self.ctx)));
            }
            debug!(
                "Scaling up {} -> {} (reclaimed {} stop tokens)",
                assigned, target, reclaimed
            );
        } else if target < *assigned {
            self.ctx.stops.issue(*assigned - target);
            debug!("Scaling down {} -> {}", assigned, target);
        }
        *assigned = target;
    }

    /// Collect finished user tasks. A user that panicked never took a stop
    /// token, so it still counted toward `assigned`.
    fn reap(&self, users: &mut JoinSet<()>, assigned: &mut u64) {
        while let Some(result) = users.try_join_next() {
            if let Err(e) = result {
                error!("Virtual user task failed: {}", e);
                *assigned = assigned.saturating_sub(1);
            }
        }
    }

    fn publish_phase(&self, started: Instant, target: u64, phase: SchedulerPhase) {
        self.status_tx.send_replace(SchedulerStatus {
            elapsed_ms: started.elapsed().as_millis() as u64,
            stage_index: None,
            target,
            active: self.ctx.active.load(Ordering::Acquire),
            phase,
        });
    }
}
