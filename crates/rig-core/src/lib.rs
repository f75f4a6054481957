pub mod body;
pub mod config;
pub mod controller;
pub mod error;
pub mod invoker;
pub mod sample;
pub mod scheduler;
pub mod stage;
pub mod stats;
pub mod threshold;

pub use body::{BodyConfig, BodyProducer, RequestBody};
pub use config::{parse_duration_ms, Config};
pub use controller::{RunConfig, RunController, RunReport, RunState};
pub use error::{ConfigError, RunError};
pub use invoker::{HttpInvoker, MockBehavior, MockInvoker, RequestTemplate, ResponseCheck, TargetInvoker};
pub use sample::{MetricSample, SampleStatus};
pub use scheduler::{SchedulerHandle, SchedulerOptions, SchedulerStatus, VirtualUserScheduler};
pub use stage::{Stage, StagePlan};
pub use stats::{AggregateStats, LatencyHistogram, MetricAggregator, StatsSummary};
pub use threshold::{evaluate, Comparator, RunVerdict, ThresholdMetric, ThresholdRule};
