use crate::body::{BodyConfig, BodyProducer, EmptyBody};
use crate::controller::RunConfig;
use crate::error::ConfigError;
use crate::invoker::{RequestTemplate, ResponseCheck};
use crate::stage::Stage;
use crate::threshold::ThresholdRule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A load scenario as written in a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scenario: ScenarioConfig,
    pub stages: Vec<StageConfig>,
    pub target: TargetConfig,
    #[serde(default)]
    pub body: Option<BodyConfig>,
    #[serde(default)]
    pub checks: Vec<ResponseCheck>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,
    #[serde(default)]
    pub run: RunSettings,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }

    /// Anchor relative file references (the multipart upload) at `dir`, the
    /// directory of the scenario file.
    fn resolve_paths(&mut self, dir: &Path) {
        if let Some(BodyConfig::MultipartFile { path, .. }) = &mut self.body {
            if path.is_relative() {
                *path = dir.join(&*path);
            }
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Resolve the declared stages. A stage without `start_concurrency`
    /// starts where the previous one ended (0 for the first).
    pub fn stages(&self) -> Result<Vec<Stage>, ConfigError> {
        let mut previous_end = 0i64;
        let mut stages = Vec::with_capacity(self.stages.len());
        for (index, declared) in self.stages.iter().enumerate() {
            let stage = Stage::new(
                declared.duration_ms(index)?,
                declared.start_concurrency.unwrap_or(previous_end),
                declared.end_concurrency,
            );
            stage.validate(index)?;
            previous_end = stage.end_concurrency;
            stages.push(stage);
        }
        Ok(stages)
    }

    /// Threshold rules in declaration order.
    pub fn threshold_rules(&self) -> Result<Vec<ThresholdRule>, ConfigError> {
        self.thresholds
            .iter()
            .flat_map(|t| t.rules.iter().map(move |expr| ThresholdRule::parse(&t.metric, expr)))
            .collect()
    }

    pub fn body_producer(&self) -> Result<Arc<dyn BodyProducer>, ConfigError> {
        match &self.body {
            Some(body) => body.build(self.scenario.seed),
            None => Ok(Arc::new(EmptyBody)),
        }
    }

    pub fn request_template(&self) -> Result<RequestTemplate, ConfigError> {
        RequestTemplate::from_parts(
            &self.target.method,
            &self.target.base_url,
            &self.target.path,
            &self.target.headers,
            self.body_producer()?,
            self.checks.clone(),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.target.timeout_ms)
    }

    pub fn run_config(&self) -> Result<RunConfig, ConfigError> {
        Ok(RunConfig {
            scenario: self.scenario.name.clone(),
            tags: self.scenario.tags.clone(),
            stages: self.stages()?,
            rules: self.threshold_rules()?,
            request_timeout: self.request_timeout(),
            tick_interval: Duration::from_millis(self.run.tick_interval_ms),
            progress_interval: Duration::from_millis(self.run.progress_interval_ms),
            max_duration: self.scenario.max_duration_ms.map(Duration::from_millis),
            sample_buffer: self.run.sample_buffer,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default = "default_scenario_name")]
    pub name: String,
    /// Free-form labels copied into the run report (e.g. platform, endpoint).
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Optional global duration cap in milliseconds; the run is aborted when
    /// it is reached.
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    /// Deterministic seed for randomized request bodies.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: default_scenario_name(),
            tags: BTreeMap::new(),
            max_duration_ms: None,
            seed: None,
        }
    }
}

fn default_scenario_name() -> String {
    "scenario".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Duration as a string such as `"30s"`, `"1m"` or `"1m30s"`.
    #[serde(default)]
    pub duration: Option<String>,
    /// Duration in milliseconds; alternative to `duration`.
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub start_concurrency: Option<i64>,
    #[serde(alias = "target")]
    pub end_concurrency: i64,
}

impl StageConfig {
    fn duration_ms(&self, index: usize) -> Result<i64, ConfigError> {
        match (&self.duration, self.duration_ms) {
            (Some(text), None) => parse_duration_ms(text),
            (None, Some(ms)) => Ok(ms),
            _ => Err(ConfigError::InvalidDuration(format!(
                "stage {index} needs exactly one of `duration` or `duration_ms`"
            ))),
        }
    }
}

/// Parse `"500ms"`, `"30s"`, `"2m"`, `"1h"` or combinations such as
/// `"1m30s"` into milliseconds. A leading `-` is kept so that negative
/// durations are reported as such by stage validation.
pub fn parse_duration_ms(text: &str) -> Result<i64, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(text.to_string());
    let trimmed = text.trim();
    let (sign, mut rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, trimmed),
    };
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = 0i64;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid());
        }
        let value: i64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let factor = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        total = value
            .checked_mul(factor)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
    }

    Ok(sign * total)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Scheme, host and port of the service under test.
    pub base_url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Idle keep-alive connections kept per host
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_pool_max_idle() -> usize {
    256
}

/// Rules for one source metric, e.g. `metric = "http_req_duration"`,
/// `rules = ["p(95)<300"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub metric: String,
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Capacity of the channel between virtual users and the aggregator
    #[serde(default = "default_sample_buffer")]
    pub sample_buffer: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            sample_buffer: default_sample_buffer(),
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_progress_interval_ms() -> u64 {
    5_000
}

fn default_sample_buffer() -> usize {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::{Comparator, ThresholdMetric};
    use std::path::PathBuf;

    const ORDERS: &str = r#"
[scenario]
name = "orders-post"
seed = 42
tags = { platform = "node", endpoint = "orders-post" }

[[stages]]
duration = "30s"
target = 100

[[stages]]
duration = "1m"
target = 100

[[stages]]
duration = "30s"
target = 0

[target]
base_url = "http://localhost:3002"
method = "post"
path = "/api/orders"
timeout_ms = 500

[body]
kind = "random_json"
choices = { customer_id = ["ALFKI", "ANATR", "ANTON"] }
ranges = { total = { min = 10.0, max = 999.99, decimals = 2 } }

[[checks]]
kind = "status_is"
status = 200

[[thresholds]]
metric = "http_req_duration"
rules = ["p(95)<500"]

[[thresholds]]
metric = "http_req_failed"
rules = ["rate<0.01"]
"#;

    #[test]
    fn test_config_serde() {
        let config = Config::from_toml_str(ORDERS).unwrap();
        assert_eq!(config.scenario.name, "orders-post");
        assert_eq!(config.scenario.seed, Some(42));
        assert_eq!(config.scenario.tags["platform"], "node");
        assert_eq!(config.stages.len(), 3);
        assert_eq!(config.target.timeout_ms, 500);
        assert_eq!(config.target.pool_max_idle_per_host, 256);
        assert_eq!(config.checks, vec![ResponseCheck::StatusIs { status: 200 }]);
        assert_eq!(config.run.tick_interval_ms, 1_000);
        assert!(matches!(config.body, Some(BodyConfig::RandomJson { .. })));
    }

    #[test]
    fn test_stage_inheritance() {
        let config = Config::from_toml_str(ORDERS).unwrap();
        assert_eq!(
            config.stages().unwrap(),
            vec![
                Stage::new(30_000, 0, 100),
                Stage::new(60_000, 100, 100),
                Stage::new(30_000, 100, 0),
            ]
        );
    }

    #[test]
    fn test_run_config() {
        let config = Config::from_toml_str(ORDERS).unwrap();
        let run = config.run_config().unwrap();
        assert_eq!(run.scenario, "orders-post");
        assert_eq!(run.request_timeout, Duration::from_millis(500));
        assert_eq!(run.tick_interval, Duration::from_secs(1));
        assert_eq!(
            run.rules,
            vec![
                ThresholdRule::new(ThresholdMetric::P95Latency, Comparator::Lt, 500.0),
                ThresholdRule::new(ThresholdMetric::ErrorRate, Comparator::Lt, 0.01),
            ]
        );

        let template = config.request_template().unwrap();
        assert_eq!(template.method, reqwest::Method::POST);
        assert_eq!(template.url.as_str(), "http://localhost:3002/api/orders");
    }

    #[test]
    fn test_explicit_stage_fields() {
        let config = Config::from_toml_str(
            r#"
[[stages]]
duration_ms = 10000
start_concurrency = 5
end_concurrency = 5

[target]
base_url = "http://localhost:5050"
"#,
        )
        .unwrap();
        assert_eq!(config.stages().unwrap(), vec![Stage::new(10_000, 5, 5)]);
        assert_eq!(config.target.method, "GET");
        assert_eq!(config.target.timeout_ms, 30_000);
        assert!(config.threshold_rules().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_stage_declarations() {
        let negative = Config::from_toml_str(
            r#"
[[stages]]
duration = "-5s"
target = 3

[target]
base_url = "http://localhost:5050"
"#,
        )
        .unwrap();
        assert!(matches!(
            negative.stages(),
            Err(ConfigError::NegativeDuration { index: 0, .. })
        ));

        let both = Config::from_toml_str(
            r#"
[[stages]]
duration = "5s"
duration_ms = 5000
target = 3

[target]
base_url = "http://localhost:5050"
"#,
        )
        .unwrap();
        assert!(matches!(both.stages(), Err(ConfigError::InvalidDuration(_))));
    }

    #[test]
    fn test_malformed_rule_in_file() {
        let config = Config::from_toml_str(
            r#"
[[stages]]
duration = "1s"
target = 1

[target]
base_url = "http://localhost:5050"

[[thresholds]]
metric = "http_req_duration"
rules = ["p95 < 300"]
"#,
        )
        .unwrap();
        assert!(matches!(
            config.run_config(),
            Err(ConfigError::MalformedRule { .. })
        ));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("30s").unwrap(), 30_000);
        assert_eq!(parse_duration_ms("1m").unwrap(), 60_000);
        assert_eq!(parse_duration_ms("1m30s").unwrap(), 90_000);
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("0s").unwrap(), 0);
        assert_eq!(parse_duration_ms("-2s").unwrap(), -2_000);
        assert!(parse_duration_ms("").is_err());
        assert!(parse_duration_ms("30").is_err());
        assert!(parse_duration_ms("s").is_err());
        assert!(parse_duration_ms("10 sec").is_err());
    }

    #[test]
    fn test_upload_path_is_relative_to_scenario_file() {
        let toml = r#"
[[stages]]
duration = "1s"
target = 1

[target]
base_url = "http://localhost:5050"
method = "POST"
path = "/api/upload"

[body]
kind = "multipart_file"
path = "../sample-data/testfile.bin"
"#;
        let mut config = Config::from_toml_str(toml).unwrap();
        config.resolve_paths(Path::new("/srv/scenarios"));
        match &config.body {
            Some(BodyConfig::MultipartFile { path, .. }) => {
                assert_eq!(path, &PathBuf::from("/srv/scenarios/../sample-data/testfile.bin"));
            }
            other => panic!("expected multipart body, got {other:?}"),
        }

        let mut absolute = Config::from_toml_str(&toml.replace("../sample-data", "/data")).unwrap();
        absolute.resolve_paths(Path::new("/srv/scenarios"));
        assert!(matches!(
            &absolute.body,
            Some(BodyConfig::MultipartFile { path, .. }) if path == &PathBuf::from("/data/testfile.bin")
        ));
    }
}
