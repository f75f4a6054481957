use std::path::PathBuf;

/// Errors raised while validating a run declaration. Always fatal and always
/// surfaced before any virtual user is started.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("At least one stage is required")]
    NoStages,

    #[error("Stage {index} has negative duration: {duration_ms}ms")]
    NegativeDuration { index: usize, duration_ms: i64 },

    #[error("Stage {index} has negative concurrency: start={start} end={end}")]
    NegativeConcurrency { index: usize, start: i64, end: i64 },

    #[error("Invalid duration '{0}', expected e.g. \"500ms\", \"30s\", \"1m30s\"")]
    InvalidDuration(String),

    #[error("Malformed threshold rule '{rule}': {reason}")]
    MalformedRule { rule: String, reason: String },

    #[error("Unknown threshold metric '{0}'")]
    UnknownMetric(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid body: {0}")]
    InvalidBody(String),

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

impl ConfigError {
    pub(crate) fn malformed(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::MalformedRule {
            rule: rule.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that end a run without a verdict.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Internal task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for RunError {
    fn from(err: tokio::task::JoinError) -> Self {
        RunError::Task(err.to_string())
    }
}
