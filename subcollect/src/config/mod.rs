use crate::error::{Result, SubcollectError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest number of writes the store accepts in one atomic commit.
pub const DEFAULT_MAX_BATCH_OPS: usize = 500;

/// Environment variable naming the store credentials file.
pub const CREDENTIALS_ENV: &str = "SUBCOLLECT_CREDENTIALS";

/// Credentials file used when `SUBCOLLECT_CREDENTIALS` is unset.
pub const DEFAULT_CREDENTIALS_PATH: &str = "store-credentials.json";

/// Whether a run may issue mutating writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Execute,
}

impl RunMode {
    pub fn from_execute_flag(execute: bool) -> Self {
        if execute {
            RunMode::Execute
        } else {
            RunMode::DryRun
        }
    }

    pub fn is_dry_run(self) -> bool {
        self == RunMode::DryRun
    }

    pub fn label(self) -> &'static str {
        match self {
            RunMode::DryRun => "DRY RUN",
            RunMode::Execute => "EXECUTE",
        }
    }
}

/// Bounded retry with exponential backoff for batch commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each later one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

/// Settings every write-capable component receives at construction.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub mode: RunMode,
    pub max_batch_ops: usize,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn new(mode: RunMode) -> Self {
        PipelineConfig {
            mode,
            max_batch_ops: DEFAULT_MAX_BATCH_OPS,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_max_batch_ops(mut self, max_batch_ops: usize) -> Self {
        self.max_batch_ops = max_batch_ops;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Contents of the store credentials file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Credentials {
    pub project_id: String,
    /// Path to the store database. Relative paths are resolved against the
    /// directory holding the credentials file.
    pub database: PathBuf,
    #[serde(default)]
    pub max_batch_ops: Option<usize>,
}

impl Credentials {
    pub fn batch_limit(&self) -> usize {
        self.max_batch_ops.unwrap_or(DEFAULT_MAX_BATCH_OPS)
    }
}

/// Resolve the credentials path from the environment, falling back to the default.
pub fn credentials_path() -> PathBuf {
    resolve_credentials_path(std::env::var(CREDENTIALS_ENV).ok())
}

pub fn resolve_credentials_path(env_value: Option<String>) -> PathBuf {
    match env_value {
        Some(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => PathBuf::from(DEFAULT_CREDENTIALS_PATH),
    }
}

/// Load and check the credentials file. Any failure here is fatal for a run.
pub fn load_credentials(path: &Path) -> Result<Credentials> {
    if !path.exists() {
        return Err(SubcollectError::Credentials(format!(
            "credentials file not found at {} (set {CREDENTIALS_ENV} to override)",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let mut credentials: Credentials = serde_json::from_str(&content).map_err(|e| {
        SubcollectError::Credentials(format!("cannot parse {}: {e}", path.display()))
    })?;

    if credentials.project_id.trim().is_empty() {
        return Err(SubcollectError::Credentials(format!(
            "{}: project_id is empty",
            path.display()
        )));
    }

    match credentials.max_batch_ops {
        Some(0) => {
            return Err(SubcollectError::Config(
                "max_batch_ops must be at least 1".into(),
            ))
        }
        Some(n) if n > DEFAULT_MAX_BATCH_OPS => {
            return Err(SubcollectError::Config(format!(
                "max_batch_ops {n} exceeds the store limit of {DEFAULT_MAX_BATCH_OPS}"
            )))
        }
        _ => {}
    }

    if credentials.database.is_relative() {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        credentials.database = base.join(&credentials.database);
    }
    if !credentials.database.exists() {
        return Err(SubcollectError::Credentials(format!(
            "database {} named in {} does not exist",
            credentials.database.display(),
            path.display()
        )));
    }

    Ok(credentials)
}
