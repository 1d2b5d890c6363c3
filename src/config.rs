// Batch configuration
//
// One explicit struct built once at process start and handed to the store,
// the orchestrator and the scheduler. Sources, lowest priority first:
// built-in defaults, an optional TOML file, then BALANCE__* environment vars.

use crate::error::{BatchError, Result};
use chrono_tz::Tz;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default file looked up when no --config path is given (extension optional)
pub const DEFAULT_CONFIG_FILE: &str = "config/balance";

/// Environment prefix, e.g. BALANCE__PARTITIONING__PARTITION_COUNT=4
pub const ENV_PREFIX: &str = "BALANCE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub database: DatabaseConfig,
    pub partitioning: PartitioningConfig,
    pub schedule: ScheduleConfig,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file (WAL mode)
    pub path: PathBuf,
    /// Pooled connections; must cover the worker count
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("balances.db"),
            pool_size: 10,
            busy_timeout_ms: 30_000,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitioningConfig {
    /// Number of account-id sub-ranges (gridSize)
    pub partition_count: usize,
    pub min_key: i64,
    pub max_key: i64,
    /// Worker pool size; defaults to partition_count
    pub workers: Option<usize>,
}

impl Default for PartitioningConfig {
    fn default() -> Self {
        Self {
            partition_count: 8,
            min_key: 1,
            max_key: 10_000_000,
            workers: None,
        }
    }
}

impl PartitioningConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or(self.partition_count)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Six-field cron expression, seconds first
    pub cron: String,
    /// IANA timezone the cron expression is evaluated in
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 57 12 * * *".to_string(),
            timezone: "America/Toronto".to_string(),
        }
    }
}

impl ScheduleConfig {
    pub fn parse_cron(&self) -> Result<cron::Schedule> {
        cron::Schedule::from_str(&self.cron).map_err(|e| {
            BatchError::Config(format!("invalid cron expression '{}': {}", self.cron, e))
        })
    }

    pub fn parse_timezone(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|e| {
            BatchError::Config(format!("unknown timezone '{}': {}", self.timezone, e))
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Deadline for one partition's unit of work (None = unbounded)
    pub unit_timeout_secs: Option<u64>,
}

impl ExecutionConfig {
    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl BatchConfig {
    /// Load from the default file (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load with an explicit file; an explicit path must exist
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: BatchConfig = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on anything that would only blow up mid-run
    pub fn validate(&self) -> Result<()> {
        let p = &self.partitioning;

        if p.partition_count == 0 {
            return Err(BatchError::Config(
                "partitioning.partition_count must be at least 1".to_string(),
            ));
        }

        if p.min_key > p.max_key {
            return Err(BatchError::Config(format!(
                "partitioning.min_key ({}) must not exceed max_key ({})",
                p.min_key, p.max_key
            )));
        }

        let workers = p.worker_count();
        if workers == 0 {
            return Err(BatchError::Config(
                "partitioning.workers must be at least 1".to_string(),
            ));
        }

        // Fewer connections than workers starves the pool
        if (self.database.pool_size as usize) < workers {
            return Err(BatchError::Config(format!(
                "database.pool_size ({}) must be >= worker count ({})",
                self.database.pool_size, workers
            )));
        }

        self.schedule.parse_cron()?;
        self.schedule.parse_timezone()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = BatchConfig::default();
        config.validate().unwrap();

        assert_eq!(config.partitioning.partition_count, 8);
        assert_eq!(config.partitioning.min_key, 1);
        assert_eq!(config.partitioning.max_key, 10_000_000);
        assert_eq!(config.partitioning.worker_count(), 8);
        assert_eq!(config.execution.unit_timeout(), None);
    }

    #[test]
    fn test_rejects_zero_partitions() {
        let mut config = BatchConfig::default();
        config.partitioning.partition_count = 0;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, BatchError::Config(_)));
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let mut config = BatchConfig::default();
        config.partitioning.min_key = 100;
        config.partitioning.max_key = 10;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_key (100)"));
    }

    #[test]
    fn test_rejects_pool_smaller_than_workers() {
        let mut config = BatchConfig::default();
        config.database.pool_size = 4;
        config.partitioning.workers = Some(6);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool_size (4)"));
    }

    #[test]
    fn test_rejects_bad_schedule() {
        let mut config = BatchConfig::default();
        config.schedule.cron = "every day at noon".to_string();
        assert!(config.validate().is_err());

        let mut config = BatchConfig::default();
        config.schedule.timezone = "Mars/Olympus_Mons".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
path = "/tmp/test-balances.db"
pool_size = 4

[partitioning]
partition_count = 4
min_key = 1
max_key = 1000

[execution]
unit_timeout_secs = 60
"#
        )
        .unwrap();

        let config = BatchConfig::load_from(Some(file.path())).unwrap();

        assert_eq!(config.database.path, PathBuf::from("/tmp/test-balances.db"));
        assert_eq!(config.partitioning.partition_count, 4);
        assert_eq!(config.partitioning.worker_count(), 4);
        assert_eq!(config.partitioning.max_key, 1000);
        assert_eq!(config.execution.unit_timeout(), Some(Duration::from_secs(60)));
        // untouched sections keep their defaults
        assert_eq!(config.schedule.timezone, "America/Toronto");
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let result = BatchConfig::load_from(Some(Path::new("/nonexistent/balance.toml")));
        assert!(matches!(result, Err(BatchError::Config(_))));
    }
}
