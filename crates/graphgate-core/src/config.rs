//! graphgate.toml configuration parser.
//!
//! Every section and field has a default, so an empty document is a valid
//! configuration. Durations are written as `"500ms"`, `"10s"`, `"2m"`, or a
//! bare integer meaning seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    pub validation: ValidationConfig,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Locator of the backing database, handed to the engine unchanged.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("graph.kz"),
        }
    }
}

/// Connection pool tuning. Immutable once the pool is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on concurrently open engine handles (default: 5).
    pub max_connections: usize,
    /// Handles opened eagerly at startup and kept alive by the health sweep (default: 1).
    pub initial_connections: usize,
    /// Attempts per query beyond the first (default: 3).
    pub max_retries: u32,
    /// Wait between attempts (default: 10s).
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,
    /// Maximum wait for pool capacity before giving up (default: 30s).
    #[serde(with = "duration_str")]
    pub acquire_timeout: Duration,
    /// Idle connections unused for longer are evicted (default: 300s).
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    /// Period of the background health sweep; zero disables it (default: 60s).
    #[serde(with = "duration_str")]
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            initial_connections: 1,
            max_retries: 3,
            retry_delay: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.max_connections == 0 {
            return Err(GatewayError::Config(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        if self.initial_connections > self.max_connections {
            return Err(GatewayError::Config(format!(
                "pool.initial_connections ({}) exceeds pool.max_connections ({})",
                self.initial_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Thresholds and deny-list used by the query validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Longest accepted query, in characters (default: 10000).
    pub max_query_length: usize,
    /// SKIP values above this are logged (default: 5000).
    pub warn_skip_threshold: u64,
    /// SKIP values above this are rejected (default: 10000).
    pub reject_skip_threshold: u64,
    /// Case-insensitive substrings that make a query inadmissible.
    pub denied_patterns: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_query_length: 10_000,
            warn_skip_threshold: 5_000,
            reject_skip_threshold: 10_000,
            denied_patterns: [
                "DROP DATABASE",
                "DELETE DATABASE",
                "SHUTDOWN",
                "KILL PROCESS",
                "TERMINATE",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> GatewayResult<()> {
        if self.max_query_length == 0 {
            return Err(GatewayError::Config(
                "validation.max_query_length must be at least 1".to_string(),
            ));
        }
        if self.warn_skip_threshold > self.reject_skip_threshold {
            return Err(GatewayError::Config(format!(
                "validation.warn_skip_threshold ({}) exceeds validation.reject_skip_threshold ({})",
                self.warn_skip_threshold, self.reject_skip_threshold
            )));
        }
        if self.denied_patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(GatewayError::Config(
                "validation.denied_patterns must not contain blank entries".to_string(),
            ));
        }
        Ok(())
    }
}

/// How write statements are scheduled against the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Writes share one slot; at most one runs at a time. Reads are unaffected.
    #[default]
    SingleWriter,
    /// Writes run as freely as reads.
    Concurrent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub write_policy: WritePolicy,
    /// `LIMIT` appended to queries that return rows without one; 0 turns
    /// the automatic `LIMIT` off (default: 20000).
    pub max_result_rows: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            write_policy: WritePolicy::SingleWriter,
            max_result_rows: 20_000,
        }
    }
}

impl ExecutionConfig {
    /// The automatic `LIMIT`, or `None` when it is turned off.
    pub fn result_row_cap(&self) -> Option<usize> {
        (self.max_result_rows > 0).then_some(self.max_result_rows)
    }
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field invariants of every section.
    pub fn validate(&self) -> GatewayResult<()> {
        self.pool.validate()?;
        self.validation.validate()?;
        Ok(())
    }
}

/// Parse `"500ms"`, `"10s"`, `"2m"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.trim().parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.trim().parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Render a duration in the shortest form `parse_duration` reads back.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid duration: {text:?}"))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.pool.max_connections, 5);
        assert_eq!(config.pool.max_retries, 3);
        assert_eq!(config.pool.retry_delay, Duration::from_secs(10));
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.validation.reject_skip_threshold, 10_000);
        assert_eq!(config.execution.write_policy, WritePolicy::SingleWriter);
    }

    #[test]
    fn example_file_matches_defaults() {
        let text = include_str!("../../../graphgate.example.toml");
        assert_eq!(GatewayConfig::from_toml_str(text).unwrap(), GatewayConfig::default());
    }

    #[test]
    fn parse_full_document() {
        let toml_str = r#"
[database]
path = "/var/lib/notes/graph.kz"

[pool]
max_connections = 3
initial_connections = 2
max_retries = 2
retry_delay = "250ms"
acquire_timeout = 5
idle_timeout = "2m"
health_check_interval = "30s"

[validation]
max_query_length = 2048
warn_skip_threshold = 100
reject_skip_threshold = 500
denied_patterns = ["DETACH DELETE"]

[execution]
write_policy = "concurrent"
"#;
        let config = GatewayConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/notes/graph.kz"));
        assert_eq!(config.pool.max_connections, 3);
        assert_eq!(config.pool.initial_connections, 2);
        assert_eq!(config.pool.retry_delay, Duration::from_millis(250));
        assert_eq!(config.pool.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.validation.denied_patterns, vec!["DETACH DELETE"]);
        assert_eq!(config.execution.write_policy, WritePolicy::Concurrent);
        // Unset fields inside a present section keep their defaults.
        assert_eq!(config.execution.max_result_rows, 20_000);
    }

    #[test]
    fn zero_max_result_rows_disables_automatic_limit() {
        let config = GatewayConfig::from_toml_str("[execution]\nmax_result_rows = 0\n").unwrap();
        assert_eq!(config.execution.result_row_cap(), None);

        let config =
            GatewayConfig::from_toml_str("[execution]\nwrite_policy = \"concurrent\"\n").unwrap();
        assert_eq!(config.execution.result_row_cap(), Some(20_000));
    }

    #[test]
    fn toml_round_trip_preserves_durations() {
        let mut config = GatewayConfig::default();
        config.pool.retry_delay = Duration::from_millis(1500);
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("retry_delay = \"1500ms\""));
        assert_eq!(GatewayConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn rejects_zero_max_connections() {
        let err = GatewayConfig::from_toml_str("[pool]\nmax_connections = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_connections"));
    }

    #[test]
    fn rejects_initial_above_max() {
        let err = GatewayConfig::from_toml_str(
            "[pool]\nmax_connections = 2\ninitial_connections = 3\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("initial_connections"));
    }

    #[test]
    fn rejects_inverted_skip_thresholds() {
        let config = GatewayConfig {
            validation: ValidationConfig {
                warn_skip_threshold: 20_000,
                ..ValidationConfig::default()
            },
            ..GatewayConfig::default()
        };
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));
    }

    #[test]
    fn rejects_blank_denied_pattern() {
        let config = GatewayConfig {
            validation: ValidationConfig {
                denied_patterns: vec!["  ".to_string()],
                ..ValidationConfig::default()
            },
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_duration() {
        let err = GatewayConfig::from_toml_str("[pool]\nretry_delay = \"soon\"\n").unwrap_err();
        assert!(err.to_string().contains("invalid duration"));
    }

    #[test]
    fn rejects_overflowing_minutes() {
        let text = format!("[pool]\nidle_timeout = \"{}m\"\n", u64::MAX);
        let err = GatewayConfig::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("invalid duration"));
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nmax_connections = 7").unwrap();
        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool.max_connections, 7);
    }

    #[test]
    fn from_file_missing_is_error() {
        assert!(GatewayConfig::from_file(Path::new("/nonexistent/graphgate.toml")).is_err());
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
    }

    #[test]
    fn format_duration_forms() {
        assert_eq!(format_duration(Duration::from_secs(10)), "10s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
