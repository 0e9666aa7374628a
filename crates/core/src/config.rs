//! Runtime configuration.
//!
//! Settings are defaulted, optionally loaded from a TOML file and then
//! overridden from the process environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// An environment override could not be parsed
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv {
        /// Environment variable name
        key: String,
        /// Raw value that failed to parse
        value: String,
    },

    /// A setting is outside its supported range
    #[error("{field} = {value} exceeds the maximum of {max}")]
    OutOfRange {
        /// Dotted setting path
        field: &'static str,
        /// Configured value
        value: u64,
        /// Largest accepted value
        max: u64,
    },
}

/// Longest accepted cache TTL (ten years).
pub const MAX_CACHE_TTL_HOURS: u64 = 24 * 365 * 10;

/// Longest accepted result retention (ten years).
pub const MAX_RETENTION_SECS: u64 = 60 * 60 * 24 * 365 * 10;

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Admission and lease limits
    pub resources: ResourceLimits,
    /// Execution queue
    pub queue: QueueSettings,
    /// Result cache
    pub cache: CacheSettings,
    /// Orchestrator loops
    pub manager: ManagerSettings,
    /// Automation server and executor
    pub executor: ExecutorSettings,
}

/// Admission and lease limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Host memory budget in MiB
    pub max_memory_mb: u64,
    /// Lease lifetime cap
    pub max_execution_time_secs: u64,
    /// Simultaneous executions
    pub max_concurrent_executions: usize,
    /// CPU usage above which admission is refused
    pub cpu_limit_percent: f64,
    /// Disk usage flagged in resource reports
    pub disk_limit_percent: f64,
    /// Seconds without a heartbeat before a lease is reclaimed
    pub heartbeat_timeout_secs: u64,
    /// Completed leases kept in the in-memory history
    pub history_limit: usize,
    /// Resource monitor period
    pub monitor_interval_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 400,
            max_execution_time_secs: 300,
            max_concurrent_executions: 2,
            cpu_limit_percent: 80.0,
            disk_limit_percent: 90.0,
            heartbeat_timeout_secs: 60,
            history_limit: 100,
            monitor_interval_secs: 30,
        }
    }
}

impl ResourceLimits {
    /// Lease lifetime cap as a `Duration`.
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time_secs)
    }

    /// Heartbeat timeout as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Execution queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Waiting executions accepted before rejecting
    pub max_size: usize,
    /// Fixed per-item wait estimate
    pub wait_per_item_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            wait_per_item_secs: 60,
        }
    }
}

/// Result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Entries kept before evicting the least recently used
    pub max_size: usize,
    /// Entry lifetime
    pub ttl_hours: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: 100,
            ttl_hours: 24,
        }
    }
}

/// Orchestrator loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Queue drain poll interval
    pub poll_interval_secs: u64,
    /// How long finished results stay queryable
    pub retention_secs: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            retention_secs: 3600,
        }
    }
}

/// Automation server and executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Node.js executable
    pub node_binary: String,
    /// Directory the server script is written under; node resolves its
    /// modules from here. Defaults to the system temp dir.
    pub script_dir: Option<String>,
    /// Interface the automation server binds
    pub host: String,
    /// First port handed out
    pub base_port: u16,
    /// Number of ports rotated through for concurrent servers
    pub port_span: u16,
    /// Wait after spawn before the first health check
    pub startup_grace_ms: u64,
    /// Health check deadline
    pub health_timeout_secs: u64,
    /// Per-request deadline for the control API
    pub request_timeout_secs: u64,
    /// Wait for the server to exit before killing it
    pub cleanup_grace_secs: u64,
    /// Send multi-step cases through `/ai-batch`
    pub batching_enabled: bool,
    /// Batch only when the step count exceeds this
    pub batch_threshold: usize,
    /// Heap cap for lightweight runs
    pub lightweight_memory_mb: u64,
    /// Step loop budget for lightweight runs
    pub lightweight_time_limit_secs: u64,
    /// Vision model credentials
    pub ai: AiSettings,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            node_binary: "node".to_string(),
            script_dir: None,
            host: "127.0.0.1".to_string(),
            base_port: 3001,
            port_span: 16,
            startup_grace_ms: 5000,
            health_timeout_secs: 5,
            request_timeout_secs: 60,
            cleanup_grace_secs: 5,
            batching_enabled: true,
            batch_threshold: 3,
            lightweight_memory_mb: 200,
            lightweight_time_limit_secs: 180,
            ai: AiSettings::default(),
        }
    }
}

/// Vision model credentials forwarded to the automation server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    /// Model API key
    pub api_key: Option<String>,
    /// Model API base URL
    pub base_url: String,
    /// Vision model name
    pub model_name: String,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            model_name: "qwen-vl-max-latest".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, or defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings: Self = toml::from_str(&content)?;
            settings.validate()?;
            Ok(settings)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let r = &mut self.resources;
        override_parsed(&lookup, "PROBEKIT_MAX_MEMORY_MB", &mut r.max_memory_mb)?;
        override_parsed(&lookup, "PROBEKIT_MAX_EXECUTION_TIME", &mut r.max_execution_time_secs)?;
        override_parsed(&lookup, "PROBEKIT_MAX_CONCURRENT", &mut r.max_concurrent_executions)?;
        override_parsed(&lookup, "PROBEKIT_QUEUE_MAX_SIZE", &mut self.queue.max_size)?;
        override_parsed(&lookup, "PROBEKIT_CACHE_MAX_SIZE", &mut self.cache.max_size)?;
        override_parsed(&lookup, "PROBEKIT_CACHE_TTL_HOURS", &mut self.cache.ttl_hours)?;
        override_parsed(&lookup, "PROBEKIT_POLL_INTERVAL", &mut self.manager.poll_interval_secs)?;

        let e = &mut self.executor;
        override_parsed(&lookup, "PROBEKIT_NODE_BINARY", &mut e.node_binary)?;
        if let Some(dir) = lookup("PROBEKIT_SCRIPT_DIR").filter(|d| !d.is_empty()) {
            e.script_dir = Some(dir);
        }
        override_parsed(&lookup, "PROBEKIT_BASE_PORT", &mut e.base_port)?;
        override_parsed(&lookup, "PROBEKIT_BATCHING", &mut e.batching_enabled)?;

        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty()) {
            e.ai.api_key = Some(key);
        }
        override_parsed(&lookup, "OPENAI_BASE_URL", &mut e.ai.base_url)?;
        override_parsed(&lookup, "MIDSCENE_MODEL_NAME", &mut e.ai.model_name)?;
        self.validate()
    }

    /// Reject values that cannot be represented as time spans.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_max("cache.ttl_hours", self.cache.ttl_hours, MAX_CACHE_TTL_HOURS)?;
        check_max("manager.retention_secs", self.manager.retention_secs, MAX_RETENTION_SECS)
    }
}

fn check_max(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange { field, value, max });
    }
    Ok(())
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(key) {
        *target = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.resources.max_memory_mb, 400);
        assert_eq!(settings.resources.max_execution_time_secs, 300);
        assert_eq!(settings.resources.max_concurrent_executions, 2);
        assert_eq!(settings.queue.max_size, 10);
        assert_eq!(settings.cache.max_size, 100);
        assert_eq!(settings.cache.ttl_hours, 24);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PROBEKIT_MAX_CONCURRENT", "4"),
            ("PROBEKIT_BATCHING", "false"),
            ("OPENAI_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.resources.max_concurrent_executions, 4);
        assert!(!settings.executor.batching_enabled);
        assert_eq!(settings.executor.ai.api_key.as_deref(), Some("sk-test"));
        assert_eq!(settings.queue.max_size, 10);
    }

    #[test]
    fn test_invalid_env_override() {
        let mut settings = Settings::default();
        let err = settings
            .apply_overrides(|k| (k == "PROBEKIT_MAX_MEMORY_MB").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_huge_cache_ttl_rejected() {
        let mut settings = Settings::default();
        let err = settings
            .apply_overrides(|k| {
                (k == "PROBEKIT_CACHE_TTL_HOURS").then(|| "100000000000000000".to_string())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                field: "cache.ttl_hours",
                ..
            }
        ));

        let mut settings = Settings::default();
        settings
            .apply_overrides(|k| (k == "PROBEKIT_CACHE_TTL_HOURS").then(|| "87600".to_string()))
            .unwrap();
        assert_eq!(settings.cache.ttl_hours, MAX_CACHE_TTL_HOURS);
    }

    #[test]
    fn test_load_rejects_huge_retention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probekit.toml");
        std::fs::write(&path, "[manager]\nretention_secs = 9223372036854775807\n").unwrap();

        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                field: "manager.retention_secs",
                ..
            }
        ));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probekit.toml");
        std::fs::write(&path, "[queue]\nmax_size = 3\n\n[executor]\nbase_port = 4100\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.queue.max_size, 3);
        assert_eq!(settings.queue.wait_per_item_secs, 60);
        assert_eq!(settings.executor.base_port, 4100);
        assert_eq!(settings.cache.ttl_hours, 24);
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/probekit.toml")).unwrap();
        assert_eq!(settings.manager.poll_interval_secs, 5);
    }
}
