use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub admission: AdmissionConfig,
    pub tasks: TaskDefaults,
    pub workers: WorkerHealthConfig,
    pub monitors: MonitorConfig,
    pub persistence: PersistenceConfig,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
}

/// Which algorithm gates admissions per task name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    /// At most `rate_limit` admissions per window; the counter resets when the window ends
    #[default]
    FixedWindow,
    /// GCRA: the same average rate, admissions spread evenly after an initial burst
    Smooth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Admissions allowed per task name and window
    pub rate_limit: u32,
    pub rate_window_secs: u64,
    pub limiter: LimiterKind,
    /// How long a dedupe key keeps blocking after its task reached a terminal state
    pub dedupe_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    pub default_timeout_secs: u64,
    pub default_max_retries: u32,
    /// Delay between a failed attempt and its re-enqueue; immediate when unset
    pub retry_backoff: Option<BackoffConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerHealthConfig {
    /// Interval workers are expected to heartbeat at
    pub heartbeat_interval_ms: u64,
    /// A worker silent for longer is considered dead
    pub heartbeat_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub health_check_interval_ms: u64,
    pub timeout_check_interval_ms: u64,
    pub dead_letter_interval_ms: u64,
    pub delay_tick_ms: u64,
    pub housekeeping_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub data_dir: PathBuf,
    /// Rewrite the journal after this many appends
    pub compact_after: u64,
    pub completed_task_retention_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub rest_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub prometheus_port: u16,
    pub log_level: String,
    /// Also write daily rolling log files here
    pub log_dir: Option<PathBuf>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig {
            rate_limit: 100,
            rate_window_secs: 60,
            limiter: LimiterKind::FixedWindow,
            dedupe_grace_ms: 5_000,
        }
    }
}

impl Default for TaskDefaults {
    fn default() -> Self {
        TaskDefaults {
            default_timeout_secs: task_queue_core::DEFAULT_TIMEOUT_SECS,
            default_max_retries: task_queue_core::DEFAULT_MAX_RETRIES,
            retry_backoff: None,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base_delay_ms: 5_000,
            max_delay_ms: 3_600_000,
        }
    }
}

impl Default for WorkerHealthConfig {
    fn default() -> Self {
        WorkerHealthConfig {
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            health_check_interval_ms: 5_000,
            timeout_check_interval_ms: 1_000,
            dead_letter_interval_ms: 5_000,
            delay_tick_ms: 100,
            housekeeping_interval_ms: 10_000,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            enabled: false,
            data_dir: PathBuf::from("./data"),
            compact_after: 10_000,
            completed_task_retention_days: 7,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "0.0.0.0".to_string(),
            rest_port: 8080,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            prometheus_port: 9091,
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl BackoffConfig {
    /// `base * 2^retry_count`, capped at `max_delay_ms`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(retry_count.min(20));
        let delay = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl BrokerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BrokerConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.admission.rate_limit == 0 {
            anyhow::bail!("admission.rate_limit must be at least 1");
        }
        if self.admission.rate_window_secs == 0 {
            anyhow::bail!("admission.rate_window_secs must be at least 1");
        }
        if self.workers.heartbeat_timeout_ms <= self.workers.heartbeat_interval_ms {
            anyhow::bail!("workers.heartbeat_timeout_ms must exceed heartbeat_interval_ms");
        }
        if self.tasks.default_timeout_secs > task_queue_core::MAX_TIMEOUT_SECS {
            anyhow::bail!(
                "tasks.default_timeout_secs must not exceed {}",
                task_queue_core::MAX_TIMEOUT_SECS
            );
        }
        let m = &self.monitors;
        for (name, value) in [
            ("health_check_interval_ms", m.health_check_interval_ms),
            ("timeout_check_interval_ms", m.timeout_check_interval_ms),
            ("dead_letter_interval_ms", m.dead_letter_interval_ms),
            ("delay_tick_ms", m.delay_tick_ms),
            ("housekeeping_interval_ms", m.housekeeping_interval_ms),
        ] {
            if value == 0 {
                anyhow::bail!("monitors.{} must be positive", name);
            }
        }
        Ok(())
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.admission.rate_window_secs)
    }

    pub fn dedupe_grace(&self) -> Duration {
        Duration::from_millis(self.admission.dedupe_grace_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.workers.heartbeat_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.admission.rate_limit, 100);
        assert_eq!(config.rate_window(), Duration::from_secs(60));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(config.tasks.default_timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
admission:
  rate_limit: 5
  limiter: smooth
tasks:
  retry_backoff:
    base_delay_ms: 100
persistence:
  enabled: true
  data_dir: /tmp/tq
"#;
        let config: BrokerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.admission.rate_limit, 5);
        assert_eq!(config.admission.limiter, LimiterKind::Smooth);
        assert_eq!(config.admission.rate_window_secs, 60);
        let backoff = config.tasks.retry_backoff.unwrap();
        assert_eq!(backoff.base_delay_ms, 100);
        assert_eq!(backoff.max_delay_ms, 3_600_000);
        assert!(config.persistence.enabled);
        assert_eq!(config.workers.heartbeat_timeout_ms, 30_000);
    }

    #[test]
    fn test_backoff_delay() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for(0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(20));
        assert_eq!(backoff.delay_for(10), Duration::from_secs(3600));
    }

    #[test]
    fn test_validation_rejects_bad_heartbeat_window() {
        let mut config = BrokerConfig::default();
        config.workers.heartbeat_timeout_ms = config.workers.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_oversized_default_timeout() {
        let mut config = BrokerConfig::default();
        config.tasks.default_timeout_secs = task_queue_core::MAX_TIMEOUT_SECS + 1;
        assert!(config.validate().is_err());
    }
}
