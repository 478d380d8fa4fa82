use serde::{Deserialize, Serialize};
use std::time::Duration;
use task_queue_broker::BrokerConfig;
use task_queue_core::QueueName;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Base id; each pool member appends its index. Generated when unset.
    pub worker_id: Option<String>,
    /// Number of workers in the pool; each runs one task at a time
    pub concurrency: usize,
    pub heartbeat_interval_ms: u64,
    /// Pause between claims when every queue is empty
    pub poll_interval_ms: u64,
    /// Queues to claim from; all queues when empty
    pub queues: Vec<String>,
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            worker_id: None,
            concurrency: 4,
            heartbeat_interval_ms: 10_000,
            poll_interval_ms: 100,
            queues: Vec::new(),
            graceful_shutdown_timeout_secs: 60,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("worker.concurrency must be at least 1");
        }
        if self.heartbeat_interval_ms == 0 || self.poll_interval_ms == 0 {
            anyhow::bail!("worker intervals must be positive");
        }
        if self.queues.iter().any(|q| q.trim().is_empty()) {
            anyhow::bail!("worker.queues must not contain empty names");
        }
        Ok(())
    }

    pub fn generate_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = std::process::id();
        let random = Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, pid, &random[..8])
    }

    pub fn queue_names(&self) -> Vec<QueueName> {
        self.queues.iter().map(|q| QueueName::new(q.as_str())).collect()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}

/// Configuration file of a `tq-node` process: the embedded broker and its
/// local worker pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
}

impl NodeConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.broker.validate()?;
        self.worker.validate()?;
        if self.worker.heartbeat_interval_ms >= self.broker.workers.heartbeat_timeout_ms {
            anyhow::bail!(
                "worker.heartbeat_interval_ms ({}) must be below broker heartbeat timeout ({})",
                self.worker.heartbeat_interval_ms,
                self.broker.workers.heartbeat_timeout_ms
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_worker_id_wins() {
        let config = WorkerConfig {
            worker_id: Some("node-a".to_string()),
            ..Default::default()
        };
        assert_eq!(config.generate_worker_id(), "node-a");
    }

    #[test]
    fn test_generated_worker_id_is_unique() {
        let config = WorkerConfig::default();
        let a = config.generate_worker_id();
        let b = config.generate_worker_id();
        assert_ne!(a, b);
        assert!(a.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_node_config_from_yaml() {
        let yaml = r#"
broker:
  admission:
    rate_limit: 500
  workers:
    heartbeat_interval_ms: 3000
    heartbeat_timeout_ms: 9000
worker:
  concurrency: 2
  heartbeat_interval_ms: 3000
  queues: [urgent, default]
"#;
        let config: NodeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.broker.admission.rate_limit, 500);
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(
            config.worker.queue_names(),
            vec![QueueName::new("urgent"), QueueName::new("default")]
        );
        assert_eq!(config.worker.poll_interval_ms, 100);
        config.validate().unwrap();
    }

    #[test]
    fn test_worker_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.yaml");
        std::fs::write(&path, "worker_id: edge\nconcurrency: 8\n").unwrap();

        let config = WorkerConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.generate_worker_id(), "edge");
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert!(WorkerConfig::from_file("/nonexistent/worker.yaml").is_err());
    }

    #[test]
    fn test_heartbeat_must_beat_broker_timeout() {
        let mut config = NodeConfig::default();
        config.worker.heartbeat_interval_ms = config.broker.workers.heartbeat_timeout_ms;
        assert!(config.validate().is_err());

        config.worker.heartbeat_interval_ms = 1000;
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
