use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::BTreeMap;
use task_queue_core::{QueueName, QueueStats};

/// Prometheus metrics for the broker
pub struct BrokerMetrics {
    pub registry: Registry,

    // Task counters
    pub tasks_total: CounterVec,
    pub admission_rejections: IntCounterVec,
    pub workers_reaped: IntCounter,

    // Task gauges
    pub tasks_pending: IntGauge,
    pub tasks_in_progress: IntGauge,
    pub tasks_dead: IntGauge,

    // Processing duration
    pub task_processing_duration: HistogramVec,

    // Worker metrics
    pub workers_connected: IntGauge,

    // Queue depth
    pub queue_depth: IntGaugeVec,
}

impl BrokerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let tasks_total = CounterVec::new(
            Opts::new("tq_tasks_total", "Task lifecycle events by status and task name"),
            &["status", "task_name"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        let admission_rejections = IntCounterVec::new(
            Opts::new(
                "tq_admission_rejections_total",
                "Submissions not admitted, by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(admission_rejections.clone()))?;

        let workers_reaped = IntCounter::new(
            "tq_workers_reaped_total",
            "Workers removed after missing their heartbeat window",
        )?;
        registry.register(Box::new(workers_reaped.clone()))?;

        let tasks_pending = IntGauge::new("tq_tasks_pending", "Number of pending tasks")?;
        registry.register(Box::new(tasks_pending.clone()))?;

        let tasks_in_progress =
            IntGauge::new("tq_tasks_in_progress", "Number of running tasks")?;
        registry.register(Box::new(tasks_in_progress.clone()))?;

        let tasks_dead = IntGauge::new("tq_tasks_dead", "Number of dead-lettered tasks")?;
        registry.register(Box::new(tasks_dead.clone()))?;

        let task_processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "tq_task_processing_duration_seconds",
                "Task processing duration in seconds",
            ),
            &["task_name"],
        )?;
        registry.register(Box::new(task_processing_duration.clone()))?;

        let workers_connected =
            IntGauge::new("tq_workers_connected", "Number of live workers")?;
        registry.register(Box::new(workers_connected.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("tq_queue_depth", "Pending entries per named queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(BrokerMetrics {
            registry,
            tasks_total,
            admission_rejections,
            workers_reaped,
            tasks_pending,
            tasks_in_progress,
            tasks_dead,
            task_processing_duration,
            workers_connected,
            queue_depth,
        })
    }

    /// Update queue depth metrics
    pub fn update_queue_depth(&self, stats: &BTreeMap<QueueName, QueueStats>) {
        for (queue, stats) in stats {
            self.queue_depth
                .with_label_values(&[queue.as_str()])
                .set(stats.pending as i64);
        }
    }

    /// Increment task counter
    pub fn inc_tasks_total(&self, status: &str, task_name: &str) {
        self.tasks_total
            .with_label_values(&[status, task_name])
            .inc();
    }

    pub fn inc_rejection(&self, reason: &str) {
        self.admission_rejections.with_label_values(&[reason]).inc();
    }

    /// Record task processing duration
    pub fn observe_processing_duration(&self, task_name: &str, duration_secs: f64) {
        self.task_processing_duration
            .with_label_values(&[task_name])
            .observe(duration_secs);
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        let metrics = BrokerMetrics::new().unwrap();
        metrics.inc_tasks_total("completed", "echo");
        metrics.inc_rejection("duplicate");
        let mut stats = BTreeMap::new();
        stats.insert(
            QueueName::new("urgent"),
            QueueStats {
                pending: 4,
                ..Default::default()
            },
        );
        metrics.update_queue_depth(&stats);

        let text = metrics.render().unwrap();
        assert!(text.contains("tq_tasks_total{status=\"completed\",task_name=\"echo\"} 1"));
        assert!(text.contains("tq_admission_rejections_total{reason=\"duplicate\"} 1"));
        assert!(text.contains("tq_queue_depth{queue=\"urgent\"} 4"));
    }
}
