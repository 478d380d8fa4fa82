use crate::{config::WorkerConfig, executor::TaskExecutor};
use task_queue_broker::{Broker, ClaimedTask};
use task_queue_core::QueueName;

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// CPU and memory of this process, reported with every heartbeat
pub struct ResourceSampler {
    system: Mutex<System>,
    pid: Pid,
}

impl ResourceSampler {
    pub fn new() -> Self {
        ResourceSampler {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// (cpu percent, resident memory in MB)
    pub fn sample(&self) -> (f32, u64) {
        let mut sys = self.system.lock();
        sys.refresh_all();
        match sys.process(self.pid) {
            Some(process) => (process.cpu_usage(), process.memory() / 1024 / 1024),
            None => (0.0, 0),
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// A single execution unit: claims one task at a time, runs it and reports
/// the outcome with the claim's lease.
pub struct Worker {
    worker_id: String,
    broker: Arc<Broker>,
    executor: TaskExecutor,
    queues: Vec<QueueName>,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    sampler: Arc<ResourceSampler>,
    active_tasks: Arc<RwLock<usize>>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(worker_id: impl Into<String>, broker: Arc<Broker>, config: &WorkerConfig) -> Self {
        Worker {
            worker_id: worker_id.into(),
            executor: TaskExecutor::new(broker.clone()),
            broker,
            queues: config.queue_names(),
            heartbeat_interval: config.heartbeat_interval(),
            poll_interval: config.poll_interval(),
            sampler: Arc::new(ResourceSampler::new()),
            active_tasks: Arc::new(RwLock::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    fn with_shared(
        mut self,
        sampler: Arc<ResourceSampler>,
        active_tasks: Arc<RwLock<usize>>,
        shutdown: CancellationToken,
    ) -> Self {
        self.sampler = sampler;
        self.active_tasks = active_tasks;
        self.shutdown = shutdown;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Token that stops this worker after its current task
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shut down. A task in progress is always finished and
    /// reported; the worker deregisters on the way out.
    pub async fn run(&self) {
        info!(
            "Starting worker {} (queues: {})",
            self.worker_id,
            if self.queues.is_empty() {
                "all".to_string()
            } else {
                self.queues
                    .iter()
                    .map(QueueName::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        );

        // Heartbeats continue while a task drains after shutdown
        let heartbeat_stop = CancellationToken::new();
        let _heartbeat_guard = heartbeat_stop.clone().drop_guard();
        let heartbeat = self.spawn_heartbeat(heartbeat_stop.clone());

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if !self.process_next().await {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        heartbeat_stop.cancel();
        let _ = heartbeat.await;
        self.broker.deregister_worker(&self.worker_id);
        info!("Worker {} stopped", self.worker_id);
    }

    /// Claim and run one task. Returns false when nothing was claimable.
    pub async fn process_next(&self) -> bool {
        match self.broker.claim_from(&self.worker_id, &self.queues) {
            Some(claimed) => {
                self.execute_task(claimed).await;
                true
            }
            None => false,
        }
    }

    async fn execute_task(&self, claimed: ClaimedTask) {
        let ClaimedTask { task, lease } = claimed;
        *self.active_tasks.write() += 1;

        info!(
            "Worker {} executing task {} ({}), attempt {}",
            self.worker_id, task.id, task.name, lease.attempt
        );

        let reported = match self.executor.execute(&task).await {
            Ok(result) => self.broker.complete(&lease, result),
            Err(error) => {
                warn!("Task {} failed: {}", task.id, error);
                self.broker.fail(&lease, error)
            }
        };
        match reported {
            Ok(true) => {}
            Ok(false) => debug!(
                "Report for task {} was discarded; the attempt is no longer current",
                task.id
            ),
            Err(e) => error!("Failed to report task {}: {}", task.id, e),
        }

        let mut active = self.active_tasks.write();
        *active = active.saturating_sub(1);
    }

    fn spawn_heartbeat(&self, stop: CancellationToken) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let worker_id = self.worker_id.clone();
        let sampler = self.sampler.clone();
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let sampler = sampler.clone();
                        let (cpu, memory) = tokio::task::spawn_blocking(move || sampler.sample())
                            .await
                            .unwrap_or((0.0, 0));
                        broker.heartbeat(&worker_id, cpu, memory);
                    }
                }
            }
        })
    }
}

/// `concurrency` workers sharing one shutdown token
pub struct WorkerPool {
    worker_ids: Vec<String>,
    handles: Vec<JoinHandle<()>>,
    active_tasks: Arc<RwLock<usize>>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawn the workers on the current runtime
    pub fn start(broker: Arc<Broker>, config: &WorkerConfig) -> Self {
        let base_id = config.generate_worker_id();
        let sampler = Arc::new(ResourceSampler::new());
        let active_tasks = Arc::new(RwLock::new(0));
        let shutdown = CancellationToken::new();

        let mut worker_ids = Vec::with_capacity(config.concurrency);
        let mut handles = Vec::with_capacity(config.concurrency);
        for i in 0..config.concurrency {
            let worker_id = format!("{}-{}", base_id, i);
            let worker = Worker::new(worker_id.clone(), broker.clone(), config).with_shared(
                sampler.clone(),
                active_tasks.clone(),
                shutdown.clone(),
            );
            handles.push(tokio::spawn(async move { worker.run().await }));
            worker_ids.push(worker_id);
        }

        info!(
            "Started {} workers (registered task names: {:?})",
            worker_ids.len(),
            broker.handlers().task_names()
        );

        WorkerPool {
            worker_ids,
            handles,
            active_tasks,
            shutdown,
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    /// Number of tasks being executed right now
    pub fn active_tasks(&self) -> usize {
        *self.active_tasks.read()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop claiming and wait for running tasks to finish.
    ///
    /// Workers still busy after the shutdown timeout are aborted; the broker
    /// releases their tasks once their heartbeats stop. Returns how many
    /// workers were aborted.
    pub async fn stop(mut self) -> usize {
        info!("Waiting for active tasks to complete...");
        self.shutdown.cancel();

        let drained = tokio::time::timeout(
            self.shutdown_timeout,
            futures::future::join_all(self.handles.iter_mut()),
        )
        .await;

        if drained.is_ok() {
            info!("All tasks completed, shutting down");
            return 0;
        }

        let mut aborted = 0;
        for handle in &self.handles {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        warn!(
            "Shutdown deadline exceeded, aborted {} workers ({} tasks still active)",
            aborted,
            self.active_tasks()
        );
        aborted
    }
}
