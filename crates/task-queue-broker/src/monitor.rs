//! Periodic background sweeps.
//!
//! Each sweep is its own tokio task on a fixed interval. All of them stop
//! when the shared cancellation token fires.

use crate::Broker;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Handle on the running monitors
pub struct MonitorHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Ask every monitor to stop after its current tick
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the monitors and wait for them to exit
    pub async fn stop(self) {
        self.token.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Monitors stopped");
    }
}

fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    broker: Arc<Broker>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(&Broker) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("Monitor '{}' started ({:?})", name, period);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    // A panicking sweep must not end the loop
                    if panic::catch_unwind(AssertUnwindSafe(|| tick(&broker))).is_err() {
                        error!("Monitor '{}' tick panicked", name);
                    }
                }
            }
        }
        debug!("Monitor '{}' stopped", name);
    })
}

/// Start the health, timeout, dead-letter, delay and housekeeping loops
pub fn spawn_monitors(broker: Arc<Broker>) -> MonitorHandle {
    let token = CancellationToken::new();
    let m = broker.config().monitors.clone();
    let ms = Duration::from_millis;

    let tasks = vec![
        spawn_periodic(
            "worker-health",
            ms(m.health_check_interval_ms),
            token.clone(),
            broker.clone(),
            |b| {
                b.reap_dead_workers();
            },
        ),
        spawn_periodic(
            "task-timeout",
            ms(m.timeout_check_interval_ms),
            token.clone(),
            broker.clone(),
            |b| {
                b.sweep_timeouts();
            },
        ),
        spawn_periodic(
            "dead-letter",
            ms(m.dead_letter_interval_ms),
            token.clone(),
            broker.clone(),
            |b| {
                b.sweep_dead_letters();
            },
        ),
        spawn_periodic(
            "delay-promotion",
            ms(m.delay_tick_ms),
            token.clone(),
            broker.clone(),
            |b| {
                b.promote_due_tasks();
            },
        ),
        spawn_periodic(
            "housekeeping",
            ms(m.housekeeping_interval_ms),
            token.clone(),
            broker,
            Broker::housekeeping,
        ),
    ];

    info!("Started {} broker monitors", tasks.len());
    MonitorHandle { token, tasks }
}
