pub mod admission;
pub mod api;
pub mod broker;
pub mod config;
pub mod handler;
pub mod metrics;
pub mod monitor;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod worker_registry;

pub use broker::{Broker, ClaimedTask, Lease};
pub use config::BrokerConfig;
pub use handler::{handler_fn, TaskContext, TaskHandler, TaskHandlerRegistry, TaskResult};
pub use metrics::BrokerMetrics;
pub use monitor::MonitorHandle;
pub use queue::MemoryBackend;
