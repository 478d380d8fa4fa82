pub mod config;
pub mod executor;
pub mod handler;
pub mod worker;

pub use config::{NodeConfig, WorkerConfig};
pub use executor::TaskExecutor;
pub use handler::register_demo_handlers;
pub use worker::{ResourceSampler, Worker, WorkerPool};
