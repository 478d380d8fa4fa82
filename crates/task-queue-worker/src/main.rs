use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use task_queue_broker::{api::create_rest_api, Broker, BrokerMetrics};
use task_queue_worker::{register_demo_handlers, NodeConfig, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tq-node")]
#[command(about = "Task queue node: broker, worker pool and HTTP API", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Host to bind the HTTP listeners to
    #[arg(long)]
    host: Option<String>,

    /// REST API port
    #[arg(long)]
    rest_port: Option<u16>,

    /// Prometheus metrics port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Worker ID prefix (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Number of workers; 0 runs the broker only
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,

    /// Queues the workers claim from (repeatable; all when omitted)
    #[arg(short, long = "queue")]
    queues: Vec<String>,

    /// Enable the task journal in this directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Also write JSON logs to daily files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        NodeConfig::from_file(config_path)?
    } else {
        NodeConfig::default()
    };
    apply_overrides(&mut config, args);

    let _log_guard = init_tracing(&config);

    let run_workers = config.worker.concurrency > 0;
    if run_workers {
        config.validate()?;
    } else {
        config.broker.validate()?;
    }

    info!("Starting tq-node");
    info!("Configuration: {:?}", config);

    let broker = Arc::new(Broker::new(config.broker.clone())?);
    register_demo_handlers(&broker);
    let monitors = broker.start_monitors();

    let pool = run_workers.then(|| WorkerPool::start(broker.clone(), &config.worker));

    let shutdown = CancellationToken::new();

    let rest_addr = format!("{}:{}", config.broker.api.host, config.broker.api.rest_port);
    let rest_handle = {
        let app = create_rest_api(broker.clone());
        let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
        info!("REST API listening on {}", rest_addr);
        tokio::spawn(serve(listener, app, shutdown.clone()))
    };

    let metrics_addr = format!(
        "{}:{}",
        config.broker.api.host, config.broker.monitoring.prometheus_port
    );
    let metrics_handle = {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(broker.metrics());
        let listener = tokio::net::TcpListener::bind(&metrics_addr).await?;
        info!("Metrics server listening on {}", metrics_addr);
        tokio::spawn(serve(listener, app, shutdown.clone()))
    };

    info!("tq-node started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    if let Some(pool) = pool {
        let aborted = pool.stop().await;
        if aborted > 0 {
            error!("{} workers did not finish before the shutdown timeout", aborted);
        }
    }
    shutdown.cancel();
    monitors.stop().await;
    let _ = rest_handle.await;
    let _ = metrics_handle.await;

    broker.sync()?;
    info!("tq-node stopped");
    Ok(())
}

fn apply_overrides(config: &mut NodeConfig, args: Args) {
    if let Some(host) = args.host {
        config.broker.api.host = host;
    }
    if let Some(port) = args.rest_port {
        config.broker.api.rest_port = port;
    }
    if let Some(port) = args.metrics_port {
        config.broker.monitoring.prometheus_port = port;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker.worker_id = Some(worker_id);
    }
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }
    if !args.queues.is_empty() {
        config.worker.queues = args.queues;
    }
    if let Some(dir) = args.data_dir {
        config.broker.persistence.enabled = true;
        config.broker.persistence.data_dir = dir;
    }
    if let Some(level) = args.log_level {
        config.broker.monitoring.log_level = level;
    }
    if let Some(dir) = args.log_dir {
        config.broker.monitoring.log_dir = Some(dir);
    }
}

fn init_tracing(config: &NodeConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.broker.monitoring.log_level.clone().into());

    let (file_layer, guard) = match &config.broker.monitoring.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tq-node.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

async fn serve(listener: tokio::net::TcpListener, app: Router, shutdown: CancellationToken) {
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        error!("HTTP server error: {}", e);
    }
}

async fn metrics_handler(State(metrics): State<Arc<BrokerMetrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
