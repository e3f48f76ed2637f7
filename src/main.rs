use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use courier_queue::config::ServiceConfig;
use courier_queue::error::{is_unrecoverable_io, QueueError};
use courier_queue::queue::JobKind;
use courier_queue::service::Service;
use courier_queue::shutdown::install_shutdown_handler;
use courier_queue::worker::{EmailExecutor, ExecutorRegistry, LogMailer};

#[derive(Parser, Debug)]
#[command(name = "courier-queue")]
#[command(about = "In-process asynchronous job queue with an HTTP submission API")]
struct Args {
    /// HTTP listen port (overrides the PORT environment variable)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let args = Args::parse();
    let mut config = ServiceConfig::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }

    tracing::info!(
        port = config.port,
        pool_size = config.worker_pool_size,
        queue_max = config.queue_max_size,
        max_attempts = config.max_job_attempts,
        "Starting courier-queue"
    );

    let mut registry = ExecutorRegistry::new();
    registry.register(
        JobKind::SendEmail,
        Arc::new(EmailExecutor::new(Arc::new(LogMailer))),
    );

    let shutdown = install_shutdown_handler();

    let service = match Service::start(config, Arc::new(registry)).await {
        Ok(service) => service,
        Err(err) => {
            tracing::error!(error = %err, "Failed to start service");
            std::process::exit(1);
        }
    };

    match service.run(shutdown).await {
        Ok(outcome) => std::process::exit(outcome.exit_code()),
        Err(err) => {
            if let QueueError::Io(io_err) = &err {
                if is_unrecoverable_io(io_err) {
                    tracing::error!(error = %err, "Unrecoverable IO error");
                    std::process::exit(1);
                }
            }
            tracing::error!(error = %err, "Service failed");
            std::process::exit(1);
        }
    }
}
