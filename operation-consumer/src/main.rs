use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use operation_consumer::config::Config;
use operation_consumer::handler::handler_fn;
use operation_consumer::metrics_server::{serve, setup_metrics_recorder, setup_metrics_router};
use operation_consumer::operation::Operation;
use operation_consumer::service::OperationConsumerService;

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let handle = setup_metrics_recorder().context("Failed to install metrics recorder")?;
    let router = setup_metrics_router(handle);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Metrics server on {bind} stopped: {e}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting operation consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let handler = handler_fn(|operation: Operation<Value>| async move {
        info!(kind = %operation.kind, payload = %operation.payload, "Received operation");
        Ok::<(), anyhow::Error>(())
    });

    let service = OperationConsumerService::new(config, Arc::new(handler))
        .context("Failed to create operation consumer. Check your Kafka connection settings.")?;

    service.run().await?;

    server_handle.abort();

    Ok(())
}
