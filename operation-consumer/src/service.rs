use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rdkafka::consumer::StreamConsumer;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::consumer::OperationConsumer;
use crate::handler::OperationHandler;
use crate::kafka::batch_consumer::BatchConsumer;
use crate::kafka::context::OperationConsumerContext;
use crate::kafka::coordinator::KafkaCoordinator;

pub type KafkaOperationConsumer<T, H> = OperationConsumer<T, H, KafkaCoordinator>;

/// The operation consumer wired to Kafka, built from [`Config`].
pub struct OperationConsumerService<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: OperationHandler<T> + 'static,
{
    config: Config,
    consumer: Arc<KafkaOperationConsumer<T, H>>,
    batch_consumer: Option<BatchConsumer<KafkaOperationConsumer<T, H>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl<T, H> OperationConsumerService<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: OperationHandler<T> + 'static,
{
    /// Validate `config`, create the Kafka consumer and subscribe.
    /// Must be called within a Tokio runtime.
    pub fn new(config: Config, handler: Arc<H>) -> Result<Self> {
        config.validate()?;

        let kafka_consumer: StreamConsumer<OperationConsumerContext> = config
            .to_client_config()
            .create_with_context(OperationConsumerContext::new())
            .context("Failed to create Kafka consumer")?;
        let kafka_consumer = Arc::new(kafka_consumer);

        let coordinator = Arc::new(KafkaCoordinator::new(kafka_consumer.clone()));
        let consumer = Arc::new(OperationConsumer::new(
            handler,
            coordinator,
            config.to_batch_processor_config(),
        ));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let batch_consumer = BatchConsumer::new(
            kafka_consumer,
            consumer.clone(),
            config.to_batch_consumer_config(),
            shutdown_rx,
        )?;

        info!(
            topic = %config.kafka_consumer_topic,
            group = %config.kafka_consumer_group,
            concurrency = config.concurrency,
            "Operation consumer created"
        );

        Ok(Self {
            config,
            consumer,
            batch_consumer: Some(batch_consumer),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn consumer(&self) -> &Arc<KafkaOperationConsumer<T, H>> {
        &self.consumer
    }

    /// Run until ctrl-c.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c signal: {e}");
            }
        })
        .await
    }

    /// Run until `shutdown_signal` resolves or consumption fails.
    pub async fn run_with_shutdown(
        mut self,
        shutdown_signal: impl Future<Output = ()>,
    ) -> Result<()> {
        let batch_consumer = self
            .batch_consumer
            .take()
            .ok_or_else(|| anyhow!("Operation consumer already started"))?;

        info!("Starting operation consumer service");
        let mut consumer_handle =
            tokio::spawn(async move { batch_consumer.start_consumption().await });

        let finished = tokio::select! {
            _ = shutdown_signal => {
                info!("Received shutdown signal, shutting down gracefully...");
                None
            }
            result = &mut consumer_handle => Some(result),
        };

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            if shutdown_tx.send(()).is_err() {
                info!("Consumer loop already stopped");
            }
        }

        let shutdown_timeout = self.config.shutdown_timeout();
        let result = match finished {
            Some(result) => result,
            None => match tokio::time::timeout(shutdown_timeout, consumer_handle).await {
                Ok(result) => result,
                Err(_) => {
                    error!("Consumer shutdown timed out after {shutdown_timeout:?}");
                    Ok(Err(anyhow!("consumer shutdown timed out")))
                }
            },
        };

        if tokio::time::timeout(shutdown_timeout, self.consumer.shutdown())
            .await
            .is_err()
        {
            warn!("Handlers still running after {shutdown_timeout:?}, abandoning them");
        }

        match result {
            Ok(Ok(())) => {
                info!("Operation consumer service stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Consumer stopped with error: {e:#}");
                Err(e)
            }
            Err(e) => {
                error!("Consumer task panicked: {e:#}");
                Err(anyhow!("consumer task failed: {e}"))
            }
        }
    }
}

/// A service started by [`create_receive`].
pub struct RunningService {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<()>>,
}

impl RunningService {
    /// Ask the service to stop and wait for it.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            if shutdown_tx.send(()).is_err() {
                info!("Service already stopped");
            }
        }
        self.join().await
    }

    /// Wait for the service to stop on its own.
    pub async fn join(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| anyhow!("service task failed: {e}"))?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Validate `config`, subscribe and start delivering operations to `handler`.
pub fn create_receive<T, H>(config: Config, handler: H) -> Result<RunningService>
where
    T: DeserializeOwned + Send + 'static,
    H: OperationHandler<T> + 'static,
{
    let service = OperationConsumerService::new(config, Arc::new(handler))?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(service.run_with_shutdown(async move {
        if shutdown_rx.await.is_err() {
            info!("Service handle dropped, shutting down");
        }
    }));

    Ok(RunningService {
        shutdown_tx: Some(shutdown_tx),
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::operation::Operation;
    use envconfig::Envconfig;
    use serde_json::Value;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_create_receive_rejects_invalid_config() {
        let env: HashMap<String, String> =
            [("KAFKA_CONSUMER_TOPIC".to_string(), String::new())].into();
        let config = Config::init_from_hashmap(&env).unwrap();
        let handler = handler_fn(|_op: Operation<Value>| async { Ok::<(), anyhow::Error>(()) });

        let err = create_receive::<Value, _>(config, handler).err().unwrap();
        assert!(err.to_string().contains("KAFKA_CONSUMER_TOPIC"));
    }
}
