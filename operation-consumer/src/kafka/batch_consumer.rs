use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{Consumer, MessageStream, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::batch_processor::BatchOutcome;
use crate::error::BatchError;
use crate::kafka::context::OperationConsumerContext;
use crate::kafka::partition_router::{shutdown_workers, PartitionRouter};
use crate::kafka::partition_worker::{FatalReceiver, PartitionWorkerConfig};
use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::metrics_consts::KAFKA_CONSUMER_ERRORS;
use crate::record::RawRecord;
use crate::types::PartitionKey;

/// Where partition workers deliver their batches.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Generation of the live assignment of `key`, `None` when not assigned.
    fn assignment_generation(&self, key: &PartitionKey) -> Option<u64>;

    /// Deliver records read while `key` was owned under `generation`. Batches
    /// of any other generation must be refused with `NotAssigned`.
    async fn deliver_batch(
        &self,
        records: Vec<RawRecord>,
        key: &PartitionKey,
        generation: u64,
    ) -> Result<BatchOutcome, BatchError>;
}

pub struct BatchConsumerConfig {
    pub topic: String,
    /// How many records to collect before routing a batch
    pub batch_size: usize,
    /// How long to wait for a full batch before routing what was collected
    pub batch_timeout: Duration,
    pub worker: PartitionWorkerConfig,
}

/// The stream loop: polls rdkafka, groups records per partition and hands
/// them to the partition workers.
pub struct BatchConsumer<S>
where
    S: BatchSink + RebalanceHandler + 'static,
{
    consumer: Arc<StreamConsumer<OperationConsumerContext>>,
    router: Arc<PartitionRouter<S>>,
    batch_size: usize,
    batch_timeout: Duration,
    fatal_rx: FatalReceiver,
    shutdown_rx: oneshot::Receiver<()>,
}

impl<S> BatchConsumer<S>
where
    S: BatchSink + RebalanceHandler + 'static,
{
    /// Attach `sink` to the consumer's rebalance callbacks and subscribe.
    pub fn new(
        consumer: Arc<StreamConsumer<OperationConsumerContext>>,
        sink: Arc<S>,
        config: BatchConsumerConfig,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<Self> {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let router = Arc::new(PartitionRouter::new(sink, fatal_tx, config.worker));

        if !consumer.context().attach(router.clone()) {
            return Err(anyhow!("Kafka consumer already has a rebalance handler"));
        }

        consumer
            .subscribe(&[config.topic.as_str()])
            .with_context(|| format!("Failed to subscribe to topic: {}", config.topic))?;

        Ok(Self {
            consumer,
            router,
            batch_size: config.batch_size.max(1),
            batch_timeout: config.batch_timeout,
            fatal_rx,
            shutdown_rx,
        })
    }

    pub fn router(&self) -> &Arc<PartitionRouter<S>> {
        &self.router
    }

    /// Consume until shutdown is signalled or a fatal error occurs.
    pub async fn start_consumption(mut self) -> Result<()> {
        info!("Starting batch Kafka message consumption...");

        let consumer = self.consumer.clone();
        let mut stream = consumer.stream();
        let mut batch_id = 0u64;

        let result = loop {
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    info!("Shutdown signal received, starting graceful shutdown");
                    break Ok(());
                }

                Some(fatal) = self.fatal_rx.recv() => {
                    error!("Stopping consumption after fatal batch error: {fatal:#}");
                    break Err(anyhow::Error::new(fatal).context("fatal error processing batch"));
                }

                batch = Self::consume_batch(&mut stream, self.batch_size, self.batch_timeout) => {
                    let batches = match batch {
                        Ok(batches) => batches,
                        // handle_kafka_error already logged and counted it
                        Err(e) => break Err(e.into()),
                    };
                    if batches.is_empty() {
                        continue;
                    }

                    for (key, e) in self.router.route_batches(batches, &mut batch_id).await {
                        warn!(
                            topic = key.topic(),
                            partition = key.partition_number(),
                            "Dropping batch: {e:#}"
                        );
                    }
                }
            }
        };

        info!("Batch consumer loop shutting down...");
        consumer.unsubscribe();
        shutdown_workers(self.router.shutdown_all()).await;
        info!("Graceful shutdown completed");

        result
    }

    /// Collect up to `batch_size` records or whatever arrives within
    /// `batch_timeout`, grouped by partition in arrival order.
    async fn consume_batch(
        stream: &mut MessageStream<'_, OperationConsumerContext>,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> KafkaResult<HashMap<PartitionKey, Vec<RawRecord>>> {
        let started = Instant::now();
        let deadline = tokio::time::sleep(batch_timeout);
        tokio::pin!(deadline);

        let mut batches: HashMap<PartitionKey, Vec<RawRecord>> = HashMap::new();
        let mut collected = 0;
        let mut kafka_error_count = 0u64;

        while collected < batch_size {
            tokio::select! {
                _ = &mut deadline => break,

                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        let key = PartitionKey::new(message.topic(), message.partition());
                        batches.entry(key).or_default().push(raw_record(&message));
                        collected += 1;
                        kafka_error_count = 0;
                    }
                    Some(Err(e)) => {
                        kafka_error_count += 1;
                        if let Some(fatal) = handle_kafka_error(e, kafka_error_count).await {
                            return Err(fatal);
                        }
                    }
                    None => break,
                },
            }
        }

        if collected > 0 {
            debug!(
                records = collected,
                partitions = batches.len(),
                elapsed_ms = started.elapsed().as_millis(),
                "Collected batch"
            );
        }
        Ok(batches)
    }
}

pub fn raw_record(message: &BorrowedMessage<'_>) -> RawRecord {
    match message.payload() {
        Some(payload) => RawRecord::at(message.offset(), payload),
        None => RawRecord::tombstone(Some(message.offset())),
    }
}

/// Classify a consumer error. Returns it back only when consumption must stop.
async fn handle_kafka_error(e: KafkaError, current_count: u64) -> Option<KafkaError> {
    match &e {
        KafkaError::MessageConsumption(code) => {
            match code {
                RDKafkaErrorCode::PartitionEOF => {
                    metrics::counter!(
                        KAFKA_CONSUMER_ERRORS,
                        &[("level", "info"), ("error", "partition_eof")]
                    )
                    .increment(1);
                }
                RDKafkaErrorCode::OperationTimedOut => {
                    metrics::counter!(
                        KAFKA_CONSUMER_ERRORS,
                        &[("level", "info"), ("error", "op_timed_out")]
                    )
                    .increment(1);
                }
                RDKafkaErrorCode::OffsetOutOfRange => {
                    warn!("Offset out of range - seeking to configured offset reset policy");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERRORS,
                        &[("level", "info"), ("error", "offset_out_of_range")]
                    )
                    .increment(1);
                    sleep(Duration::from_millis(500)).await;
                }
                _ => {
                    warn!("Kafka consumer error: {code:?}");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERRORS,
                        &[("level", "warn"), ("error", "consumer")]
                    )
                    .increment(1);
                    sleep(Duration::from_millis(100 * current_count.min(10))).await;
                }
            }
            None
        }

        KafkaError::MessageConsumptionFatal(code) => {
            error!("Fatal Kafka consumer error: {code:?}");
            metrics::counter!(
                KAFKA_CONSUMER_ERRORS,
                &[("level", "fatal"), ("error", "consumer")]
            )
            .increment(1);
            Some(e)
        }

        KafkaError::Global(code) => {
            match code {
                RDKafkaErrorCode::AllBrokersDown => {
                    warn!("All brokers down: {code:?} - waiting for reconnect");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERRORS,
                        &[("level", "warn"), ("error", "all_brokers_down")]
                    )
                    .increment(1);
                    sleep(Duration::from_secs(current_count.min(5))).await;
                }
                RDKafkaErrorCode::BrokerTransportFailure => {
                    warn!("Broker transport failure: {code:?} - waiting for reconnect");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERRORS,
                        &[("level", "warn"), ("error", "broker_transport")]
                    )
                    .increment(1);
                    sleep(Duration::from_secs(current_count.min(3))).await;
                }
                RDKafkaErrorCode::Authentication => {
                    error!("Authentication failed: {code:?}");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERRORS,
                        &[("level", "fatal"), ("error", "authentication")]
                    )
                    .increment(1);
                    return Some(e);
                }
                _ => {
                    warn!("Global Kafka error: {code:?}");
                    metrics::counter!(
                        KAFKA_CONSUMER_ERRORS,
                        &[("level", "warn"), ("error", "global")]
                    )
                    .increment(1);
                    sleep(Duration::from_millis(500 * current_count.min(6))).await;
                }
            }
            None
        }

        KafkaError::Canceled => {
            info!("Consumer canceled - shutting down");
            metrics::counter!(
                KAFKA_CONSUMER_ERRORS,
                &[("level", "info"), ("error", "canceled")]
            )
            .increment(1);
            Some(e)
        }

        _ => {
            error!("Unexpected Kafka error: {e:?}");
            metrics::counter!(
                KAFKA_CONSUMER_ERRORS,
                &[("level", "warn"), ("error", "unexpected")]
            )
            .increment(1);
            sleep(Duration::from_millis(100 * current_count.min(10))).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transient_errors_are_absorbed() {
        let eof = KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF);
        assert!(handle_kafka_error(eof, 1).await.is_none());

        let down = KafkaError::Global(RDKafkaErrorCode::AllBrokersDown);
        assert!(handle_kafka_error(down, 0).await.is_none());

        let transport = KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure);
        assert!(handle_kafka_error(transport, 0).await.is_none());
    }

    #[tokio::test]
    async fn test_fatal_errors_stop_consumption() {
        let fatal = KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fail);
        assert!(handle_kafka_error(fatal, 1).await.is_some());

        let auth = KafkaError::Global(RDKafkaErrorCode::Authentication);
        assert!(handle_kafka_error(auth, 1).await.is_some());

        assert!(handle_kafka_error(KafkaError::Canceled, 1).await.is_some());
    }
}
