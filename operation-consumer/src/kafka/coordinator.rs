use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};
use tracing::debug;

use crate::coordinator::GroupCoordinator;
use crate::error::CommitError;
use crate::kafka::context::OperationConsumerContext;
use crate::types::ProgressRecord;

/// Commits watermarks to the consumer group through rdkafka.
///
/// Kafka stores the next offset to consume, so a watermark `w` is committed
/// as `w + 1`.
pub struct KafkaCoordinator {
    consumer: Arc<StreamConsumer<OperationConsumerContext>>,
}

impl KafkaCoordinator {
    pub fn new(consumer: Arc<StreamConsumer<OperationConsumerContext>>) -> Self {
        Self { consumer }
    }
}

pub fn commit_list(progress: &ProgressRecord) -> Result<TopicPartitionList, CommitError> {
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(
        progress.topic(),
        progress.partition_number(),
        Offset::Offset(progress.offset() + 1),
    )?;
    Ok(list)
}

#[async_trait]
impl GroupCoordinator for KafkaCoordinator {
    async fn commit_offset(&self, progress: ProgressRecord) -> Result<(), CommitError> {
        let list = commit_list(&progress)?;
        let consumer = self.consumer.clone();

        // synchronous commit so the watermark is only marked once the broker has it
        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await
            .map_err(|e| CommitError::Unavailable(format!("commit task failed: {e}")))??;

        debug!(
            topic = progress.topic(),
            partition = progress.partition_number(),
            offset = progress.offset() + 1,
            "Committed next offset to consumer group"
        );
        Ok(())
    }
}
