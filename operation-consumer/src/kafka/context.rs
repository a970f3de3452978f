use std::sync::{Arc, OnceLock};

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::kafka::rebalance_handler::RebalanceHandler;
use crate::metrics_consts::REBALANCE_EVENTS;
use crate::types::{PartitionAssignment, PartitionKey};

/// rdkafka context forwarding rebalances to a [`RebalanceHandler`].
///
/// The handler is attached after the consumer exists, since the handler in
/// turn needs the consumer to commit through. Rebalances observed before a
/// handler is attached are logged and dropped; attach before subscribing.
#[derive(Default)]
pub struct OperationConsumerContext {
    handler: OnceLock<Arc<dyn RebalanceHandler>>,
}

impl OperationConsumerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(handler: Arc<dyn RebalanceHandler>) -> Self {
        let context = Self::new();
        context.attach(handler);
        context
    }

    /// Attach the rebalance handler. Only the first call has any effect.
    pub fn attach(&self, handler: Arc<dyn RebalanceHandler>) -> bool {
        let attached = self.handler.set(handler).is_ok();
        if !attached {
            warn!("Rebalance handler already attached, ignoring");
        }
        attached
    }

    fn handler(&self) -> Option<&Arc<dyn RebalanceHandler>> {
        let handler = self.handler.get();
        if handler.is_none() {
            error!("Rebalance received before a handler was attached");
        }
        handler
    }

    pub(crate) fn revoke(&self, partitions: &TopicPartitionList) {
        if partitions.count() == 0 {
            debug!("Skipping empty revoke rebalance");
            return;
        }

        let keys = partition_keys(partitions);
        info!(partitions = keys.len(), "Revoking partitions");
        metrics::counter!(REBALANCE_EVENTS, "kind" => "revoke").increment(1);

        if let Some(handler) = self.handler() {
            handler.on_partitions_revoked(&keys);
        }
    }

    pub(crate) fn assign(&self, partitions: &TopicPartitionList) {
        if partitions.count() == 0 {
            debug!("Skipping empty assign rebalance");
            return;
        }

        let assignments = partition_assignments(partitions);
        info!(partitions = assignments.len(), "Assigning partitions");
        metrics::counter!(REBALANCE_EVENTS, "kind" => "assign").increment(1);

        if let Some(handler) = self.handler() {
            handler.on_partitions_assigned(&assignments);
        }
    }
}

/// Kafka positions name the next offset to consume; the core tracks the last
/// one processed. Anything but a concrete offset means "not known yet".
pub fn committed_watermark(offset: Offset) -> Option<i64> {
    match offset {
        Offset::Offset(next) => Some(next - 1),
        _ => None,
    }
}

fn partition_keys(partitions: &TopicPartitionList) -> Vec<PartitionKey> {
    partitions
        .elements()
        .into_iter()
        .map(PartitionKey::from)
        .collect()
}

fn partition_assignments(partitions: &TopicPartitionList) -> Vec<PartitionAssignment> {
    partitions
        .elements()
        .into_iter()
        .map(|elem| {
            let committed = committed_watermark(elem.offset());
            PartitionAssignment::new(PartitionKey::from(elem), committed)
        })
        .collect()
}

impl ClientContext for OperationConsumerContext {}

impl ConsumerContext for OperationConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.revoke(partitions),
            Rebalance::Assign(partitions) => {
                debug!(partitions = partitions.count(), "Pre-rebalance assign event");
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {e}");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => self.assign(partitions),
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {e}");
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "Committed offsets"),
            Err(e) => warn!("Failed to commit offsets: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestRebalanceHandler;

    fn partition_list(offsets: &[(i32, Offset)]) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        for (partition, offset) in offsets {
            list.add_partition_offset("operations", *partition, *offset)
                .unwrap();
        }
        list
    }

    #[test]
    fn test_committed_watermark_translation() {
        assert_eq!(committed_watermark(Offset::Offset(10)), Some(9));
        assert_eq!(committed_watermark(Offset::Offset(0)), Some(-1));
        assert_eq!(committed_watermark(Offset::Invalid), None);
        assert_eq!(committed_watermark(Offset::Stored), None);
        assert_eq!(committed_watermark(Offset::Beginning), None);
    }

    #[test]
    fn test_assign_forwards_positions() {
        let handler = Arc::new(TestRebalanceHandler::default());
        let context = OperationConsumerContext::with_handler(handler.clone());

        context.assign(&partition_list(&[
            (0, Offset::Offset(42)),
            (1, Offset::Invalid),
        ]));

        let assignments = handler.assignments.lock().unwrap();
        assert_eq!(
            *assignments,
            vec![
                PartitionAssignment::new(PartitionKey::new("operations", 0), Some(41)),
                PartitionAssignment::new(PartitionKey::new("operations", 1), None),
            ]
        );
    }

    #[test]
    fn test_revoke_forwards_keys_and_skips_empty() {
        let handler = Arc::new(TestRebalanceHandler::default());
        let context = OperationConsumerContext::with_handler(handler.clone());

        context.revoke(&TopicPartitionList::new());
        assert!(handler.revoked.lock().unwrap().is_empty());

        context.revoke(&partition_list(&[(3, Offset::Invalid)]));
        assert_eq!(
            *handler.revoked.lock().unwrap(),
            vec![PartitionKey::new("operations", 3)]
        );
    }

    #[test]
    fn test_handler_attaches_once() {
        let context = OperationConsumerContext::new();
        assert!(context.attach(Arc::new(TestRebalanceHandler::default())));
        assert!(!context.attach(Arc::new(TestRebalanceHandler::default())));
    }

    #[test]
    fn test_rebalance_without_handler_is_dropped() {
        let context = OperationConsumerContext::new();
        context.assign(&partition_list(&[(0, Offset::Invalid)]));
        context.revoke(&partition_list(&[(0, Offset::Invalid)]));
    }
}
