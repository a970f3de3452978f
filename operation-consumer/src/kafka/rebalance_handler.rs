use crate::types::{PartitionAssignment, PartitionKey};

/// Reacts to partition ownership changes.
///
/// Both methods run synchronously inside librdkafka's rebalance callbacks,
/// before the consumer stream resumes, so they must be fast and must not block:
///
/// ```text
/// pre_rebalance(Revoke)   ─► on_partitions_revoked()   trackers discarded,
///                                                      in-flight results dropped
/// post_rebalance(Assign)  ─► on_partitions_assigned()  trackers created before
///                                                      the first batch arrives
/// ```
///
/// A partition revoked and immediately re-assigned gets a fresh tracker with a
/// new generation. Late results and still-queued batches of the previous
/// generation are refused before they reach it.
pub trait RebalanceHandler: Send + Sync {
    fn on_partitions_assigned(&self, partitions: &[PartitionAssignment]);

    fn on_partitions_revoked(&self, partitions: &[PartitionKey]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestRebalanceHandler;

    #[test]
    fn test_rebalance_handler_records_calls() {
        let handler = TestRebalanceHandler::default();
        let keys = vec![
            PartitionKey::new("operations", 0),
            PartitionKey::new("operations", 1),
        ];
        let assignments: Vec<PartitionAssignment> =
            keys.iter().cloned().map(PartitionAssignment::from).collect();

        handler.on_partitions_assigned(&assignments);
        handler.on_partitions_revoked(&keys[..1]);

        assert_eq!(*handler.assigned.lock().unwrap(), keys);
        assert_eq!(*handler.revoked.lock().unwrap(), vec![keys[0].clone()]);
    }
}
