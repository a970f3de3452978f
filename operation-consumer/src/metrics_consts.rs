// ==== Record intake metrics ====
/// Counter for raw records received, labelled by topic
pub const RECORDS_RECEIVED: &str = "operation_consumer_records_received_total";

/// Counter for records dropped because their payload was not structured data
pub const RECORDS_SOFT_DECODE_FAILED: &str = "operation_consumer_records_soft_decode_failed_total";

/// Counter for batches rejected, labelled by reason (decode, validation, not_assigned)
pub const BATCHES_REJECTED: &str = "operation_consumer_batches_rejected_total";

/// Histogram for end-to-end batch processing time
pub const BATCH_PROCESSING_DURATION: &str = "operation_consumer_batch_processing_duration_seconds";

/// Histogram for the number of records per delivered batch
pub const BATCH_SIZE: &str = "operation_consumer_batch_size";

// ==== Dispatch metrics ====
/// Counter for handler outcomes, labelled by status (success, failed, timed_out, panicked, rejected)
pub const HANDLER_OUTCOMES: &str = "operation_consumer_handler_outcomes_total";

/// Histogram for handler invocation time
pub const HANDLER_DURATION: &str = "operation_consumer_handler_duration_seconds";

/// Gauge for tasks currently executing in the dispatch queue
pub const DISPATCH_RUNNING: &str = "operation_consumer_dispatch_running";

/// Gauge for tasks waiting for a free dispatch slot
pub const DISPATCH_PENDING: &str = "operation_consumer_dispatch_pending";

// ==== Progress metrics ====
/// Counter for commit requests, labelled by status (success, failure, skipped_revoked)
pub const OFFSET_COMMITS: &str = "operation_consumer_offset_commits_total";

/// Gauge for the last committed watermark per partition
pub const PARTITION_COMMITTED_WATERMARK: &str = "operation_consumer_partition_committed_watermark";

/// Gauge for completions held back behind an unresolved offset, per partition
pub const PARTITION_PENDING_CONFIRMATIONS: &str =
    "operation_consumer_partition_pending_confirmations";

/// Counter for batches that finished with the partition watermark stalled on a failed offset
pub const PARTITION_STALLED: &str = "operation_consumer_partition_stalled_total";

/// Counter for task results discarded because their partition was revoked
pub const RESULTS_DISCARDED_REVOKED: &str = "operation_consumer_results_discarded_revoked_total";

// ==== Broker adapter metrics ====
/// Counter for Kafka errors observed by the stream loop, labelled by level and error
pub const KAFKA_CONSUMER_ERRORS: &str = "operation_consumer_kafka_errors_total";

/// Counter for rebalance callbacks, labelled by kind (assign, revoke)
pub const REBALANCE_EVENTS: &str = "operation_consumer_rebalance_events_total";
