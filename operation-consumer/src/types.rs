use std::fmt;

use rdkafka::topic_partition_list::TopicPartitionListElem;

/// Identity of one owned partition. Stable for the lifetime of an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    topic: String,
    partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

impl From<TopicPartitionListElem<'_>> for PartitionKey {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// The unit persisted to the group's offset store.
///
/// `offset` is the watermark: the highest offset for which every offset at or
/// below it has been processed. Broker adapters translate this to whatever
/// convention their offset store uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgressRecord {
    partition_key: PartitionKey,
    offset: i64,
}

impl ProgressRecord {
    pub fn new(partition_key: PartitionKey, offset: i64) -> Self {
        Self {
            partition_key,
            offset,
        }
    }

    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    pub fn topic(&self) -> &str {
        self.partition_key.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_key.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// A partition handed to us by the coordinator, with the position it told us
/// to resume from when that is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionAssignment {
    partition_key: PartitionKey,
    /// Last committed watermark, i.e. the offset just before the first record
    /// we expect to see.
    committed: Option<i64>,
}

impl PartitionAssignment {
    pub fn new(partition_key: PartitionKey, committed: Option<i64>) -> Self {
        Self {
            partition_key,
            committed,
        }
    }

    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    pub fn committed(&self) -> Option<i64> {
        self.committed
    }
}

impl From<PartitionKey> for PartitionAssignment {
    fn from(partition_key: PartitionKey) -> Self {
        Self::new(partition_key, None)
    }
}
