pub mod batch_consumer;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod partition_router;
pub mod partition_worker;
pub mod rebalance_handler;

pub use batch_consumer::{BatchConsumer, BatchConsumerConfig, BatchSink};
pub use config::ConsumerConfigBuilder;
pub use context::OperationConsumerContext;
pub use coordinator::KafkaCoordinator;
pub use rebalance_handler::RebalanceHandler;
