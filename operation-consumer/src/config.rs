use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use thiserror::Error;

use crate::batch_processor::BatchProcessorConfig;
use crate::dispatch_queue::DispatchQueueConfig;
use crate::kafka::batch_consumer::BatchConsumerConfig;
use crate::kafka::config::ConsumerConfigBuilder;
use crate::kafka::partition_worker::PartitionWorkerConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "operation-consumer")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "operations")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    pub kafka_tls_ca_location: Option<String>,

    pub kafka_tls_certificate_location: Option<String>,

    pub kafka_tls_key_location: Option<String>,

    pub kafka_tls_key_password: Option<String>,

    #[envconfig(default = "30000")]
    pub kafka_session_timeout_ms: u64,

    #[envconfig(default = "25000")]
    pub kafka_heartbeat_interval_ms: u64,

    // Dispatch configuration
    #[envconfig(default = "8")]
    pub concurrency: usize,

    /// 0 leaves the dispatch queue unbounded
    #[envconfig(default = "0")]
    pub max_queue_depth: usize,

    pub handler_timeout_ms: Option<EnvMsDuration>,

    // Batching
    #[envconfig(default = "500")]
    pub batch_size: usize,

    #[envconfig(default = "100")]
    pub batch_timeout_ms: EnvMsDuration,

    #[envconfig(default = "10")]
    pub partition_channel_capacity: usize,

    #[envconfig(default = "30000")]
    pub shutdown_timeout_ms: EnvMsDuration,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Env(#[from] envconfig::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Read and validate configuration from the environment.
    pub fn init_with_defaults() -> Result<Self, ConfigError> {
        let config = Config::init_from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency < 1 {
            return Err(ConfigError::Invalid("CONCURRENCY must be at least 1".to_string()));
        }
        for (name, value) in [
            ("KAFKA_HOSTS", &self.kafka_hosts),
            ("KAFKA_CONSUMER_GROUP", &self.kafka_consumer_group),
            ("KAFKA_CONSUMER_TOPIC", &self.kafka_consumer_topic),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} must not be empty")));
            }
        }
        if self.batch_size < 1 {
            return Err(ConfigError::Invalid("BATCH_SIZE must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn batch_timeout(&self) -> Duration {
        self.batch_timeout_ms.0
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout_ms.0
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(|timeout| timeout.0)
    }

    pub fn max_queue_depth(&self) -> Option<usize> {
        (self.max_queue_depth > 0).then_some(self.max_queue_depth)
    }

    pub fn to_dispatch_queue_config(&self) -> DispatchQueueConfig {
        DispatchQueueConfig::with_concurrency(self.concurrency).max_depth(self.max_queue_depth())
    }

    pub fn to_batch_processor_config(&self) -> BatchProcessorConfig {
        BatchProcessorConfig {
            queue: self.to_dispatch_queue_config(),
            handler_timeout: self.handler_timeout(),
        }
    }

    pub fn to_batch_consumer_config(&self) -> BatchConsumerConfig {
        BatchConsumerConfig {
            topic: self.kafka_consumer_topic.clone(),
            batch_size: self.batch_size,
            batch_timeout: self.batch_timeout(),
            worker: PartitionWorkerConfig {
                channel_buffer_size: self.partition_channel_capacity,
            },
        }
    }

    pub fn to_client_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::for_group_consumer(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_session_timeout_ms(self.kafka_session_timeout_ms)
            .with_heartbeat_interval_ms(self.kafka_heartbeat_interval_ms)
            .with_tls(self.kafka_tls)
            .with_tls_ca_location(self.kafka_tls_ca_location.as_deref())
            .with_tls_client_auth(
                self.kafka_tls_certificate_location.as_deref(),
                self.kafka_tls_key_location.as_deref(),
                self.kafka_tls_key_password.as_deref(),
            )
            .build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}
