use rdkafka::ClientConfig;
use uuid::Uuid;

/// Kafka consumer configuration builder for a group-based operation consumer.
///
/// Offsets are committed explicitly by the coordinator once a watermark
/// advances, so auto commit and auto offset store are always off.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Sets: group.id, a per-process client.id, auto.offset.store=false,
    /// auto.commit=false, socket.timeout.ms, session.timeout.ms,
    /// heartbeat.interval.ms, max.poll.interval.ms.
    pub fn for_group_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("client.id", format!("{group_id}-{}", Uuid::new_v4()));

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "25000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS. Certificate verification stays off unless a CA is given.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_tls_ca_location(mut self, path: Option<&str>) -> Self {
        if let Some(path) = path {
            self.config
                .set("ssl.ca.location", path)
                .set("enable.ssl.certificate.verification", "true");
        }
        self
    }

    /// Client certificate and key for mutual TLS.
    pub fn with_tls_client_auth(
        mut self,
        certificate: Option<&str>,
        key: Option<&str>,
        key_password: Option<&str>,
    ) -> Self {
        if let Some(certificate) = certificate {
            self.config.set("ssl.certificate.location", certificate);
        }
        if let Some(key) = key {
            self.config.set("ssl.key.location", key);
        }
        if let Some(password) = key_password {
            self.config.set("ssl.key.password", password);
        }
        self
    }

    /// Where to start when the group has no committed offset for a partition.
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u64) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.set("heartbeat.interval.ms", ms.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
