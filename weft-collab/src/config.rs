use std::time::Duration;

/// Which message bus connects server instances.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BusConfig {
    /// In-process bus. Instances share it only when they share the
    /// same `MemoryBus` value.
    #[default]
    Memory,
    /// Redis pub/sub.
    Redis { url: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Channel namespace: channels are named `<namespace>:ws:<category>:<op>`
    pub namespace: String,
    /// Sessions with no inbound frame for this long are closed
    pub idle_timeout_secs: u64,
    /// Outbound frames buffered per session before new ones are dropped
    pub outbound_capacity: usize,
    /// Per-channel buffer of the in-memory bus
    pub bus_capacity: usize,
    /// Delay between relay listener reconnect attempts
    pub relay_retry_ms: u64,
    /// Largest accepted inbound frame
    pub max_frame_bytes: usize,
    /// Mailbox depth of each document actor
    pub document_mailbox: usize,
    pub bus: BusConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            namespace: "teable".to_string(),
            idle_timeout_secs: 60,
            outbound_capacity: 256,
            bus_capacity: 1024,
            relay_retry_ms: 1000,
            max_frame_bytes: 1 << 20,
            document_mailbox: weft_core::arena::DEFAULT_MAILBOX,
            bus: BusConfig::Memory,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn relay_retry(&self) -> Duration {
        Duration::from_millis(self.relay_retry_ms)
    }
}
