//! Cross-instance message bus.
//!
//! Server instances never share memory; they exchange relay payloads as
//! strings over named channels. Backends are interchangeable:
//!
//! - [`MemoryBus`]: tokio broadcast channels, for single-process
//!   deployments and tests (two servers sharing one `MemoryBus` behave
//!   like two instances on one Redis).
//! - `RedisBus`: Redis pub/sub (feature `redis-bus`).

use crate::config::BusConfig;
use crate::error::BusError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod memory;
#[cfg(feature = "redis-bus")]
pub mod redis;

pub use memory::MemoryBus;
#[cfg(feature = "redis-bus")]
pub use self::redis::RedisBus;

/// Buffer between a backend subscription and its consumer.
pub const SUBSCRIBER_BUFFER: usize = 1024;

#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publishes `payload` on `channel`. Returns the number of
    /// subscribers the backend handed it to, which may be zero.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BusError>;

    /// Subscribes to `channel`. The receiver closes when the backend
    /// connection is lost; callers resubscribe to recover.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, BusError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Builds the bus selected by `config`.
pub async fn create_bus(config: &BusConfig, capacity: usize) -> Result<Arc<dyn MessageBus>, BusError> {
    match config {
        BusConfig::Memory => Ok(Arc::new(MemoryBus::new(capacity))),
        #[cfg(feature = "redis-bus")]
        BusConfig::Redis { url } => {
            let bus = RedisBus::connect(url).await?;
            Ok(Arc::new(bus))
        }
        #[allow(unreachable_patterns)]
        _ => Err(BusError::Unavailable(
            "this build has no support for the configured bus".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_memory_bus() {
        let bus = create_bus(&BusConfig::Memory, 16).await.unwrap();
        assert_eq!(bus.name(), "memory");
        let mut rx = bus.subscribe("ns:ws:broadcast").await.unwrap();
        assert_eq!(bus.publish("ns:ws:broadcast", "hi".into()).await.unwrap(), 1);
        assert_eq!(rx.recv().await.as_deref(), Some("hi"));
    }
}
