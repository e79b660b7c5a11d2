//! In-process bus on tokio broadcast channels.
//!
//! Each channel name maps to one broadcast sender. A subscription holds a
//! broadcast receiver and forwards into an mpsc receiver; a subscriber
//! that falls more than `capacity` messages behind loses the overflow.

use super::{MessageBus, SUBSCRIBER_BUFFER};
use crate::error::BusError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBusStats {
    pub published: u64,
    pub lagged: u64,
}

#[derive(Default)]
struct AtomicStats {
    published: AtomicU64,
    lagged: AtomicU64,
}

/// Cloning shares the underlying channels.
#[derive(Clone)]
pub struct MemoryBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Arc<str>>>>>,
    capacity: usize,
    available: Arc<AtomicBool>,
    stats: Arc<AtomicStats>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            available: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(AtomicStats::default()),
        }
    }

    /// Simulates losing and regaining the backend. Going down closes
    /// every open subscription.
    pub async fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.channels.write().await.clear();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> MemoryBusStats {
        MemoryBusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            lagged: self.stats.lagged.load(Ordering::Relaxed),
        }
    }

    fn check(&self) -> Result<(), BusError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BusError::Unavailable("memory bus is down".to_string()))
        }
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<Arc<str>> {
        {
            let channels = self.channels.read().await;
            if let Some(tx) = channels.get(channel) {
                return tx.clone();
            }
        }

        let mut channels = self.channels.write().await;
        if let Some(tx) = channels.get(channel) {
            return tx.clone();
        }
        let (tx, _) = broadcast::channel(self.capacity);
        channels.insert(channel.to_string(), tx.clone());
        tx
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BusError> {
        self.check()?;
        let tx = {
            let channels = self.channels.read().await;
            channels.get(channel).cloned()
        };
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        // No sender means nobody ever subscribed.
        Ok(tx.map_or(0, |tx| tx.send(Arc::from(payload)).unwrap_or(0)))
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, BusError> {
        self.check()?;
        let mut source = self.sender(channel).await.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let stats = self.stats.clone();
        let name = channel.to_string();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(msg) => {
                        if tx.send(msg.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        stats.lagged.fetch_add(n, Ordering::Relaxed);
                        log::warn!("memory bus subscriber on {name} lagged, {n} messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            log::trace!("memory bus subscription on {name} ended");
        });

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
