//! Redis pub/sub backend.
//!
//! Publishing goes through one multiplexed connection. Each subscription
//! opens its own pub/sub connection; when Redis drops it the receiver
//! closes and the relay resubscribes.

use super::{MessageBus, SUBSCRIBER_BUFFER};
use crate::error::BusError;
use async_trait::async_trait;
use futures_util::StreamExt;
use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use tokio::sync::mpsc;

pub struct RedisBus {
    client: ::redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = ::redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        log::info!("connected to redis bus at {url}");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BusError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("non-text payload on {name}: {e}"),
                }
            }
            log::warn!("redis subscription on {name} ended");
        });

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
