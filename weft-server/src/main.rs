//! weftd: one instance of the Weft real-time sync service.
//!
//! Instances started against the same Redis URL and namespace relay
//! commits, presence and system messages to each other. Without a Redis
//! URL the instance runs standalone on an in-memory bus.

use clap::Parser;
use log::info;
use weft_collab::{BusConfig, ServerConfig, SyncServer};

#[derive(Debug, Parser)]
#[command(name = "weftd", version, about = "Real-time document sync server", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "WEFT_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Prefix of every relay channel
    #[arg(long, env = "WEFT_NAMESPACE", default_value = "teable")]
    namespace: String,

    /// Redis URL of the shared bus, e.g. redis://127.0.0.1:6379
    #[arg(long, env = "WEFT_REDIS_URL")]
    redis_url: Option<String>,

    /// Close sessions that send nothing for this many seconds
    #[arg(long, env = "WEFT_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    idle_timeout_secs: u64,

    /// Frames buffered per session before new ones are dropped
    #[arg(long, env = "WEFT_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Delay between relay reconnect attempts, in milliseconds
    #[arg(long, env = "WEFT_RELAY_RETRY_MS", default_value_t = 1000)]
    relay_retry_ms: u64,

    /// Largest accepted inbound frame, in bytes
    #[arg(long, env = "WEFT_MAX_FRAME_BYTES", default_value_t = 1 << 20)]
    max_frame_bytes: usize,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let bus = match self.redis_url {
            Some(url) => BusConfig::Redis { url },
            None => BusConfig::Memory,
        };
        ServerConfig {
            bind_addr: self.bind,
            namespace: self.namespace,
            idle_timeout_secs: self.idle_timeout_secs,
            outbound_capacity: self.outbound_capacity,
            relay_retry_ms: self.relay_retry_ms,
            max_frame_bytes: self.max_frame_bytes,
            bus,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("weftd=info,weft_collab=info,weft_core=info"),
    )
    .init();

    let config = Cli::parse().into_config();
    info!(
        "Starting weftd on {} (namespace {:?}, {:?} bus)",
        config.bind_addr, config.namespace, config.bus
    );

    let server = SyncServer::connect(config).await?;
    server.run().await
}
