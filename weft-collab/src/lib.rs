//! # weft-collab: real-time sync layer for Weft
//!
//! Serves JSON documents to WebSocket clients and keeps every server
//! instance of a deployment in step through a shared message bus.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │──── Session per connection
//! │ (per user)  │     JSON frames     │ (instance)  │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                  ┌─────────────────────────┼──────────────────────┐
//!                  ▼                         ▼                      ▼
//!          ┌───────────────┐       ┌─────────────────┐     ┌────────────────┐
//!          │ DocumentArena │       │ SessionRegistry │     │ BroadcastRelay │
//!          │ (weft-core)   │       │ (subs/presence) │     │ (fan-out)      │
//!          └───────────────┘       └─────────────────┘     └───────┬────────┘
//!                                                                  │
//!                                                        ┌─────────┴────────┐
//!                                                        │ MessageBus       │
//!                                                        │ (memory / redis) │
//!                                                        └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON request decoding and reply frames
//! - [`registry`]: Sessions, subscriptions and presence
//! - [`bus`]: Pub/sub transport between instances
//! - [`relay`]: Typed channels on the bus and local delivery
//! - [`gateway`]: Per-session request handling
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with offline queue

pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;

// Re-exports for convenience
pub use bus::{create_bus, MemoryBus, MessageBus};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use config::{BusConfig, ServerConfig};
pub use error::{BusError, MalformedMessage, SyncError};
pub use gateway::{Core, Handshake, Session, SessionPhase};
pub use protocol::{decode_request, ErrorBody, Frame, Request, SubmitOp};
pub use registry::{PresenceEvent, SessionHandle, SessionRegistry, SubscriptionId};
pub use relay::{
    BroadcastMessage, BroadcastRelay, ChannelKind, OperationMessage, PresenceMessage,
    RelayStats, SystemMessage,
};
pub use server::{ServerStats, SyncServer};
