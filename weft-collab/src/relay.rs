//! Cross-instance broadcast relay.
//!
//! Every instance publishes what happens locally to the bus and listens
//! on every relay channel; whatever arrives on a channel is delivered to
//! the matching local sessions. An instance also receives its own
//! publications, so local and remote delivery share one path.
//!
//! ```text
//!   gateway ──publish──▶ [queue] ──▶ publisher task ──▶ bus
//!                                         │ (bus down: deliver locally)
//!                                         ▼
//!   bus ──▶ listener per channel ──▶ Dispatcher ──▶ matching sessions
//! ```
//!
//! Channels, for namespace `ns`:
//!
//! | channel                  | payload                                   |
//! |--------------------------|-------------------------------------------|
//! | `ns:ws:broadcast`        | `{channel, message, exclude}`             |
//! | `ns:ws:doc:op`           | operation on any collection               |
//! | `ns:ws:record:op` etc.   | operation on `record_<table>` collections |
//! | `ns:ws:presence:update`  | presence of one user                      |
//! | `ns:ws:system:message`   | `{message, level}` for every session      |
//!
//! Delivery is at most once: a listener that reconnects misses whatever
//! was published meanwhile. Clients recover operations from the log.

use crate::bus::MessageBus;
use crate::error::SyncError;
use crate::protocol::{encode_operation, parse_channel, Frame};
use crate::registry::{PresenceEvent, SessionHandle, SessionRegistry};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use weft_core::CommitRecord;

/// The relay channel categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Broadcast,
    DocOp,
    RecordOp,
    ViewOp,
    FieldOp,
    Presence,
    System,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 7] = [
        ChannelKind::Broadcast,
        ChannelKind::DocOp,
        ChannelKind::RecordOp,
        ChannelKind::ViewOp,
        ChannelKind::FieldOp,
        ChannelKind::Presence,
        ChannelKind::System,
    ];

    fn suffix(self) -> &'static str {
        match self {
            ChannelKind::Broadcast => "ws:broadcast",
            ChannelKind::DocOp => "ws:doc:op",
            ChannelKind::RecordOp => "ws:record:op",
            ChannelKind::ViewOp => "ws:view:op",
            ChannelKind::FieldOp => "ws:field:op",
            ChannelKind::Presence => "ws:presence:update",
            ChannelKind::System => "ws:system:message",
        }
    }

    /// Collection prefix of table-scoped operation channels.
    pub fn table_prefix(self) -> Option<&'static str> {
        match self {
            ChannelKind::RecordOp => Some("record"),
            ChannelKind::ViewOp => Some("view"),
            ChannelKind::FieldOp => Some("field"),
            _ => None,
        }
    }

    /// Operation channel for commits on `collection`, with the table id
    /// for table-scoped collections.
    pub fn for_collection(collection: &str) -> (ChannelKind, Option<&str>) {
        for kind in [ChannelKind::RecordOp, ChannelKind::ViewOp, ChannelKind::FieldOp] {
            if let Some(prefix) = kind.table_prefix() {
                if let Some(table) = collection
                    .strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .filter(|t| !t.is_empty())
                {
                    return (kind, Some(table));
                }
            }
        }
        (ChannelKind::DocOp, None)
    }

    /// Full channel name under `namespace`.
    pub fn channel(self, namespace: &str) -> String {
        if namespace.is_empty() {
            self.suffix().to_string()
        } else {
            format!("{namespace}:{}", self.suffix())
        }
    }
}

/// Payload of `ws:broadcast`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type", default = "broadcast_tag")]
    pub kind: String,
    /// `collection` or `collection.document`
    pub channel: String,
    pub message: Value,
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn broadcast_tag() -> String {
    "broadcast".to_string()
}

/// Payload of the operation channels.
///
/// Commits published by this relay fill both the commit fields and the
/// table-scoped ones so that older consumers keep working. Inbound
/// payloads may carry either set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    /// Document version after the commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Committed operation in wire form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    /// Component list without the operation envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl OperationMessage {
    /// Builds the payload announcing `record` on its category channel.
    pub fn from_commit(record: &CommitRecord, exclude: Vec<String>) -> (ChannelKind, Self) {
        let (kind, table) = ChannelKind::for_collection(&record.collection);
        let wire = encode_operation(&record.operation);
        let mut msg = OperationMessage {
            kind: Some(
                kind.table_prefix()
                    .map_or("document_operation".to_string(), |p| format!("{p}_operation")),
            ),
            collection: Some(record.collection.clone()),
            document: Some(record.document.clone()),
            version: Some(record.version),
            operation: wire.get("op").cloned(),
            op: Some(wire),
            table_id: table.map(str::to_string),
            source: Some(record.source.clone()),
            timestamp: Some(json!(record.timestamp.to_rfc3339())),
            exclude,
            ..Default::default()
        };
        let document = Some(record.document.clone());
        match kind {
            ChannelKind::RecordOp => msg.record_id = document,
            ChannelKind::ViewOp => msg.view_id = document,
            ChannelKind::FieldOp => msg.field_id = document,
            _ => {}
        }
        (kind, msg)
    }

    /// `(collection, document?)` addressed by this payload on `kind`.
    pub fn target(&self, kind: ChannelKind) -> Option<(String, Option<String>)> {
        let collection = match (&self.collection, kind.table_prefix(), &self.table_id) {
            (Some(c), _, _) if !c.is_empty() => c.clone(),
            (_, Some(prefix), Some(table)) if !table.is_empty() => format!("{prefix}_{table}"),
            _ => return None,
        };
        let document = self
            .document
            .clone()
            .or_else(|| match kind {
                ChannelKind::RecordOp => self.record_id.clone(),
                ChannelKind::ViewOp => self.view_id.clone(),
                ChannelKind::FieldOp => self.field_id.clone(),
                _ => None,
            })
            .filter(|d| !d.is_empty());
        Some((collection, document))
    }

    /// Data of the `op` event sent to sessions.
    pub fn event_data(&self) -> Value {
        match &self.op {
            Some(op) => op.clone(),
            None => json!({
                "op": self.operation.clone().unwrap_or(Value::Array(Vec::new())),
                "source": self.source,
            }),
        }
    }
}

/// Payload of `ws:presence:update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    /// `collection` or `collection.document`, as an alternative target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl PresenceMessage {
    pub fn from_event(event: &PresenceEvent, exclude: Vec<String>) -> Self {
        Self {
            user_id: Some(event.user_id.clone()),
            session_id: Some(event.session_id.clone()),
            collection: Some(event.collection.clone()),
            document: Some(event.document.clone()),
            channel: None,
            status: Some(event.status.clone()),
            data: event.data.clone(),
            timestamp: Some(json!(event.last_seen.to_rfc3339())),
            exclude,
        }
    }

    fn target(&self) -> Option<(String, Option<String>)> {
        match (&self.collection, &self.channel) {
            (Some(c), _) if !c.is_empty() => Some((
                c.clone(),
                self.document.clone().filter(|d| !d.is_empty()),
            )),
            (_, Some(channel)) => parse_channel(channel),
            _ => None,
        }
    }

    fn event_data(&self) -> Value {
        json!({
            "user_id": self.user_id,
            "session_id": self.session_id,
            "status": self.status,
            "data": self.data,
            "timestamp": self.timestamp,
        })
    }
}

/// Payload of `ws:system:message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub message: String,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub published: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub malformed: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub outbox_full: u64,
    pub listener_failures: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    outbox_full: AtomicU64,
    listener_failures: AtomicU64,
}

/// Delivers relay payloads to local sessions.
#[derive(Clone)]
pub struct Dispatcher {
    registry: SessionRegistry,
    stats: Arc<AtomicRelayStats>,
}

impl Dispatcher {
    /// Handles one payload received on a `kind` channel. Returns the
    /// number of sessions it was handed to.
    pub async fn dispatch(&self, kind: ChannelKind, payload: &str) -> usize {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        match self.route(kind, payload).await {
            Ok(n) => n,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping relay payload on {:?}: {}", kind, e);
                0
            }
        }
    }

    async fn route(&self, kind: ChannelKind, payload: &str) -> Result<usize, serde_json::Error> {
        match kind {
            ChannelKind::Broadcast => {
                let msg: BroadcastMessage = serde_json::from_str(payload)?;
                let Some((collection, document)) = parse_channel(&msg.channel) else {
                    return Ok(0);
                };
                let sessions = self
                    .registry
                    .matching_sessions(&collection, document.as_deref())
                    .await;
                let frame = Frame::op(&collection, document.as_deref(), msg.message);
                Ok(self.fan_out(sessions, &msg.exclude, &frame))
            }
            ChannelKind::DocOp | ChannelKind::RecordOp | ChannelKind::ViewOp | ChannelKind::FieldOp => {
                let msg: OperationMessage = serde_json::from_str(payload)?;
                let Some((collection, document)) = msg.target(kind) else {
                    log::debug!("operation payload on {:?} names no collection", kind);
                    return Ok(0);
                };
                let sessions = self
                    .registry
                    .matching_sessions(&collection, document.as_deref())
                    .await;
                let frame = Frame::op(&collection, document.as_deref(), msg.event_data());
                Ok(self.fan_out(sessions, &msg.exclude, &frame))
            }
            ChannelKind::Presence => {
                let msg: PresenceMessage = serde_json::from_str(payload)?;
                let (sessions, frame) = match (msg.target(), &msg.user_id) {
                    (Some((collection, document)), _) => (
                        self.registry
                            .matching_sessions(&collection, document.as_deref())
                            .await,
                        Frame::presence(Some(collection.as_str()), document.as_deref(), msg.event_data()),
                    ),
                    (None, Some(user)) => (
                        self.registry.sessions_for_user(user).await,
                        Frame::presence(None, None, msg.event_data()),
                    ),
                    (None, None) => return Ok(0),
                };
                Ok(self.fan_out(sessions, &msg.exclude, &frame))
            }
            ChannelKind::System => {
                let msg: SystemMessage = serde_json::from_str(payload)?;
                let sessions = self.registry.all_sessions().await;
                Ok(self.fan_out(sessions, &[], &Frame::system(&msg.message, &msg.level)))
            }
        }
    }

    fn fan_out(&self, sessions: Vec<SessionHandle>, exclude: &[String], frame: &Frame) -> usize {
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("failed to encode relay frame: {}", e);
                return 0;
            }
        };
        let mut delivered = 0;
        for session in sessions.iter().filter(|s| !s.is_excluded(exclude)) {
            if session.send(encoded.clone()) {
                delivered += 1;
            } else {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }
}

/// Publishes local events to the bus and feeds bus traffic to local
/// sessions.
pub struct BroadcastRelay {
    bus: Arc<dyn MessageBus>,
    namespace: String,
    retry: Duration,
    dispatcher: Dispatcher,
    outbox: mpsc::Sender<(ChannelKind, String)>,
    stats: Arc<AtomicRelayStats>,
}

impl BroadcastRelay {
    /// Creates the relay and spawns its publisher task. Listeners start
    /// with [`BroadcastRelay::start`].
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: SessionRegistry,
        namespace: impl Into<String>,
        retry: Duration,
        capacity: usize,
    ) -> Self {
        let stats = Arc::new(AtomicRelayStats::default());
        let dispatcher = Dispatcher {
            registry,
            stats: stats.clone(),
        };
        let namespace = namespace.into();
        let (outbox, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_publisher(
            bus.clone(),
            namespace.clone(),
            dispatcher.clone(),
            stats.clone(),
            rx,
        ));
        Self {
            bus,
            namespace,
            retry,
            dispatcher,
            outbox,
            stats,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Subscribes to every relay channel and spawns one listener per
    /// channel. The first subscription attempt completes before this
    /// returns; a channel that cannot be subscribed is retried in the
    /// background while the instance serves local sessions only.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(ChannelKind::ALL.len());
        for kind in ChannelKind::ALL {
            let channel = kind.channel(&self.namespace);
            let first = match self.bus.subscribe(&channel).await {
                Ok(rx) => {
                    log::info!("relay listening on {} via {}", channel, self.bus.name());
                    Some(rx)
                }
                Err(e) => {
                    self.stats.listener_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("{}; {} stays local-only", SyncError::from(e), channel);
                    None
                }
            };
            handles.push(tokio::spawn(run_listener(
                self.bus.clone(),
                channel,
                kind,
                self.dispatcher.clone(),
                self.stats.clone(),
                self.retry,
                first,
            )));
        }
        handles
    }

    /// Hands a payload to the publisher without waiting. A full outbox
    /// drops the payload and counts it.
    fn enqueue(&self, kind: ChannelKind, payload: Result<String, serde_json::Error>) {
        let payload = match payload {
            Ok(p) => p,
            Err(e) => {
                log::error!("failed to encode relay payload: {}", e);
                return;
            }
        };
        match self.outbox.try_send((kind, payload)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.outbox_full.fetch_add(1, Ordering::Relaxed);
                log::warn!("relay outbox full, dropping {:?} payload", kind);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::error!("relay publisher has stopped");
            }
        }
    }

    /// Announces a commit. Sessions listed in `exclude` do not receive it.
    pub async fn publish_commit(&self, record: &CommitRecord, exclude: Vec<String>) {
        let (kind, msg) = OperationMessage::from_commit(record, exclude);
        self.enqueue(kind, serde_json::to_string(&msg));
    }

    pub async fn publish_broadcast(&self, channel: &str, message: Value, exclude: Vec<String>) {
        let msg = BroadcastMessage {
            kind: broadcast_tag(),
            channel: channel.to_string(),
            message,
            exclude,
        };
        self.enqueue(ChannelKind::Broadcast, serde_json::to_string(&msg));
    }

    pub async fn publish_presence(&self, event: &PresenceEvent, exclude: Vec<String>) {
        let msg = PresenceMessage::from_event(event, exclude);
        self.enqueue(ChannelKind::Presence, serde_json::to_string(&msg));
    }

    pub async fn publish_system(&self, message: &str, level: &str) {
        let msg = SystemMessage {
            message: message.to_string(),
            level: level.to_string(),
            timestamp: Some(json!(Utc::now().to_rfc3339())),
        };
        self.enqueue(ChannelKind::System, serde_json::to_string(&msg));
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            published: self.stats.published.load(Ordering::Relaxed),
            publish_failures: self.stats.publish_failures.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            malformed: self.stats.malformed.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            outbox_full: self.stats.outbox_full.load(Ordering::Relaxed),
            listener_failures: self.stats.listener_failures.load(Ordering::Relaxed),
        }
    }
}

/// Publishes queued payloads in order. When the bus refuses a payload it
/// is delivered to local sessions directly.
async fn run_publisher(
    bus: Arc<dyn MessageBus>,
    namespace: String,
    dispatcher: Dispatcher,
    stats: Arc<AtomicRelayStats>,
    mut rx: mpsc::Receiver<(ChannelKind, String)>,
) {
    while let Some((kind, payload)) = rx.recv().await {
        let channel = kind.channel(&namespace);
        match bus.publish(&channel, payload.clone()).await {
            Ok(_) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "{}; delivering {} locally (degraded mode)",
                    SyncError::from(e),
                    channel
                );
                dispatcher.dispatch(kind, &payload).await;
            }
        }
    }
    log::debug!("relay publisher stopped");
}

async fn run_listener(
    bus: Arc<dyn MessageBus>,
    channel: String,
    kind: ChannelKind,
    dispatcher: Dispatcher,
    stats: Arc<AtomicRelayStats>,
    retry: Duration,
    mut current: Option<mpsc::Receiver<String>>,
) {
    loop {
        if let Some(mut rx) = current.take() {
            while let Some(payload) = rx.recv().await {
                dispatcher.dispatch(kind, &payload).await;
            }
            log::warn!("relay listener on {} disconnected", channel);
        }

        tokio::time::sleep(retry).await;
        match bus.subscribe(&channel).await {
            Ok(rx) => {
                log::info!("relay listener on {} reconnected", channel);
                current = Some(rx);
            }
            Err(e) => {
                stats.listener_failures.fetch_add(1, Ordering::Relaxed);
                log::debug!("relay listener on {} still down: {}", channel, e);
            }
        }
    }
}
