//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Request helpers for every message kind
//! - Typed events for replies and pushed frames
//! - Offline queue that composes edits made while disconnected

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use weft_core::{Component, DocKey, Operation, OtEngine, Query, Snapshot};

use crate::error::SyncError;
use crate::protocol::{encode_operation, ErrorBody, Frame};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Pong(Value),
    Subscribed {
        channel: String,
        subscription: u64,
    },
    Unsubscribed {
        channel: String,
    },
    /// A submit of ours was committed.
    Ack {
        collection: String,
        document: String,
        version: u64,
        seq: u64,
    },
    /// An operation committed by someone else, or a relayed broadcast.
    RemoteOp {
        collection: String,
        document: Option<String>,
        data: Value,
    },
    Presence {
        collection: Option<String>,
        document: Option<String>,
        data: Value,
    },
    Snapshot {
        collection: String,
        snapshot: Snapshot,
    },
    QueryResult {
        collection: String,
        snapshots: Vec<Snapshot>,
    },
    System {
        message: String,
        level: String,
    },
    Error {
        collection: Option<String>,
        document: Option<String>,
        error: ErrorBody,
    },
}

impl SyncEvent {
    /// Maps a server frame to an event. Unknown frames map to `None`.
    pub fn from_frame(frame: Frame) -> Option<Self> {
        let data = frame.data.unwrap_or(Value::Null);
        let text = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        let event = match frame.kind.as_str() {
            "pong" => SyncEvent::Pong(data.get("timestamp").cloned().unwrap_or(Value::Null)),
            "subscribed" => SyncEvent::Subscribed {
                channel: text("channel"),
                subscription: data.get("subscription").and_then(Value::as_u64).unwrap_or(0),
            },
            "unsubscribed" => SyncEvent::Unsubscribed {
                channel: text("channel"),
            },
            "ack" => SyncEvent::Ack {
                collection: frame.collection?,
                document: frame.document?,
                version: data.get("v")?.as_u64()?,
                seq: data.get("seq").and_then(Value::as_u64).unwrap_or(0),
            },
            "op" if data.get("type").and_then(Value::as_str) == Some("system") => SyncEvent::System {
                message: text("message"),
                level: text("level"),
            },
            "op" => SyncEvent::RemoteOp {
                collection: frame.collection.unwrap_or_default(),
                document: frame.document,
                data,
            },
            "presence" => SyncEvent::Presence {
                collection: frame.collection,
                document: frame.document,
                data,
            },
            "snapshot" => SyncEvent::Snapshot {
                collection: frame.collection.unwrap_or_default(),
                snapshot: serde_json::from_value(data).ok()?,
            },
            "queryResult" => SyncEvent::QueryResult {
                collection: frame.collection.unwrap_or_default(),
                snapshots: serde_json::from_value(data).ok()?,
            },
            "error" => SyncEvent::Error {
                collection: frame.collection,
                document: frame.document,
                error: frame.error?,
            },
            other => {
                log::debug!("ignoring frame of type {other}");
                return None;
            }
        };
        Some(event)
    }
}

/// Offline queue for edits made while disconnected.
///
/// Consecutive edits to one document are composed into a single
/// operation, so the queue holds at most one entry per document unless
/// a create or delete breaks the chain.
pub struct OfflineQueue {
    queue: VecDeque<(DocKey, Operation)>,
    max_size: usize,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an operation for later replay. Returns `false` when the
    /// queue is full and the operation could not be composed into an
    /// existing entry.
    pub fn enqueue(&mut self, key: DocKey, op: Operation) -> bool {
        if let Some((_, last)) = self.queue.iter_mut().rev().find(|(k, _)| *k == key) {
            if let Ok(composed) = OtEngine::compose(last, &op) {
                *last = composed;
                return true;
            }
        }
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((key, op));
        true
    }

    /// Drain all queued operations for replay, oldest first.
    pub fn drain(&mut self) -> Vec<(DocKey, Operation)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

/// The sync client.
pub struct SyncClient {
    /// Base server URL, e.g. `ws://127.0.0.1:9090`
    server_url: String,
    user_id: String,
    session_id: String,

    state: Arc<RwLock<ConnectionState>>,

    /// Per-client submit sequence
    seq: AtomicU64,

    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to send frames to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a new sync client. A session id is generated when none is given.
    pub fn new(server_url: impl Into<String>, user_id: impl Into<String>, session_id: Option<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            user_id: user_id.into(),
            session_id: session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            seq: AtomicU64::new(0),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Upgrade URL carrying the handshake identifiers.
    pub fn connect_url(&self) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("user_id", &self.user_id)
            .append_pair("session_id", &self.session_id)
            .finish();
        format!("{}/?{}", self.server_url.trim_end_matches('/'), query)
    }

    /// Connect to the server and replay the offline queue.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.connect_url()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued operations", queued.len());
            for (key, op) in queued {
                self.send(submit_frame(&key, &op)).await?;
            }
        }

        // Reader task: turn server frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                        Ok(frame) => {
                            if let Some(event) = SyncEvent::from_frame(frame) {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Closes the connection. Later submits are queued offline.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, frame: Value) -> Result<(), SyncError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or_else(|| SyncError::TransportFailure("not connected".into()))?;
        tx.send(frame.to_string())
            .await
            .map_err(|_| SyncError::TransportFailure("connection closed".into()))
    }

    pub async fn ping(&self, timestamp: impl Into<Value>) -> Result<(), SyncError> {
        self.send(json!({"type": "ping", "timestamp": timestamp.into()})).await
    }

    /// Subscribe to a document, or to the whole collection.
    pub async fn subscribe(&self, collection: &str, document: Option<&str>) -> Result<(), SyncError> {
        self.send(json!({"type": "subscribe", "collection": collection, "document": document}))
            .await
    }

    /// Subscribe to a document and receive every operation committed
    /// after `version`.
    pub async fn subscribe_from(&self, collection: &str, document: &str, version: u64) -> Result<(), SyncError> {
        self.send(json!({"type": "subscribe", "collection": collection, "document": document, "v": version}))
            .await
    }

    pub async fn unsubscribe(&self, collection: &str, document: Option<&str>) -> Result<(), SyncError> {
        self.send(json!({"type": "unsubscribe", "collection": collection, "document": document}))
            .await
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<(), SyncError> {
        self.send(json!({"type": "get", "collection": collection, "id": id})).await
    }

    pub async fn query(&self, collection: &str, query: &Query) -> Result<(), SyncError> {
        self.send(json!({"type": "query", "collection": collection, "query": query}))
            .await
    }

    pub async fn presence(&self, collection: &str, id: &str, data: Value) -> Result<(), SyncError> {
        self.send(json!({"type": "presence", "collection": collection, "id": id, "data": data}))
            .await
    }

    /// Submit `components` against `version` as this client's next
    /// operation. Returns the sequence number used.
    pub async fn submit_edit(
        &self,
        collection: &str,
        id: &str,
        version: u64,
        components: Vec<Component>,
    ) -> Result<u64, SyncError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let op = Operation::edit(self.session_id.clone(), seq, version, components);
        self.submit(DocKey::new(collection, id), op).await?;
        Ok(seq)
    }

    /// Submit an operation. If disconnected, queues it for replay.
    pub async fn submit(&self, key: DocKey, op: Operation) -> Result<(), SyncError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(key, op) {
                return Err(SyncError::TransportFailure("offline queue is full".into()));
            }
            return Ok(());
        }
        self.send(submit_frame(&key, &op)).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

fn submit_frame(key: &DocKey, op: &Operation) -> Value {
    json!({
        "type": "submit",
        "collection": key.collection,
        "id": key.id,
        "op": encode_operation(op),
    })
}
