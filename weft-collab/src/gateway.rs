//! Per-session protocol state machine.
//!
//! ```text
//!   Connecting ──handshake ok──▶ Active ──transport error / close / idle──▶ Closing ──▶ Closed
//!        │                         │ ▲
//!        └──handshake failed──▶ (rejected before a session exists)
//!                                  └─┘ ping, subscribe, unsubscribe, get, query,
//!                                      submit, presence; malformed frames answer
//!                                      with an error frame and stay Active
//! ```
//!
//! The transport is not handled here: the server feeds inbound text to
//! [`Session::handle_text`] and writes back whatever frames it returns.
//! Fan-out frames reach the session through its outbound channel.

use crate::bus::MessageBus;
use crate::config::ServerConfig;
use crate::error::{MalformedMessage, SyncError};
use crate::protocol::{channel_name, decode_request, encode_operation, Frame, Request};
use crate::registry::{SessionHandle, SessionRegistry, SubscriptionId};
use crate::relay::BroadcastRelay;
use crate::server::ServerStats;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;
use weft_core::{DocKey, DocumentArena, LogStore, MemoryLogStore};

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Identifiers carried by the WebSocket upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub user_id: String,
    pub session_id: String,
}

impl Handshake {
    pub fn new(user_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }

    /// Reads `user_id` and `session_id` from the upgrade URL query,
    /// falling back to the `X-User-ID` header for the user.
    pub fn from_parts(query: Option<&str>, user_header: Option<&str>) -> Result<Self, MalformedMessage> {
        let mut user_id = None;
        let mut session_id = None;
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match key.as_ref() {
                "user_id" if !value.is_empty() => user_id = Some(value.into_owned()),
                "session_id" if !value.is_empty() => session_id = Some(value.into_owned()),
                _ => {}
            }
        }
        let user_id = user_id
            .or_else(|| user_header.filter(|h| !h.is_empty()).map(str::to_string))
            .ok_or_else(|| MalformedMessage::missing("user_id"))?;
        Ok(Self::new(user_id, session_id))
    }
}

/// State shared by every session of one server instance.
pub struct Core {
    pub config: ServerConfig,
    pub arena: DocumentArena,
    pub registry: SessionRegistry,
    pub relay: BroadcastRelay,
    pub stats: Arc<RwLock<ServerStats>>,
}

impl Core {
    /// Core with a private document store.
    pub fn new(config: ServerConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self::with_store(config, bus, Arc::new(MemoryLogStore::new()))
    }

    /// Core whose documents live in `store`. Instances sharing a bus
    /// should share the store too, so a document has one history.
    pub fn with_store(config: ServerConfig, bus: Arc<dyn MessageBus>, store: Arc<dyn LogStore>) -> Self {
        let registry = SessionRegistry::new();
        let relay = BroadcastRelay::new(
            bus,
            registry.clone(),
            config.namespace.clone(),
            config.relay_retry(),
            config.outbound_capacity,
        );
        Self {
            arena: DocumentArena::with_store(store, config.document_mailbox),
            registry,
            relay,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            config,
        }
    }

    /// Starts the relay listeners.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        self.relay.start().await
    }
}

/// One client session.
pub struct Session {
    core: Arc<Core>,
    handle: SessionHandle,
    phase: SessionPhase,
    next_seq: u64,
}

impl Session {
    /// Registers the session; it starts `Active`.
    pub async fn open(core: Arc<Core>, handshake: &Handshake, outbound: mpsc::Sender<Arc<str>>) -> Self {
        let mut phase = SessionPhase::Connecting;
        let handle = core
            .registry
            .register(&handshake.user_id, &handshake.session_id, outbound)
            .await;
        log::debug!("session {} {:?} -> Active", handle.id, phase);
        phase = SessionPhase::Active;
        Self {
            core,
            handle,
            phase,
            next_seq: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Handles one inbound text frame and returns the direct replies.
    pub async fn handle_text(&mut self, text: &str) -> Vec<Frame> {
        if self.phase != SessionPhase::Active {
            return Vec::new();
        }
        if text.len() > self.core.config.max_frame_bytes {
            return vec![self.reject(
                None,
                MalformedMessage::new(
                    "$",
                    format!("frame exceeds {} bytes", self.core.config.max_frame_bytes),
                )
                .into(),
            )
            .await];
        }

        let request = match decode_request(text) {
            Ok(request) => request,
            Err(e) => return vec![self.reject(None, e.into()).await],
        };
        let scope = document_scope(&request);
        match self.handle_request(request).await {
            Ok(frames) => frames,
            Err(e) => vec![self.reject(scope, e).await],
        }
    }

    async fn reject(&self, scope: Option<(String, String)>, err: SyncError) -> Frame {
        {
            let mut stats = self.core.stats.write().await;
            match &err {
                SyncError::MalformedMessage(_) => stats.malformed_frames += 1,
                _ => stats.rejected_requests += 1,
            }
        }
        log::debug!("session {}: {}", self.handle.id, err);
        match scope {
            Some((collection, document)) => Frame::document_error(&collection, &document, &err),
            None => Frame::error(&err),
        }
    }

    async fn handle_request(&mut self, request: Request) -> Result<Vec<Frame>, SyncError> {
        match request {
            Request::Ping { timestamp } => Ok(vec![Frame::pong(timestamp)]),

            Request::Subscribe {
                collection,
                document,
                from_version,
            } => {
                let SubscriptionId(id) = self
                    .core
                    .registry
                    .subscribe(self.handle.id, &collection, document.as_deref())
                    .await
                    .ok_or_else(|| SyncError::TransportFailure("session is not registered".into()))?;
                let mut frames = vec![Frame::subscribed(&collection, document.as_deref(), id)];

                if let (Some(from), Some(doc)) = (from_version, document.as_deref()) {
                    let key = DocKey::new(&collection, doc);
                    if let Some(actor) = self.core.arena.get(&key).await {
                        for op in actor.read(from).await? {
                            frames.push(Frame::op(&collection, Some(doc), encode_operation(&op)));
                        }
                    }
                }
                Ok(frames)
            }

            Request::Unsubscribe {
                collection,
                document,
                subscription,
            } => {
                let removed = match (subscription, &collection) {
                    (Some(id), _) => usize::from(self.core.registry.unsubscribe(SubscriptionId(id)).await),
                    (None, Some(collection)) => {
                        self.core
                            .registry
                            .unsubscribe_matching(self.handle.id, collection, document.as_deref())
                            .await
                    }
                    (None, None) => return Err(MalformedMessage::missing("collection").into()),
                };
                let channel = collection
                    .as_deref()
                    .map(|c| channel_name(c, document.as_deref()))
                    .unwrap_or_default();
                Ok(vec![Frame::unsubscribed(&channel, removed)])
            }

            Request::Query { collection, query } => {
                let snapshots = self.core.arena.query(&collection, &query).await?;
                Ok(vec![Frame::query_result(&collection, &snapshots)])
            }

            Request::Get {
                collection,
                document,
            } => {
                let snapshot = self
                    .core
                    .arena
                    .snapshot(&DocKey::new(&collection, &document))
                    .await?;
                Ok(vec![Frame::snapshot(&collection, &snapshot)])
            }

            Request::Submit {
                collection,
                document,
                op,
            } => {
                let at_latest = op.v.is_none();
                self.next_seq += 1;
                let operation = op.into_operation(&self.handle.session_id, self.next_seq);
                let key = DocKey::new(&collection, &document);
                let actor = self.core.arena.get_or_spawn(&key).await;
                let record = if at_latest {
                    actor.submit_latest(operation).await?
                } else {
                    actor.submit(operation).await?
                };

                self.core.stats.write().await.commits += 1;
                log::debug!(
                    "{} committed v{} from {} (session {})",
                    key,
                    record.version,
                    record.source,
                    self.handle.id
                );
                self.core
                    .relay
                    .publish_commit(&record, vec![self.handle.id.to_string()])
                    .await;
                Ok(vec![Frame::ack(&record)])
            }

            Request::Presence {
                collection,
                document,
                status,
                data,
            } => {
                let key = DocKey::new(&collection, &document);
                let event = self
                    .core
                    .registry
                    .update_presence(self.handle.id, &key, status, data)
                    .await
                    .ok_or_else(|| SyncError::TransportFailure("session is not registered".into()))?;
                self.core
                    .relay
                    .publish_presence(&event, vec![self.handle.id.to_string()])
                    .await;
                Ok(Vec::new())
            }
        }
    }

    /// Moves the session through `Closing` to `Closed`: drops its
    /// subscriptions and announces it offline wherever it held presence.
    pub async fn close(&mut self) {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return;
        }
        self.phase = SessionPhase::Closing;
        log::debug!("session {} -> Closing", self.handle.id);

        let offline = self.core.registry.remove_session(self.handle.id).await;
        for event in &offline {
            self.core.relay.publish_presence(event, Vec::new()).await;
        }
        self.phase = SessionPhase::Closed;
    }
}

/// `(collection, document)` an error on this request should be tagged with.
fn document_scope(request: &Request) -> Option<(String, String)> {
    match request {
        Request::Get {
            collection,
            document,
        }
        | Request::Submit {
            collection,
            document,
            ..
        }
        | Request::Presence {
            collection,
            document,
            ..
        } => Some((collection.clone(), document.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use serde_json::json;
    use std::time::Duration;

    async fn core() -> Arc<Core> {
        let core = Arc::new(Core::new(
            ServerConfig::default(),
            Arc::new(MemoryBus::new(64)),
        ));
        core.start().await;
        core
    }

    async fn open(core: &Arc<Core>, user: &str) -> (Session, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(32);
        let session = Session::open(core.clone(), &Handshake::new(user, None), tx).await;
        (session, rx)
    }

    async fn one(session: &mut Session, frame: serde_json::Value) -> Frame {
        let mut frames = session.handle_text(&frame.to_string()).await;
        assert_eq!(frames.len(), 1, "expected one reply, got {frames:?}");
        frames.remove(0)
    }

    async fn pushed(rx: &mut mpsc::Receiver<Arc<str>>) -> Frame {
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("closed");
        Frame::decode(&text).unwrap()
    }

    fn submit(src: &str, v: u64, value: &str) -> serde_json::Value {
        json!({
            "type": "submit", "collection": "c", "id": "d",
            "op": {"src": src, "seq": 1, "v": v, "op": [{"p": ["name"], "oi": value, "od": null}]}
        })
    }

    #[test]
    fn test_handshake_parsing() {
        let h = Handshake::from_parts(Some("user_id=u1&session_id=s1"), None).unwrap();
        assert_eq!(h, Handshake::new("u1", Some("s1".into())));

        let h = Handshake::from_parts(None, Some("header-user")).unwrap();
        assert_eq!(h.user_id, "header-user");
        assert!(!h.session_id.is_empty());

        let err = Handshake::from_parts(Some("session_id=s1"), None).unwrap_err();
        assert_eq!(err.field, "user_id");
    }

    #[tokio::test]
    async fn test_ping_and_phase() {
        let core = core().await;
        let (mut session, _rx) = open(&core, "u").await;
        assert_eq!(session.phase(), SessionPhase::Active);

        let pong = one(&mut session, json!({"type": "ping", "timestamp": 42})).await;
        assert_eq!(pong.kind, "pong");
        assert_eq!(pong.data.unwrap()["timestamp"], 42);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_session_active() {
        let core = core().await;
        let (mut session, _rx) = open(&core, "u").await;

        let reply = session.handle_text("{ nope").await;
        assert_eq!(reply[0].kind, "error");
        assert_eq!(reply[0].error.as_ref().unwrap().code, 400);

        let reply = one(
            &mut session,
            json!({"type": "submit", "collection": "c", "id": "d", "op": {"op": [{"p": "name", "oi": 1}]}}),
        )
        .await;
        let body = reply.error.unwrap();
        assert_eq!(body.field.as_deref(), Some("op.op[0].p"));
        assert_eq!(session.phase(), SessionPhase::Active);
        assert_eq!(core.stats.read().await.malformed_frames, 2);
    }

    #[tokio::test]
    async fn test_concurrent_same_path_submits_conflict() {
        let core = core().await;
        let (mut first, _r1) = open(&core, "u1").await;
        let (mut second, _r2) = open(&core, "u2").await;

        let ack = one(&mut first, submit("A", 0, "Bob")).await;
        assert_eq!(ack.kind, "ack");
        assert_eq!(ack.data.unwrap()["v"], 1);

        let rejected = one(&mut second, submit("A", 0, "Alice")).await;
        assert_eq!(rejected.kind, "error");
        let body = rejected.error.unwrap();
        assert_eq!(body.kind, "version_conflict");
        assert_eq!(body.current_version, Some(1));
        assert_eq!(body.ops.unwrap().len(), 1);

        let snap = one(&mut second, json!({"type": "get", "collection": "c", "id": "d"})).await;
        let data = snap.data.unwrap();
        assert_eq!(data["v"], 1);
        assert_eq!(data["data"], json!({"name": "Bob"}));
    }

    #[tokio::test]
    async fn test_commit_is_pushed_to_other_subscribers_only() {
        let core = core().await;
        let (mut writer, mut writer_rx) = open(&core, "w").await;
        let (mut reader, mut reader_rx) = open(&core, "r").await;
        for s in [&mut writer, &mut reader] {
            let ok = one(s, json!({"type": "subscribe", "collection": "c"})).await;
            assert_eq!(ok.kind, "subscribed");
        }

        one(&mut writer, submit("W", 0, "x")).await;
        let event = pushed(&mut reader_rx).await;
        assert_eq!(event.kind, "op");
        assert_eq!(event.data.unwrap()["op"][0]["oi"], "x");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), writer_rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_subscribe_with_version_replays_missed_ops() {
        let core = core().await;
        let (mut writer, _w) = open(&core, "w").await;
        one(&mut writer, submit("W", 0, "a")).await;
        one(&mut writer, submit("W", 1, "b")).await;

        let (mut late, _l) = open(&core, "late").await;
        let frames = late
            .handle_text(&json!({"type": "subscribe", "collection": "c", "id": "d", "v": 1}).to_string())
            .await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, "subscribed");
        let replayed = frames[1].data.as_ref().unwrap();
        assert_eq!(replayed["v"], 1);
        assert_eq!(replayed["op"][0]["oi"], "b");
    }

    #[tokio::test]
    async fn test_legacy_submit_applies_at_latest() {
        let core = core().await;
        let (mut s, _rx) = open(&core, "u").await;
        one(&mut s, submit("A", 0, "first")).await;

        let ack = one(
            &mut s,
            json!({"type": "submit", "collection": "c", "document": "d",
                   "operation": [{"p": ["count"], "t": "number", "o": 3}]}),
        )
        .await;
        assert_eq!(ack.kind, "ack");
        let data = ack.data.unwrap();
        assert_eq!(data["v"], 2);
        assert_eq!(data["src"], s.handle().session_id.as_str());
    }

    #[tokio::test]
    async fn test_query_and_unsubscribe() {
        let core = core().await;
        let (mut s, _rx) = open(&core, "u").await;
        one(&mut s, submit("A", 0, "Bob")).await;

        let result = one(
            &mut s,
            json!({"type": "query", "collection": "c", "query": {"name": "Bob"}}),
        )
        .await;
        assert_eq!(result.kind, "queryResult");
        assert_eq!(result.data.unwrap().as_array().unwrap().len(), 1);

        one(&mut s, json!({"type": "subscribe", "collection": "c", "document": "d"})).await;
        let gone = one(&mut s, json!({"type": "unsubscribe", "collection": "c", "document": "d"})).await;
        assert_eq!(gone.data.unwrap()["removed"], 1);
        assert_eq!(core.registry.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_announces_offline_presence() {
        let core = core().await;
        let (mut leaving, _l) = open(&core, "leaver").await;
        let (mut watcher, mut watcher_rx) = open(&core, "watcher").await;
        one(&mut watcher, json!({"type": "subscribe", "collection": "c", "id": "d"})).await;
        one(&mut leaving, json!({"type": "subscribe", "collection": "c"})).await;

        let none = leaving
            .handle_text(&json!({"type": "presence", "collection": "c", "id": "d", "data": {"cursor": 3}}).to_string())
            .await;
        assert!(none.is_empty());
        let online = pushed(&mut watcher_rx).await;
        assert_eq!(online.kind, "presence");
        assert_eq!(online.data.unwrap()["status"], "online");

        leaving.close().await;
        assert_eq!(leaving.phase(), SessionPhase::Closed);
        let offline = pushed(&mut watcher_rx).await;
        assert_eq!(offline.data.unwrap()["status"], "offline");
        assert_eq!(core.registry.session_count().await, 1);
        assert!(leaving.handle_text(r#"{"type":"ping","timestamp":1}"#).await.is_empty());
    }
}
