//! Session and subscription registry.
//!
//! Every connected session registers once and receives a monotonically
//! increasing registration number. Subscriptions are indexed by target
//! `(collection, document?)`; lookups merge the exact target with the
//! collection-wide one and return sessions in registration order.
//!
//! ```text
//!   ("record_t1", Some("rec1")) ──▶ {3: S3}
//!   ("record_t1", None)         ──▶ {1: S1, 3: S3}
//!
//!   matching_sessions("record_t1", Some("rec1")) = [S1, S3]
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use weft_core::DocKey;

/// Identifies one subscription of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// `(collection, document?)`; `None` subscribes to the whole collection.
pub type Target = (String, Option<String>);

/// A registered session as seen by fan-out.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Server-assigned connection id.
    pub id: Uuid,
    pub user_id: String,
    /// Client-chosen session id from the handshake.
    pub session_id: String,
    order: u64,
    outbound: mpsc::Sender<Arc<str>>,
}

impl SessionHandle {
    /// Registration order; lower registered earlier.
    pub fn order(&self) -> u64 {
        self.order
    }

    /// Queues a frame without waiting. Returns `false` if the session is
    /// gone or its outbound buffer is full; the frame is dropped.
    pub fn send(&self, frame: Arc<str>) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "session {} ({}) outbound buffer full, dropping frame",
                    self.id,
                    self.user_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Whether `exclude` names this session, by connection id or by
    /// client session id.
    pub fn is_excluded(&self, exclude: &[String]) -> bool {
        exclude
            .iter()
            .any(|e| *e == self.session_id || Uuid::parse_str(e).is_ok_and(|id| id == self.id))
    }
}

/// Presence change for one user on one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub collection: String,
    pub document: String,
    pub user_id: String,
    pub session_id: String,
    pub status: String,
    #[serde(default)]
    pub data: Value,
    pub last_seen: DateTime<Utc>,
}

impl PresenceEvent {
    pub fn key(&self) -> DocKey {
        DocKey::new(&self.collection, &self.document)
    }
}

struct SessionEntry {
    handle: SessionHandle,
    subscriptions: HashMap<SubscriptionId, Target>,
    presence: HashMap<DocKey, PresenceEvent>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, SessionEntry>,
    /// target -> registration order -> (session, subscription count)
    index: HashMap<Target, BTreeMap<u64, (Uuid, usize)>>,
    owners: HashMap<SubscriptionId, Uuid>,
    next_order: u64,
    next_subscription: u64,
}

impl Inner {
    fn index_add(&mut self, target: Target, order: u64, session: Uuid) {
        self.index
            .entry(target)
            .or_default()
            .entry(order)
            .or_insert((session, 0))
            .1 += 1;
    }

    fn index_remove(&mut self, target: &Target, order: u64) {
        if let Some(by_order) = self.index.get_mut(target) {
            if let Some(entry) = by_order.get_mut(&order) {
                entry.1 -= 1;
                if entry.1 == 0 {
                    by_order.remove(&order);
                }
            }
            if by_order.is_empty() {
                self.index.remove(target);
            }
        }
    }

    fn handles(&self, ids: impl Iterator<Item = Uuid>) -> Vec<SessionHandle> {
        ids
            .filter_map(|id| self.sessions.get(&id).map(|e| e.handle.clone()))
            .collect()
    }
}

/// Shared registry of live sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session and returns its handle.
    pub async fn register(
        &self,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        outbound: mpsc::Sender<Arc<str>>,
    ) -> SessionHandle {
        let mut inner = self.inner.write().await;
        inner.next_order += 1;
        let handle = SessionHandle {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            order: inner.next_order,
            outbound,
        };
        inner.sessions.insert(
            handle.id,
            SessionEntry {
                handle: handle.clone(),
                subscriptions: HashMap::new(),
                presence: HashMap::new(),
            },
        );
        log::debug!("registered session {} for user {}", handle.id, handle.user_id);
        handle
    }

    /// Subscribes `session` to `(collection, document?)`. Returns `None`
    /// if the session is not registered.
    pub async fn subscribe(
        &self,
        session: Uuid,
        collection: &str,
        document: Option<&str>,
    ) -> Option<SubscriptionId> {
        let mut inner = self.inner.write().await;
        inner.next_subscription += 1;
        let id = SubscriptionId(inner.next_subscription);
        let target: Target = (collection.to_string(), document.map(str::to_string));

        let entry = inner.sessions.get_mut(&session)?;
        let order = entry.handle.order;
        entry.subscriptions.insert(id, target.clone());
        inner.owners.insert(id, session);
        inner.index_add(target, order, session);
        Some(id)
    }

    /// Removes one subscription. Returns `false` if it did not exist.
    pub async fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.owners.remove(&subscription) else {
            return false;
        };
        let Some(entry) = inner.sessions.get_mut(&session) else {
            return false;
        };
        let order = entry.handle.order;
        match entry.subscriptions.remove(&subscription) {
            Some(target) => {
                inner.index_remove(&target, order);
                true
            }
            None => false,
        }
    }

    /// Removes every subscription `session` holds on exactly this target.
    pub async fn unsubscribe_matching(
        &self,
        session: Uuid,
        collection: &str,
        document: Option<&str>,
    ) -> usize {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.sessions.get_mut(&session) else {
            return 0;
        };
        let order = entry.handle.order;
        let ids: Vec<SubscriptionId> = entry
            .subscriptions
            .iter()
            .filter(|(_, (c, d))| c == collection && d.as_deref() == document)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            entry.subscriptions.remove(id);
        }
        let target: Target = (collection.to_string(), document.map(str::to_string));
        for id in &ids {
            inner.owners.remove(id);
            inner.index_remove(&target, order);
        }
        ids.len()
    }

    /// Sessions subscribed to `(collection, document)` or to the whole
    /// collection, in registration order, each at most once. With
    /// `document == None` only collection-wide subscribers match.
    pub async fn matching_sessions(
        &self,
        collection: &str,
        document: Option<&str>,
    ) -> Vec<SessionHandle> {
        let inner = self.inner.read().await;
        let mut merged: BTreeMap<u64, Uuid> = BTreeMap::new();
        let wide: Target = (collection.to_string(), None);
        if let Some(by_order) = inner.index.get(&wide) {
            merged.extend(by_order.iter().map(|(order, (id, _))| (*order, *id)));
        }
        if let Some(doc) = document {
            let exact: Target = (collection.to_string(), Some(doc.to_string()));
            if let Some(by_order) = inner.index.get(&exact) {
                merged.extend(by_order.iter().map(|(order, (id, _))| (*order, *id)));
            }
        }
        inner.handles(merged.into_values())
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<SessionHandle> {
        let inner = self.inner.read().await;
        let mut handles: Vec<SessionHandle> = inner
            .sessions
            .values()
            .filter(|e| e.handle.user_id == user_id)
            .map(|e| e.handle.clone())
            .collect();
        handles.sort_by_key(SessionHandle::order);
        handles
    }

    pub async fn all_sessions(&self) -> Vec<SessionHandle> {
        let inner = self.inner.read().await;
        let mut handles: Vec<SessionHandle> =
            inner.sessions.values().map(|e| e.handle.clone()).collect();
        handles.sort_by_key(SessionHandle::order);
        handles
    }

    /// Replaces the session's presence on `key`. Returns the event to fan
    /// out, or `None` if the session is not registered.
    pub async fn update_presence(
        &self,
        session: Uuid,
        key: &DocKey,
        status: Option<String>,
        data: Value,
    ) -> Option<PresenceEvent> {
        let mut inner = self.inner.write().await;
        let entry = inner.sessions.get_mut(&session)?;
        let event = PresenceEvent {
            collection: key.collection.clone(),
            document: key.id.clone(),
            user_id: entry.handle.user_id.clone(),
            session_id: entry.handle.session_id.clone(),
            status: status.unwrap_or_else(|| "online".to_string()),
            data,
            last_seen: Utc::now(),
        };
        entry.presence.insert(key.clone(), event.clone());
        Some(event)
    }

    /// Current presence entries on `key`, in registration order.
    pub async fn presence_on(&self, key: &DocKey) -> Vec<PresenceEvent> {
        let inner = self.inner.read().await;
        let mut entries: Vec<(u64, PresenceEvent)> = inner
            .sessions
            .values()
            .filter_map(|e| e.presence.get(key).map(|p| (e.handle.order, p.clone())))
            .collect();
        entries.sort_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, p)| p).collect()
    }

    /// Drops the session with all its subscriptions. Returns an `offline`
    /// presence event for every document it held presence on.
    pub async fn remove_session(&self, session: Uuid) -> Vec<PresenceEvent> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.sessions.remove(&session) else {
            return Vec::new();
        };
        let order = entry.handle.order;
        for (id, target) in &entry.subscriptions {
            inner.owners.remove(id);
            inner.index_remove(target, order);
        }
        log::debug!(
            "removed session {} ({} subscriptions)",
            session,
            entry.subscriptions.len()
        );

        let now = Utc::now();
        let mut offline: Vec<PresenceEvent> = entry
            .presence
            .into_values()
            .map(|mut p| {
                p.status = "offline".to_string();
                p.data = Value::Null;
                p.last_seen = now;
                p
            })
            .collect();
        offline.sort_by(|a, b| a.key().cmp(&b.key()));
        offline
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.read().await.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn register(registry: &SessionRegistry, user: &str) -> (SessionHandle, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(8);
        (registry.register(user, format!("{user}-session"), tx).await, rx)
    }

    fn ids(handles: &[SessionHandle]) -> Vec<Uuid> {
        handles.iter().map(|h| h.id).collect()
    }

    #[tokio::test]
    async fn test_collection_wide_subscription_matches_documents() {
        let registry = SessionRegistry::new();
        let (a, _ra) = register(&registry, "a").await;
        let (b, _rb) = register(&registry, "b").await;

        registry.subscribe(a.id, "record_table_001", None).await.unwrap();
        registry.subscribe(b.id, "other", None).await.unwrap();

        let hits = registry
            .matching_sessions("record_table_001", Some("record_001"))
            .await;
        assert_eq!(ids(&hits), vec![a.id]);
        assert!(registry.matching_sessions("other_x", Some("record_001")).await.is_empty());
    }

    #[tokio::test]
    async fn test_registration_order_and_dedup() {
        let registry = SessionRegistry::new();
        let (a, _ra) = register(&registry, "a").await;
        let (b, _rb) = register(&registry, "b").await;
        let (c, _rc) = register(&registry, "c").await;

        registry.subscribe(c.id, "coll", Some("doc")).await.unwrap();
        registry.subscribe(a.id, "coll", Some("doc")).await.unwrap();
        registry.subscribe(a.id, "coll", None).await.unwrap();
        registry.subscribe(b.id, "coll", None).await.unwrap();

        let hits = registry.matching_sessions("coll", Some("doc")).await;
        assert_eq!(ids(&hits), vec![a.id, b.id, c.id]);

        let wide = registry.matching_sessions("coll", None).await;
        assert_eq!(ids(&wide), vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_unsubscribe_by_id_and_by_target() {
        let registry = SessionRegistry::new();
        let (a, _ra) = register(&registry, "a").await;

        let first = registry.subscribe(a.id, "coll", Some("doc")).await.unwrap();
        let second = registry.subscribe(a.id, "coll", Some("doc")).await.unwrap();
        assert_ne!(first, second);

        assert!(registry.unsubscribe(first).await);
        assert!(!registry.unsubscribe(first).await);
        assert_eq!(registry.matching_sessions("coll", Some("doc")).await.len(), 1);

        registry.subscribe(a.id, "coll", None).await.unwrap();
        assert_eq!(registry.unsubscribe_matching(a.id, "coll", Some("doc")).await, 1);
        assert_eq!(registry.subscription_count().await, 1);
        assert!(!registry.unsubscribe(second).await);
    }

    #[tokio::test]
    async fn test_presence_overwrites_and_goes_offline_on_remove() {
        let registry = SessionRegistry::new();
        let (a, _ra) = register(&registry, "alice").await;
        let key = DocKey::new("coll", "doc");

        registry
            .update_presence(a.id, &key, None, json!({"cursor": 1}))
            .await
            .unwrap();
        let latest = registry
            .update_presence(a.id, &key, Some("typing".into()), json!({"cursor": 4}))
            .await
            .unwrap();
        assert_eq!(latest.status, "typing");

        let present = registry.presence_on(&key).await;
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].data, json!({"cursor": 4}));

        registry.subscribe(a.id, "coll", None).await.unwrap();
        let offline = registry.remove_session(a.id).await;
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].status, "offline");
        assert_eq!(offline[0].user_id, "alice");
        assert_eq!(registry.subscription_count().await, 0);
        assert!(registry.matching_sessions("coll", Some("doc")).await.is_empty());
        assert!(registry.remove_session(a.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_exclusion_by_either_id() {
        let registry = SessionRegistry::new();
        let (a, _ra) = register(&registry, "a").await;
        assert!(a.is_excluded(&["a-session".to_string()]));
        assert!(a.is_excluded(&[a.id.to_string()]));
        assert!(!a.is_excluded(&["someone-else".to_string()]));
    }

    #[tokio::test]
    async fn test_full_outbound_buffer_drops() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = registry.register("u", "s", tx).await;
        assert!(handle.send(Arc::from("one")));
        assert!(!handle.send(Arc::from("two")));
        assert_eq!(&*rx.recv().await.unwrap(), "one");
    }

    #[tokio::test]
    async fn test_sessions_for_user() {
        let registry = SessionRegistry::new();
        let (a1, _r1) = register(&registry, "alice").await;
        let (_b, _r2) = register(&registry, "bob").await;
        let (a2, _r3) = register(&registry, "alice").await;
        assert_eq!(ids(&registry.sessions_for_user("alice").await), vec![a1.id, a2.id]);
        assert_eq!(registry.all_sessions().await.len(), 3);
    }
}
