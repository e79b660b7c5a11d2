//! One actor task per document and instance.
//!
//! ```text
//!   gateway ──Submit──▶ ┌──────────────────┐
//!   gateway ──Read────▶ │ DocumentActor    │ locks the SharedLog per command
//!   gateway ──Snapshot▶ │ (mpsc mailbox)   │ processes one command at a time
//!                       └──────────────────┘
//! ```
//!
//! Commands for a document are serialised through its mailbox, and the
//! log itself comes from a [`LogStore`] that several arenas may share.
//! Commits to one document are totally ordered across every instance
//! using the store while different documents proceed in parallel. A
//! submit that has been accepted into the mailbox is applied even if the
//! caller stops waiting for the reply.

use crate::error::{AppendError, ArenaError};
use crate::operation::{CommitRecord, DocKey, Operation, Snapshot};
use crate::oplog::LogRange;
use crate::query::Query;
use crate::store::{LogStore, MemoryLogStore, SharedLog};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{mpsc, oneshot, RwLock};

/// Mailbox depth per document actor.
pub const DEFAULT_MAILBOX: usize = 64;

enum Command {
    Submit {
        op: Operation,
        at_latest: bool,
        reply: oneshot::Sender<Result<CommitRecord, AppendError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Read {
        from: u64,
        reply: oneshot::Sender<LogRange>,
    },
}

/// Cloneable handle to a running document actor.
#[derive(Clone)]
pub struct DocumentHandle {
    key: DocKey,
    tx: mpsc::Sender<Command>,
}

impl DocumentHandle {
    fn spawn(key: DocKey, log: SharedLog, mailbox: usize) -> Self {
        let (tx, rx) = mpsc::channel(mailbox);
        tokio::spawn(run_actor(key.clone(), log, rx));
        Self { key, tx }
    }

    pub fn key(&self) -> &DocKey {
        &self.key
    }

    /// Submits `op` against its own base version `op.v`, rebasing if the
    /// document moved on.
    pub async fn submit(&self, op: Operation) -> Result<CommitRecord, ArenaError> {
        self.submit_inner(op, false).await
    }

    /// Submits `op` against whatever version is current when the actor
    /// picks it up. Used for writers that do not track versions.
    pub async fn submit_latest(&self, op: Operation) -> Result<CommitRecord, ArenaError> {
        self.submit_inner(op, true).await
    }

    async fn submit_inner(&self, op: Operation, at_latest: bool) -> Result<CommitRecord, ArenaError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            op,
            at_latest,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| self.gone())??)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, ArenaError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| self.gone())
    }

    pub async fn read(&self, from: u64) -> Result<LogRange, ArenaError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Read { from, reply }).await?;
        rx.await.map_err(|_| self.gone())
    }

    async fn send(&self, cmd: Command) -> Result<(), ArenaError> {
        self.tx.send(cmd).await.map_err(|_| self.gone())
    }

    fn gone(&self) -> ArenaError {
        ArenaError::Unavailable(self.key.clone())
    }
}

async fn run_actor(key: DocKey, shared: SharedLog, mut rx: mpsc::Receiver<Command>) {
    log::debug!("document actor {} started", key);
    while let Some(cmd) = rx.recv().await {
        let mut log = shared.lock().unwrap_or_else(PoisonError::into_inner);
        match cmd {
            Command::Submit {
                mut op,
                at_latest,
                reply,
            } => {
                if at_latest {
                    op.v = log.version();
                }
                let result = log.submit(op);
                if let Err(e) = &result {
                    log::debug!("{}: submit rejected: {}", key, e);
                }
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(log.snapshot());
            }
            Command::Read { from, reply } => {
                let _ = reply.send(log.read(from));
            }
        }
    }
    log::debug!("document actor {} stopped", key);
}

fn snapshot_of(log: &SharedLog) -> Snapshot {
    log.lock().unwrap_or_else(PoisonError::into_inner).snapshot()
}

/// Registry of this instance's document actors, created on first use.
pub struct DocumentArena {
    documents: Arc<RwLock<HashMap<DocKey, DocumentHandle>>>,
    store: Arc<dyn LogStore>,
    mailbox: usize,
}

impl Default for DocumentArena {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX)
    }
}

impl DocumentArena {
    /// Arena over a private in-memory store.
    pub fn new(mailbox: usize) -> Self {
        Self::with_store(Arc::new(MemoryLogStore::new()), mailbox)
    }

    /// Arena over `store`, which other arenas may share.
    pub fn with_store(store: Arc<dyn LogStore>, mailbox: usize) -> Self {
        log::debug!("document arena using {} log store", store.name());
        Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
            store,
            mailbox: mailbox.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Get the actor for `key`, spawning it on first use.
    pub async fn get_or_spawn(&self, key: &DocKey) -> DocumentHandle {
        {
            let documents = self.documents.read().await;
            if let Some(handle) = documents.get(key) {
                return handle.clone();
            }
        }

        let mut documents = self.documents.write().await;
        if let Some(handle) = documents.get(key) {
            return handle.clone();
        }

        let log = self.store.open(key);
        let handle = DocumentHandle::spawn(key.clone(), log, self.mailbox);
        documents.insert(key.clone(), handle.clone());
        handle
    }

    /// The actor for `key` if the document has a log in the store. A
    /// document first written through another arena gets a local actor
    /// here.
    pub async fn get(&self, key: &DocKey) -> Option<DocumentHandle> {
        let local = self.documents.read().await.get(key).cloned();
        if local.is_some() {
            return local;
        }
        self.store.get(key)?;
        Some(self.get_or_spawn(key).await)
    }

    /// Snapshot of `key`; documents never touched report version 0 and
    /// no type, without spawning an actor.
    pub async fn snapshot(&self, key: &DocKey) -> Result<Snapshot, ArenaError> {
        let local = self.documents.read().await.get(key).cloned();
        if let Some(handle) = local {
            return handle.snapshot().await;
        }
        Ok(match self.store.get(key) {
            Some(log) => snapshot_of(&log),
            None => Snapshot {
                id: key.id.clone(),
                v: 0,
                doc_type: None,
                data: serde_json::Value::Null,
            },
        })
    }

    /// Runs `query` over every stored document of `collection`.
    pub async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Snapshot>, ArenaError> {
        let snapshots: Vec<Snapshot> = self
            .store
            .keys(collection)
            .iter()
            .filter_map(|key| self.store.get(key))
            .map(|log| snapshot_of(&log))
            .collect();
        Ok(query.run(snapshots))
    }

    /// Number of documents with a running actor on this instance.
    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::path;
    use serde_json::json;

    fn key() -> DocKey {
        DocKey::new("record_tbl", "rec1")
    }

    #[tokio::test]
    async fn test_get_or_spawn_reuses_actor() {
        let arena = DocumentArena::default();
        let a = arena.get_or_spawn(&key()).await;
        let b = arena.get_or_spawn(&key()).await;
        assert!(a.tx.same_channel(&b.tx));
        assert_eq!(arena.document_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_submits_are_totally_ordered() {
        let arena = Arc::new(DocumentArena::default());
        let mut tasks = Vec::new();
        for i in 0..20u64 {
            let arena = arena.clone();
            tasks.push(tokio::spawn(async move {
                let doc = arena.get_or_spawn(&key()).await;
                let op = Operation::edit(
                    format!("s{i:02}"),
                    1,
                    0,
                    vec![Component::set(path![format!("f{i}")], json!(i))],
                );
                doc.submit(op).await
            }));
        }
        let mut versions = Vec::new();
        for t in tasks {
            versions.push(t.await.unwrap().unwrap().version);
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=20).collect::<Vec<_>>());

        let snap = arena.snapshot(&key()).await.unwrap();
        assert_eq!(snap.v, 20);
        assert_eq!(snap.data.as_object().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_submit_latest_ignores_stale_version() {
        let arena = DocumentArena::default();
        let doc = arena.get_or_spawn(&key()).await;
        doc.submit_latest(Operation::edit("a", 1, 0, vec![Component::set(path!["x"], json!(1))]))
            .await
            .unwrap();
        let rec = doc
            .submit_latest(Operation::edit("a", 2, 0, vec![Component::set(path!["x"], json!(2))]))
            .await
            .unwrap();
        assert_eq!(rec.version, 2);
        assert_eq!(doc.snapshot().await.unwrap().data, json!({"x": 2}));
    }

    #[tokio::test]
    async fn test_dropped_caller_still_commits() {
        let arena = DocumentArena::default();
        let doc = arena.get_or_spawn(&key()).await;
        let pending = {
            let doc = doc.clone();
            tokio::spawn(async move {
                doc.submit(Operation::edit("a", 1, 0, vec![Component::set(path!["x"], json!(1))]))
                    .await
            })
        };
        tokio::task::yield_now().await;
        pending.abort();
        let _ = pending.await;

        // Snapshot goes through the same mailbox, so it observes the submit
        // if the submit was enqueued first.
        let snap = doc.snapshot().await.unwrap();
        assert!(snap.v <= 1);
        let log: Vec<_> = doc.read(0).await.unwrap().collect();
        assert_eq!(log.len() as u64, snap.v);
    }

    #[tokio::test]
    async fn test_unknown_document_snapshot_is_empty() {
        let arena = DocumentArena::default();
        let snap = arena.snapshot(&DocKey::new("c", "missing")).await.unwrap();
        assert_eq!(snap.v, 0);
        assert!(!snap.exists());
        assert_eq!(arena.document_count().await, 0);
    }

    #[tokio::test]
    async fn test_query_covers_only_the_collection() {
        let arena = DocumentArena::default();
        for (coll, id, n) in [("a", "1", 1), ("a", "2", 2), ("b", "3", 3)] {
            arena
                .get_or_spawn(&DocKey::new(coll, id))
                .await
                .submit(Operation::create("s", 1, "json0", json!({ "n": n })))
                .await
                .unwrap();
        }
        let hits = arena.query("a", &Query::default()).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "1");
    }

    #[tokio::test]
    async fn test_arenas_sharing_a_store_see_one_history() {
        let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
        let a = DocumentArena::with_store(store.clone(), DEFAULT_MAILBOX);
        let b = DocumentArena::with_store(store, DEFAULT_MAILBOX);

        assert!(b.get(&key()).await.is_none());
        a.get_or_spawn(&key())
            .await
            .submit(Operation::edit("a", 1, 0, vec![Component::set(path!["x"], json!(1))]))
            .await
            .unwrap();

        assert_eq!(b.snapshot(&key()).await.unwrap().data, json!({"x": 1}));
        let on_b = b.get(&key()).await.unwrap();
        assert_eq!(on_b.snapshot().await.unwrap().v, 1);

        // A same-path write from b's side against v0 loses the tie-break.
        let err = on_b
            .submit(Operation::edit("b", 1, 0, vec![Component::set(path!["x"], json!(2))]))
            .await
            .unwrap_err();
        match err {
            ArenaError::Append(AppendError::VersionConflict {
                current_version,
                missing,
            }) => {
                assert_eq!(current_version, 1);
                assert_eq!(missing.len(), 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(a.snapshot(&key()).await.unwrap().v, 1);
        assert_eq!(b.query("record_tbl", &Query::default()).await.unwrap().len(), 1);
    }
}
