//! Document model for weft: JSON documents, operations, operational
//! transformation and the per-document operation log.
//!
//! ```text
//!   Operation ──▶ DocumentArena ──▶ DocumentActor ──▶ OperationLog
//!                  (one actor per      │                 │  (opened from a
//!                   (collection, id))  │ transform       │   shared LogStore)
//!                                      ▼                 ▼
//!                                   OtEngine          CommitRecord
//! ```
//!
//! Nothing in this crate does network I/O. `weft-collab` wires it to
//! WebSocket sessions and the cross-instance message bus.

pub mod arena;
pub mod component;
pub mod error;
pub mod operation;
pub mod oplog;
pub mod ot;
pub mod path;
pub mod query;
pub mod store;

pub use arena::{DocumentArena, DocumentHandle};
pub use component::{Component, Edit, EditKind};
pub use error::{AppendError, ArenaError, OtError};
pub use operation::{CommitRecord, DocKey, OpKind, Operation, Snapshot, DEFAULT_DOC_TYPE};
pub use oplog::{LogRange, OperationLog};
pub use ot::{DocState, OtEngine};
pub use path::{Path, PathDisplay, PathSegment};
pub use query::{Query, SortField, SortOrder};
pub use store::{LogStore, MemoryLogStore, SharedLog};
