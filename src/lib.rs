//! Strata — a versioned, branchable object store with optimistic
//! transactions and changeset replication.
//!
//! Every commit allocates an immutable revision; past revisions stay
//! queryable forever through historic [`ObjectKey`]s. Branches fork the
//! store (wholly or per type, with non-branched types shining through from
//! the base), sessions mutate through nested transactions with
//! first-committer-wins conflict detection, and committed revisions replay
//! onto secondary stores as changesets.
//!
//! # Architecture
//!
//! - **Storage**: SQLite; every committed state is a half-open revision
//!   window, so point-in-time reads are plain range lookups
//! - **Concurrency**: one writer at a time, optimistic validation at commit,
//!   lock-free snapshot reads at a session's observed revision
//! - **Replication**: committed revisions stream as serde-serializable
//!   changesets and replay verbatim on replicas
//!
//! # Modules
//!
//! - [`config`] — Configuration loading from TOML files and environment variables
//! - [`db`] — SQLite database initialization and schema
//! - [`error`] — The error taxonomy shared by every operation
//! - [`meta`] — Type repository: item types, attributes, reference axes
//! - [`store`] — The core engine: keys, branches, sessions, transactions
//! - [`event`] — Changesets: reading, diffing, and applying them
//!
//! [`ObjectKey`]: store::key::ObjectKey

pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod meta;
pub mod store;

pub use config::StrataConfig;
pub use error::{ErrorKind, Result, StrataError};
pub use event::{ChangeSet, EventSource, ItemEvent};
pub use meta::{
    AttributeKind, BranchScope, DeletionPolicy, HistoryType, ReferenceSpec, TypeBuilder,
    TypeRepository, ValueKind,
};
pub use store::cache::{AssociationEnd, LinkQuery};
pub use store::key::{BranchId, HistoryContext, ObjectId, ObjectKey, TRUNK};
pub use store::read::StoredItem;
pub use store::revision::{Revision, RevisionInfo};
pub use store::session::{CommitInfo, CommitParticipant, Session};
pub use store::value::{RefTarget, Value};
pub use store::KnowledgeBase;
