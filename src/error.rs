//! Error taxonomy for the knowledge store.
//!
//! Every fallible public operation returns [`StrataError`]. Variants group into
//! five kinds (see [`ErrorKind`]): schema violations, identity violations,
//! optimistic-concurrency conflicts, lifecycle/state violations, and
//! replication-stream violations. Storage and serialization failures pass
//! through from `rusqlite` and `serde_json`.

use thiserror::Error;

use crate::meta::ValueKind;
use crate::store::key::ObjectKey;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Coarse classification of a [`StrataError`].
///
/// Schema and identity errors abort the pending mutation (or the whole commit
/// when detected at commit time). Conflict errors are only ever raised at
/// commit. State errors are programming errors and not recoverable.
/// Replication errors are fatal to the replay stream they occur on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Schema,
    Identity,
    Conflict,
    State,
    Replication,
    Storage,
}

#[derive(Debug, Error)]
pub enum StrataError {
    // --- schema errors ---
    #[error("unknown item type: {0}")]
    UnknownType(String),

    #[error("unknown attribute {type_name}.{attribute}")]
    UnknownAttribute { type_name: String, attribute: String },

    #[error("wrong value type for {attribute}: expected {expected}, got {actual}")]
    ValueType {
        attribute: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("mandatory attribute {type_name}.{attribute} is null at commit")]
    MissingMandatory { type_name: String, attribute: String },

    #[error("unique constraint violated on {type_name}.{attribute}")]
    UniqueViolation { type_name: String, attribute: String },

    #[error("unique is not supported on reference attribute {type_name}.{attribute}")]
    UniqueReference { type_name: String, attribute: String },

    #[error("flex attribute {0} cannot hold a reference value")]
    FlexReference(String),

    #[error("type {0} is unversioned and cannot be branched")]
    UnversionedBranch(String),

    #[error("reference {attribute} does not accept targets of type {actual}")]
    WrongTargetType { attribute: String, actual: String },

    #[error("association {association} may not link versioned and unversioned items")]
    MixedVersioning { association: String },

    // --- identity errors ---
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectKey),

    #[error("reference target not found: {0}")]
    TargetNotFound(ObjectKey),

    #[error("reference target is deleted: {0}")]
    DeletedTarget(ObjectKey),

    #[error("branch-local reference out of scope: {target} postdates fork point of branch {holder_branch}")]
    BranchScope { target: ObjectKey, holder_branch: u64 },

    #[error("revision {revision} is not committed on branch {branch}")]
    FutureRevision { branch: u64, revision: u64 },

    #[error("unknown branch: {0}")]
    UnknownBranch(u64),

    #[error("type {type_name} is not branched onto branch {branch}; mutate it on the owning branch")]
    NotBranched { type_name: String, branch: u64 },

    #[error("deletion of {target} vetoed by referer {referer}")]
    DeleteVetoed { target: ObjectKey, referer: ObjectKey },

    // --- concurrency errors ---
    #[error("commit conflict on {key}: observed revision {observed}, committed revision {committed}")]
    Conflict {
        key: ObjectKey,
        observed: u64,
        committed: u64,
    },

    // --- state errors ---
    #[error("historic object is immutable: {0}")]
    HistoricImmutable(ObjectKey),

    #[error("object already deleted: {0}")]
    AlreadyDeleted(ObjectKey),

    #[error("no open transaction")]
    NoTransaction,

    #[error("transaction already closed")]
    TransactionClosed,

    #[error("nested transaction was rolled back; outer commit refused")]
    TransactionPoisoned,

    #[error("object has never been committed: {0}")]
    NotCommitted(ObjectKey),

    #[error("refresh is not allowed inside an open transaction")]
    RefreshInTransaction,

    // --- replication errors ---
    #[error("out-of-order changeset: revision {got} not after {last}")]
    OutOfOrderChangeSet { last: u64, got: u64 },

    #[error("inconsistent replay at revision {revision}: {detail}")]
    ReplayInconsistent { revision: u64, detail: String },

    // --- passthrough ---
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("commit participant failed in prepare: {0}")]
    PrepareFailed(String),

    #[error("store initialization failed: {0}")]
    Init(#[source] anyhow::Error),
}

impl StrataError {
    /// Coarse kind of this error, used by callers that dispatch on the
    /// taxonomy rather than on individual variants.
    pub fn kind(&self) -> ErrorKind {
        use StrataError::*;
        match self {
            UnknownType(_)
            | UnknownAttribute { .. }
            | ValueType { .. }
            | MissingMandatory { .. }
            | UniqueViolation { .. }
            | UniqueReference { .. }
            | FlexReference(_)
            | UnversionedBranch(_)
            | WrongTargetType { .. }
            | MixedVersioning { .. } => ErrorKind::Schema,
            ObjectNotFound(_)
            | TargetNotFound(_)
            | DeletedTarget(_)
            | BranchScope { .. }
            | FutureRevision { .. }
            | UnknownBranch(_)
            | NotBranched { .. }
            | DeleteVetoed { .. } => ErrorKind::Identity,
            Conflict { .. } => ErrorKind::Conflict,
            HistoricImmutable(_)
            | AlreadyDeleted(_)
            | NoTransaction
            | TransactionClosed
            | TransactionPoisoned
            | NotCommitted(_)
            | RefreshInTransaction => ErrorKind::State,
            OutOfOrderChangeSet { .. } | ReplayInconsistent { .. } => ErrorKind::Replication,
            Storage(_) | Serialization(_) | PrepareFailed(_) | Init(_) => ErrorKind::Storage,
        }
    }
}
