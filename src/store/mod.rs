//! Core engine — the [`KnowledgeBase`] handle and its submodules.
//!
//! A `KnowledgeBase` owns the backing SQLite connection, the revision
//! counter, the shared association cache, and the registered commit
//! participants. Handles are cheap to clone and shareable across threads;
//! per-thread mutation happens through [`Session`](session::Session) values
//! obtained from [`KnowledgeBase::session`], which are deliberately not
//! `Send`.

pub mod branch;
pub mod cache;
pub(crate) mod flex;
pub(crate) mod item;
pub mod key;
pub mod read;
pub mod revision;
pub mod session;
pub mod value;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::config::StrataConfig;
use crate::error::{Result, StrataError};
use crate::event::{BranchEvent, ChangeSet, EventSource};
use crate::meta::TypeRepository;
use crate::store::branch::{insert_branch, load_branch, new_branch, next_branch_id, Branch};
use crate::store::cache::AssociationCache;
use crate::store::item::{insert_version, max_object_id, VersionRow, HEAD_REV};
use crate::store::key::{BranchId, ObjectId, ObjectKey, TRUNK};
use crate::store::read::{resolve_item, StoredItem};
use crate::store::revision::{insert_revision, max_revision, Revision, RevisionInfo};
use crate::store::session::{CommitParticipant, Session};

pub(crate) struct KbInner {
    pub(crate) types: Arc<TypeRepository>,
    pub(crate) conn: Mutex<Connection>,
    /// Serializes revision assignment, persistence, and event publication.
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) last_rev: AtomicU64,
    pub(crate) next_id: AtomicU64,
    pub(crate) cache: Mutex<AssociationCache>,
    pub(crate) participants: Mutex<Vec<Box<dyn CommitParticipant>>>,
}

/// A versioned, branchable object store.
///
/// All state is instance-owned; independent stores can coexist in one
/// process (and do, in the replication tests).
#[derive(Clone)]
pub struct KnowledgeBase {
    pub(crate) inner: Arc<KbInner>,
}

impl KnowledgeBase {
    /// Open (or create) a store at the configured database path.
    pub fn open(config: &StrataConfig, types: TypeRepository) -> Result<Self> {
        let conn = crate::db::open_database(config.resolved_db_path()).map_err(StrataError::Init)?;
        Self::from_connection(conn, types)
    }

    /// Open a fresh in-memory store. Used by tests and replicas.
    pub fn open_in_memory(types: TypeRepository) -> Result<Self> {
        let conn = crate::db::open_memory_database().map_err(StrataError::Init)?;
        Self::from_connection(conn, types)
    }

    fn from_connection(conn: Connection, types: TypeRepository) -> Result<Self> {
        let last_rev = max_revision(&conn)?;
        let next_id = max_object_id(&conn)?;
        Ok(Self {
            inner: Arc::new(KbInner {
                types: Arc::new(types),
                conn: Mutex::new(conn),
                commit_lock: Mutex::new(()),
                last_rev: AtomicU64::new(last_rev),
                next_id: AtomicU64::new(next_id),
                cache: Mutex::new(AssociationCache::default()),
                participants: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn types(&self) -> &TypeRepository {
        &self.inner.types
    }

    /// Latest committed revision, `Revision::INITIAL` for an empty store.
    pub fn last_revision(&self) -> Revision {
        Revision(self.inner.last_rev.load(Ordering::SeqCst))
    }

    /// Commit metadata of a revision, `None` if never allocated.
    pub fn revision_info(&self, rev: Revision) -> Result<Option<RevisionInfo>> {
        self.with_conn(|conn| revision::load_revision(conn, rev))
    }

    pub fn trunk(&self) -> Result<Branch> {
        self.branch(TRUNK)?
            .ok_or(StrataError::UnknownBranch(TRUNK.0))
    }

    pub fn branch(&self, id: BranchId) -> Result<Option<Branch>> {
        self.with_conn(|conn| load_branch(conn, id))
    }

    /// Open a session bound to the calling thread.
    pub fn session(&self, author: &str) -> Session {
        Session::new(self.clone(), author)
    }

    /// Register a two-phase commit participant, consulted by every
    /// subsequent commit.
    pub fn register_participant(&self, participant: Box<dyn CommitParticipant>) {
        self.inner
            .participants
            .lock()
            .expect("participant lock poisoned")
            .push(participant);
    }

    /// Resolve the committed state of a key. Current keys read at the latest
    /// committed revision; absence is `Ok(None)`, never an error.
    pub fn get_item(&self, key: &ObjectKey) -> Result<Option<StoredItem>> {
        let last = self.inner.last_rev.load(Ordering::SeqCst);
        self.with_conn(|conn| {
            resolve_item(
                conn,
                &self.inner.types,
                key.branch,
                key.history,
                &key.type_name,
                key.id,
                last,
                last,
            )
        })
    }

    /// Fork a branch at `at_revision`, restricted to `branched_types`
    /// (`None` branches all versioned types). Allocates a revision and
    /// copies the current state of the branched types onto the new branch.
    pub fn create_branch(
        &self,
        author: &str,
        base: BranchId,
        at_revision: Revision,
        branched_types: Option<&[&str]>,
    ) -> Result<Branch> {
        let types = &self.inner.types;
        let owned: BTreeSet<String> = match branched_types {
            Some(names) => {
                let mut set = BTreeSet::new();
                for name in names {
                    let ty = types.get(name)?;
                    if !ty.versioned {
                        return Err(StrataError::UnversionedBranch(ty.name.clone()));
                    }
                    set.insert(ty.name.clone());
                }
                set
            }
            None => types
                .iter()
                .filter(|t| t.versioned)
                .map(|t| t.name.clone())
                .collect(),
        };

        let _commit = self.inner.commit_lock.lock().expect("commit lock poisoned");
        let last = self.inner.last_rev.load(Ordering::SeqCst);
        if at_revision.0 > last {
            return Err(StrataError::FutureRevision {
                branch: base.0,
                revision: at_revision.0,
            });
        }

        let mut guard = self.inner.conn.lock().expect("connection lock poisoned");
        let conn = &mut *guard;
        if load_branch(conn, base)?.is_none() {
            return Err(StrataError::UnknownBranch(base.0));
        }

        let new_rev = Revision(last + 1);
        let branch_id = next_branch_id(conn)?;
        let branch = new_branch(branch_id, base, at_revision, new_rev, owned);

        let sql_tx = conn.transaction()?;
        insert_revision(
            &sql_tx,
            &RevisionInfo {
                revision: new_rev,
                author: author.to_string(),
                commit_time: chrono::Utc::now().to_rfc3339(),
                log: format!("create branch {branch_id}"),
            },
        )?;
        insert_branch(&sql_tx, &branch)?;
        copy_branched_rows(&sql_tx, types, &branch)?;
        sql_tx.commit()?;

        self.inner.last_rev.store(new_rev.0, Ordering::SeqCst);
        tracing::info!(
            branch = branch_id.0,
            base = base.0,
            at = at_revision.0,
            revision = new_rev.0,
            "branch created"
        );
        Ok(branch)
    }

    /// Pull and apply all changesets the source has beyond this store's
    /// latest revision, then return the new latest revision. Reading the
    /// full batch precedes any application, so a source failure leaves the
    /// visible revision unchanged.
    pub fn refetch(&self, source: &dyn EventSource) -> Result<Revision> {
        crate::event::apply::refetch(self, source)
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.inner.conn.lock().expect("connection lock poisoned");
        f(&guard)
    }

    pub(crate) fn allocate_object_id(&self) -> ObjectId {
        ObjectId(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Apply a committed changeset to the shared association cache.
    pub(crate) fn update_cache(&self, cs: &ChangeSet) {
        let mut cache = self.inner.cache.lock().expect("cache lock poisoned");
        cache.apply_change_set(&self.inner.types, cs);
    }
}

/// Copy the current state of every branched type from the base view at the
/// fork revision onto the new branch. Shared by local branch creation and
/// replicated [`BranchEvent`] application so both sides materialize the same
/// rows.
pub(crate) fn copy_branched_rows(
    conn: &Connection,
    types: &TypeRepository,
    branch: &Branch,
) -> Result<()> {
    let Some(base) = branch.base() else {
        return Ok(());
    };
    let at = branch.base_revision().0;
    for type_name in branch.owned_types() {
        let Some((owning, clamped)) = owning_view(conn, base, type_name, at)? else {
            continue;
        };
        for source in item::rows_at(conn, owning, type_name, clamped)? {
            let copy = VersionRow {
                branch: branch.id(),
                rev_min: branch.create_revision().0,
                rev_max: HEAD_REV,
                ..source.clone()
            };
            insert_version(conn, &copy)?;
            let flex_map = flex::load_flex(conn, owning, type_name, source.obj_id, clamped)?;
            flex::insert_flex(
                conn,
                branch.id(),
                type_name,
                source.obj_id,
                branch.create_revision().0,
                &flex_map,
            )?;
        }
    }
    Ok(())
}

/// The branch physically owning a type's data for a `(branch, rev)` view,
/// with the view revision clamped to each fork point on the way.
pub(crate) fn owning_view(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    rev: u64,
) -> Result<Option<(BranchId, u64)>> {
    let mut current = branch;
    let mut rev = rev;
    loop {
        let Some(b) = load_branch(conn, current)? else {
            return Ok(None);
        };
        if b.owns(type_name) {
            return Ok(Some((current, rev)));
        }
        let Some(base) = b.base() else {
            return Ok(None);
        };
        rev = rev.min(b.base_revision().0);
        current = base;
    }
}

/// Build the branch event describing a branch row, for readers and replay.
pub(crate) fn branch_event(branch: &Branch) -> BranchEvent {
    BranchEvent {
        branch: branch.id(),
        base_branch: branch.base(),
        base_rev: branch.base_revision(),
        branched_types: branch.owned_types().iter().cloned().collect(),
    }
}

/// Re-derive a branch handle from a replicated branch event.
pub(crate) fn branch_from_event(event: &BranchEvent, create_rev: Revision) -> Branch {
    new_branch(
        event.branch,
        event.base_branch.unwrap_or(TRUNK),
        event.base_rev,
        create_rev,
        event.branched_types.iter().cloned().collect(),
    )
}
