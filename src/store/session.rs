//! Sessions and transactions.
//!
//! A [`Session`] is the single-threaded mutation and navigation surface of a
//! store. It pins an observed revision (stable reads), holds the pending
//! transaction overlay, and commits optimistically: mutations validate
//! eagerly against the session view, conflicts with concurrent committers
//! surface at commit time.
//!
//! Transactions nest as frames. An inner commit folds its changes into the
//! enclosing frame; an inner rollback restores the overlay to the frame start
//! and poisons the transaction, so the outermost commit is refused.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::event::{diff_maps, ChangeSet, EventKey, ItemEvent};
use crate::meta::{
    AttributeKind, BranchScope, DeletionPolicy, HistoryType, ItemType, ValueKind, ASSOC_DEST,
    ASSOC_SOURCE,
};
use crate::store::cache::LinkQuery;
use crate::store::flex::{close_flex_head, delete_flex_rows, insert_flex};
use crate::store::item::{close_head, delete_rows, insert_version, load_head, rows_at, VersionRow, HEAD_REV};
use crate::store::key::{BranchId, HistoryContext, ItemRef, ObjectKey};
use crate::store::read::{
    committed_links, committed_referers, reference_matches, resolve_item, resolve_reference_key,
    split_values, StoredItem,
};
use crate::store::revision::{insert_revision, Revision, RevisionInfo};
use crate::store::value::Value;
use crate::store::KnowledgeBase;

/// Commit summary handed to [`CommitParticipant`]s.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub revision: Revision,
    pub author: String,
    /// Current keys of every object the commit creates, updates, or deletes.
    pub touched: Vec<ObjectKey>,
}

/// An external resource taking part in two-phase commit.
///
/// `prepare` is called for every participant before the store persists
/// anything; a single veto aborts the commit and rolls back the participants
/// already prepared. `commit` is called after the store has durably
/// committed and must not fail.
pub trait CommitParticipant: Send {
    fn prepare(&mut self, info: &CommitInfo) -> std::result::Result<(), String>;
    fn commit(&mut self, info: &CommitInfo);
    fn rollback(&mut self, info: &CommitInfo);
}

/// Committed state of an object as of the session's observed revision,
/// captured when the transaction first touches it.
#[derive(Debug, Clone)]
struct BaseState {
    /// `rev_min` of the observed head window; the optimistic lock.
    last_rev: u64,
    create_rev: Revision,
    creator: String,
    created_at: String,
    row: BTreeMap<String, Value>,
    flex: BTreeMap<String, Value>,
}

/// Transaction-local state of one touched object.
#[derive(Debug, Clone)]
struct LocalObject {
    created_here: bool,
    deleted: bool,
    base: Option<BaseState>,
    row: BTreeMap<String, Value>,
    flex: BTreeMap<String, Value>,
}

impl LocalObject {
    fn merged(&self) -> BTreeMap<String, Value> {
        let mut values = self.flex.clone();
        for (name, value) in &self.row {
            values.insert(name.clone(), value.clone());
        }
        values
    }
}

/// Pre-state journal of one nesting level. Entries record the overlay state
/// of an object before its first mutation in this frame.
#[derive(Debug, Default)]
struct Frame {
    journal: Vec<(ItemRef, Option<LocalObject>)>,
}

#[derive(Debug)]
struct TxState {
    frames: Vec<Frame>,
    objects: HashMap<ItemRef, LocalObject>,
    poisoned: bool,
}

impl TxState {
    fn new() -> Self {
        Self {
            frames: vec![Frame::default()],
            objects: HashMap::new(),
            poisoned: false,
        }
    }
}

/// A single-threaded view of a [`KnowledgeBase`].
///
/// Reads are stable at the session's observed revision until [`refresh`]
/// (or a successful commit) advances it. The session holds a lease on its
/// observed revision, keeping association cache snapshots for it alive.
///
/// [`refresh`]: Session::refresh
pub struct Session {
    kb: KnowledgeBase,
    id: Uuid,
    author: String,
    observed: Cell<u64>,
    tx: RefCell<Option<TxState>>,
    // Sessions are tied to one thread; the raw pointer opts out of Send/Sync.
    _not_send: PhantomData<*mut ()>,
}

impl Session {
    pub(crate) fn new(kb: KnowledgeBase, author: &str) -> Self {
        let observed = kb.inner.last_rev.load(Ordering::SeqCst);
        kb.inner
            .cache
            .lock()
            .expect("cache lock poisoned")
            .acquire(observed);
        let id = Uuid::now_v7();
        tracing::debug!(session = %id, author, observed, "session opened");
        Self {
            kb,
            id,
            author: author.to_string(),
            observed: Cell::new(observed),
            tx: RefCell::new(None),
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    /// The committed revision this session currently reads at.
    pub fn observed_revision(&self) -> Revision {
        Revision(self.observed.get())
    }

    /// Re-pin the session to the latest committed revision. Refused while a
    /// transaction is open.
    pub fn refresh(&self) -> Result<Revision> {
        if self.tx.borrow().is_some() {
            return Err(StrataError::RefreshInTransaction);
        }
        let new = self.kb.inner.last_rev.load(Ordering::SeqCst);
        self.move_lease(new);
        Ok(Revision(new))
    }

    // --- transaction control ---

    /// Open a transaction, or push a nested frame onto the open one.
    pub fn begin(&self) {
        let mut tx = self.tx.borrow_mut();
        match tx.as_mut() {
            Some(tx) => tx.frames.push(Frame::default()),
            None => *tx = Some(TxState::new()),
        }
    }

    /// Commit the innermost frame.
    ///
    /// A nested commit folds into the enclosing frame and returns `Ok(None)`.
    /// The outermost commit validates, persists, and publishes the change
    /// set, returning the allocated revision — or `Ok(None)` when the
    /// transaction turned out to be a no-op (no revision is allocated).
    pub fn commit(&self, log: &str) -> Result<Option<Revision>> {
        {
            let mut guard = self.tx.borrow_mut();
            let tx = guard.as_mut().ok_or(StrataError::NoTransaction)?;
            if tx.frames.len() > 1 {
                let inner = tx.frames.pop().ok_or(StrataError::TransactionClosed)?;
                let outer = tx.frames.last_mut().ok_or(StrataError::TransactionClosed)?;
                outer.journal.extend(inner.journal);
                return Ok(None);
            }
        }
        // Outermost commit: the transaction is consumed either way.
        let tx = self
            .tx
            .borrow_mut()
            .take()
            .ok_or(StrataError::NoTransaction)?;
        if tx.poisoned {
            return Err(StrataError::TransactionPoisoned);
        }
        self.commit_outer(tx, log)
    }

    /// Roll back the innermost frame. Rolling back a nested frame poisons
    /// the transaction; the outermost rollback discards it entirely.
    pub fn rollback(&self) -> Result<()> {
        let mut guard = self.tx.borrow_mut();
        let tx = guard.as_mut().ok_or(StrataError::NoTransaction)?;
        let frame = tx.frames.pop().ok_or(StrataError::TransactionClosed)?;
        for (item, prior) in frame.journal.into_iter().rev() {
            match prior {
                Some(state) => {
                    tx.objects.insert(item, state);
                }
                None => {
                    tx.objects.remove(&item);
                }
            }
        }
        if tx.frames.is_empty() {
            *guard = None;
        } else {
            tx.poisoned = true;
        }
        Ok(())
    }

    // --- mutation ---

    /// Create an item of `type_name` on `branch` with the given initial
    /// values (declared and flex alike).
    pub fn create_object(
        &self,
        branch: BranchId,
        type_name: &str,
        values: BTreeMap<String, Value>,
    ) -> Result<ObjectKey> {
        self.require_tx()?;
        let ty = self.kb.inner.types.get(type_name)?.clone();
        self.check_mutable_on(branch, &ty)?;

        let key = ObjectKey::current(branch, type_name, self.kb.allocate_object_id());
        for (name, value) in &values {
            self.validate_value(&key, &ty, name, value)?;
        }

        let mut row = BTreeMap::new();
        let mut flex = BTreeMap::new();
        for (name, value) in values {
            if ty.attribute(&name).is_some() {
                row.insert(name, value);
            } else {
                flex.insert(name, value);
            }
        }

        let item = key.item_ref();
        let mut guard = self.tx.borrow_mut();
        let tx = guard.as_mut().ok_or(StrataError::NoTransaction)?;
        let frame = tx.frames.last_mut().ok_or(StrataError::TransactionClosed)?;
        frame.journal.push((item.clone(), None));
        tx.objects.insert(
            item,
            LocalObject {
                created_here: true,
                deleted: false,
                base: None,
                row,
                flex,
            },
        );
        Ok(key)
    }

    /// Create an association item linking `source` to `dest`.
    pub fn create_association(
        &self,
        branch: BranchId,
        type_name: &str,
        source: &ObjectKey,
        dest: &ObjectKey,
        mut values: BTreeMap<String, Value>,
    ) -> Result<ObjectKey> {
        values.insert(ASSOC_SOURCE.to_string(), Value::reference(source));
        values.insert(ASSOC_DEST.to_string(), Value::reference(dest));
        self.create_object(branch, type_name, values)
    }

    /// Set (or with `None`, clear) an attribute of an alive current object.
    pub fn set_attribute(
        &self,
        key: &ObjectKey,
        name: &str,
        value: Option<Value>,
    ) -> Result<()> {
        self.require_tx()?;
        if !key.history.is_current() {
            return Err(StrataError::HistoricImmutable(key.clone()));
        }
        let ty = self.kb.inner.types.get(&key.type_name)?.clone();
        self.check_mutable_on(key.branch, &ty)?;
        {
            let guard = self.tx.borrow();
            if let Some(tx) = guard.as_ref() {
                if tx.objects.get(&key.item_ref()).is_some_and(|l| l.deleted) {
                    return Err(StrataError::AlreadyDeleted(key.clone()));
                }
            }
        }
        if let Some(value) = &value {
            self.validate_value(key, &ty, name, value)?;
        }

        self.materialize(key)?;
        let declared = ty.attribute(name).is_some();
        self.journal_and(&key.item_ref(), |local| {
            let map = if declared { &mut local.row } else { &mut local.flex };
            match &value {
                Some(v) => {
                    map.insert(name.to_string(), v.clone());
                }
                None => {
                    map.remove(name);
                }
            }
        })
    }

    /// Delete an object and everything its deletion entails.
    ///
    /// Referers are handled per their declared deletion policy: cascading
    /// referers join the deletion closure, vetoing referers outside the
    /// closure abort it, clearing referers get their attribute nulled. The
    /// plan is computed completely before anything is touched.
    pub fn delete_object(&self, key: &ObjectKey) -> Result<()> {
        self.require_tx()?;
        if !key.history.is_current() {
            return Err(StrataError::HistoricImmutable(key.clone()));
        }
        let ty = self.kb.inner.types.get(&key.type_name)?.clone();
        self.check_mutable_on(key.branch, &ty)?;
        {
            let guard = self.tx.borrow();
            if let Some(tx) = guard.as_ref() {
                if tx.objects.get(&key.item_ref()).is_some_and(|l| l.deleted) {
                    return Err(StrataError::AlreadyDeleted(key.clone()));
                }
            }
        }
        if self.view_item(key)?.is_none() {
            return Err(StrataError::ObjectNotFound(key.clone()));
        }

        // 1. Plan the closure.
        let mut closure: BTreeSet<ItemRef> = BTreeSet::new();
        closure.insert(key.item_ref());
        let mut pending = vec![key.item_ref()];
        let mut clears: BTreeSet<(ItemRef, String)> = BTreeSet::new();
        let mut vetoes: Vec<(ItemRef, ObjectKey)> = Vec::new();

        while let Some(target) = pending.pop() {
            for (holder, attr) in self.referers_of(&[target.clone()], None)? {
                let holder_ty = self.kb.inner.types.get(&holder.type_name)?;
                let Some(spec) = holder_ty.attribute(&attr).and_then(|a| a.reference_spec())
                else {
                    continue;
                };
                match spec.policy {
                    DeletionPolicy::DeleteReferer => {
                        let item = holder.item_ref();
                        if closure.insert(item.clone()) {
                            pending.push(item);
                        }
                    }
                    DeletionPolicy::ClearReference => {
                        clears.insert((holder.item_ref(), attr));
                    }
                    DeletionPolicy::Veto => vetoes.push((target.clone(), holder)),
                }
            }
        }
        for (target, holder) in vetoes {
            if !closure.contains(&holder.item_ref()) {
                return Err(StrataError::DeleteVetoed {
                    target: target.current_key(),
                    referer: holder,
                });
            }
        }
        clears.retain(|(holder, _)| !closure.contains(holder));

        // 2. Apply the plan.
        for item in &closure {
            self.materialize(&item.current_key())?;
            self.journal_and(item, |local| local.deleted = true)?;
        }
        for (holder, attr) in &clears {
            self.materialize(&holder.current_key())?;
            self.journal_and(holder, |local| {
                local.row.remove(attr);
            })?;
        }
        Ok(())
    }

    // --- reads ---

    /// Resolve a key through the session view: the transaction overlay for
    /// current keys, committed state at the observed revision otherwise.
    pub fn get_item(&self, key: &ObjectKey) -> Result<Option<StoredItem>> {
        self.view_item(key)
    }

    /// Attribute value of an item that must exist in the session view.
    pub fn attribute(&self, key: &ObjectKey, name: &str) -> Result<Option<Value>> {
        match self.view_item(key)? {
            Some(item) => Ok(item.value(name).cloned()),
            None => Err(StrataError::ObjectNotFound(key.clone())),
        }
    }

    /// Attribute value from the latest committed state, bypassing both the
    /// overlay and the session's observed revision.
    pub fn global_attribute(&self, key: &ObjectKey, name: &str) -> Result<Option<Value>> {
        let last = self.kb.inner.last_rev.load(Ordering::SeqCst);
        let item = self.kb.with_conn(|conn| {
            resolve_item(
                conn,
                &self.kb.inner.types,
                key.branch,
                key.history,
                &key.type_name,
                key.id,
                last,
                last,
            )
        })?;
        match item {
            Some(item) => Ok(item.value(name).cloned()),
            None if key.history.is_current() => Err(StrataError::NotCommitted(key.clone())),
            None => Err(StrataError::ObjectNotFound(key.clone())),
        }
    }

    /// Resolve a declared reference attribute to the key its value denotes
    /// under the attribute's axes, `None` when unset.
    pub fn resolve_reference(&self, holder: &ObjectKey, name: &str) -> Result<Option<ObjectKey>> {
        let ty = self.kb.inner.types.get(&holder.type_name)?;
        let spec = ty
            .attribute(name)
            .and_then(|a| a.reference_spec())
            .cloned()
            .ok_or_else(|| StrataError::UnknownAttribute {
                type_name: holder.type_name.clone(),
                attribute: name.to_string(),
            })?;
        let item = self
            .view_item(holder)?
            .ok_or_else(|| StrataError::ObjectNotFound(holder.clone()))?;
        Ok(item
            .value(name)
            .and_then(|v| v.as_ref_target())
            .map(|target| resolve_reference_key(spec.history, spec.scope, holder, target)))
    }

    /// All holders of reference attributes pointing at any of the candidate
    /// targets in the session view, optionally restricted to one deletion
    /// policy.
    pub fn any_referer(
        &self,
        targets: &[ObjectKey],
        policy: Option<DeletionPolicy>,
    ) -> Result<Vec<(ObjectKey, String)>> {
        let candidates: Vec<ItemRef> = targets.iter().map(|t| t.item_ref()).collect();
        self.referers_of(&candidates, policy)
    }

    /// Associations matching a link query anchored at `anchor`, in the
    /// session view.
    ///
    /// For current anchors the committed part comes from the shared
    /// association cache (loaded on miss) and the transaction overlay is
    /// merged on top. Historic anchors are answered from committed state at
    /// their revision, uncached.
    pub fn resolve_links(&self, anchor: &ObjectKey, query: &LinkQuery) -> Result<Vec<ObjectKey>> {
        let types = &self.kb.inner.types;
        let ty = types.get(&query.association_type)?;
        let end_attr = query.end.attribute();
        let spec = ty
            .attribute(end_attr)
            .and_then(|a| a.reference_spec())
            .cloned()
            .ok_or_else(|| StrataError::UnknownAttribute {
                type_name: query.association_type.clone(),
                attribute: end_attr.to_string(),
            })?;
        let anchor_ref = anchor.item_ref();

        if let HistoryContext::Revision(rev) = anchor.history {
            let links = self
                .kb
                .with_conn(|conn| committed_links(conn, types, &anchor_ref, query, rev.0))?;
            return Ok(links
                .into_iter()
                .map(|i| i.current_key().with_history(anchor.history))
                .collect());
        }

        let observed = self.observed.get();
        let mut links = {
            let mut cache = self.kb.inner.cache.lock().expect("cache lock poisoned");
            match cache.lookup(&anchor_ref, query, observed) {
                Some(links) => links,
                None => {
                    let loaded = self.kb.with_conn(|conn| {
                        committed_links(conn, types, &anchor_ref, query, observed)
                    })?;
                    cache.insert_snapshot(
                        anchor_ref.clone(),
                        query.clone(),
                        observed,
                        loaded.clone(),
                    );
                    loaded
                }
            }
        };

        // Merge the transaction overlay.
        if let Some(tx) = &*self.tx.borrow() {
            for (item, local) in &tx.objects {
                if item.type_name != query.association_type {
                    continue;
                }
                if local.deleted {
                    links.remove(item);
                    continue;
                }
                let end_matches = match local.row.get(end_attr) {
                    Some(Value::Ref(t)) => reference_matches(spec.scope, item.branch, t, &anchor_ref),
                    _ => false,
                };
                let filter_matches = match &query.filter {
                    None => true,
                    Some((attr, expected)) => local.merged().get(attr) == Some(expected),
                };
                if end_matches && filter_matches {
                    links.insert(item.clone());
                } else {
                    links.remove(item);
                }
            }
        }
        Ok(links.into_iter().map(|i| i.current_key()).collect())
    }

    // --- internals ---

    fn require_tx(&self) -> Result<()> {
        if self.tx.borrow().is_some() {
            Ok(())
        } else {
            Err(StrataError::NoTransaction)
        }
    }

    /// Mutation preconditions shared by create, set, and delete: the branch
    /// exists and carries the type's data itself.
    fn check_mutable_on(&self, branch: BranchId, ty: &ItemType) -> Result<()> {
        let b = self
            .kb
            .branch(branch)?
            .ok_or(StrataError::UnknownBranch(branch.0))?;
        if !b.owns(&ty.name) {
            return Err(StrataError::NotBranched {
                type_name: ty.name.clone(),
                branch: branch.0,
            });
        }
        Ok(())
    }

    fn validate_value(
        &self,
        holder: &ObjectKey,
        ty: &ItemType,
        name: &str,
        value: &Value,
    ) -> Result<()> {
        let Some(def) = ty.attribute(name) else {
            // Undeclared attributes land in flex storage, which never holds
            // references.
            if matches!(value, Value::Ref(_)) {
                return Err(StrataError::FlexReference(name.to_string()));
            }
            return Ok(());
        };
        match &def.kind {
            AttributeKind::Plain(kind) => {
                if value.kind() != *kind {
                    return Err(StrataError::ValueType {
                        attribute: name.to_string(),
                        expected: *kind,
                        actual: value.kind(),
                    });
                }
                Ok(())
            }
            AttributeKind::Reference(spec) => {
                let Value::Ref(target) = value else {
                    return Err(StrataError::ValueType {
                        attribute: name.to_string(),
                        expected: ValueKind::Ref,
                        actual: value.kind(),
                    });
                };
                if !spec.target.accepts(&target.type_name) {
                    return Err(StrataError::WrongTargetType {
                        attribute: name.to_string(),
                        actual: target.type_name.clone(),
                    });
                }
                if ty.is_association && (name == ASSOC_SOURCE || name == ASSOC_DEST) {
                    let target_ty = self.kb.inner.types.get(&target.type_name)?;
                    if target_ty.versioned != ty.versioned {
                        return Err(StrataError::MixedVersioning {
                            association: ty.name.clone(),
                        });
                    }
                }
                let target_key = ObjectKey {
                    branch: target.branch,
                    history: target.history,
                    type_name: target.type_name.clone(),
                    id: target.id,
                };
                if self.view_item(&target_key)?.is_none() {
                    let locally_deleted = self
                        .tx
                        .borrow()
                        .as_ref()
                        .and_then(|tx| tx.objects.get(&target_key.item_ref()))
                        .is_some_and(|l| l.deleted);
                    return Err(if locally_deleted {
                        StrataError::DeletedTarget(target_key)
                    } else {
                        StrataError::TargetNotFound(target_key)
                    });
                }
                if spec.scope == BranchScope::Local {
                    self.validate_local_scope(holder, &target_key)?;
                }
                Ok(())
            }
        }
    }

    /// A branch-local reference may only point at an item visible on the
    /// holder's branch: same branch, or an ancestor branch's state at or
    /// before the accumulated fork point.
    fn validate_local_scope(&self, holder: &ObjectKey, target: &ObjectKey) -> Result<()> {
        if target.branch == holder.branch {
            return Ok(());
        }
        let mut clamp = self.observed.get();
        let mut current = holder.branch;
        loop {
            let Some(b) = self.kb.branch(current)? else {
                break;
            };
            let Some(base) = b.base() else {
                break;
            };
            clamp = clamp.min(b.base_revision().0);
            current = base;
            if current == target.branch {
                let visible = self.kb.with_conn(|conn| {
                    resolve_item(
                        conn,
                        &self.kb.inner.types,
                        target.branch,
                        HistoryContext::Current,
                        &target.type_name,
                        target.id,
                        clamp,
                        clamp,
                    )
                })?;
                if visible.is_some() {
                    return Ok(());
                }
                break;
            }
        }
        Err(StrataError::BranchScope {
            target: target.clone(),
            holder_branch: holder.branch.0,
        })
    }

    /// Ensure the overlay holds an entry for `key`, capturing committed base
    /// state on first touch.
    fn materialize(&self, key: &ObjectKey) -> Result<()> {
        {
            let guard = self.tx.borrow();
            let tx = guard.as_ref().ok_or(StrataError::NoTransaction)?;
            if tx.objects.contains_key(&key.item_ref()) {
                return Ok(());
            }
        }
        let item = self
            .committed_view(key)?
            .ok_or_else(|| StrataError::ObjectNotFound(key.clone()))?;
        let (row, flex) = split_values(&self.kb.inner.types, &key.type_name, item.values())?;
        let base = BaseState {
            last_rev: item.last_update_revision().0,
            create_rev: item.create_revision(),
            creator: item.creator().to_string(),
            created_at: item.created_at().to_string(),
            row: row.clone(),
            flex: flex.clone(),
        };
        let mut guard = self.tx.borrow_mut();
        let tx = guard.as_mut().ok_or(StrataError::NoTransaction)?;
        tx.objects.insert(
            key.item_ref(),
            LocalObject {
                created_here: false,
                deleted: false,
                base: Some(base),
                row,
                flex,
            },
        );
        Ok(())
    }

    /// Journal the pre-state of `item` in the current frame (once), then
    /// apply the mutation.
    fn journal_and(&self, item: &ItemRef, f: impl FnOnce(&mut LocalObject)) -> Result<()> {
        let mut guard = self.tx.borrow_mut();
        let tx = guard.as_mut().ok_or(StrataError::NoTransaction)?;
        let prior = tx.objects.get(item).cloned();
        let frame = tx.frames.last_mut().ok_or(StrataError::TransactionClosed)?;
        if !frame.journal.iter().any(|(r, _)| r == item) {
            frame.journal.push((item.clone(), prior));
        }
        let local = tx
            .objects
            .get_mut(item)
            .ok_or_else(|| StrataError::ObjectNotFound(item.current_key()))?;
        f(local);
        Ok(())
    }

    /// Committed state of a key at the session's observed revision.
    fn committed_view(&self, key: &ObjectKey) -> Result<Option<StoredItem>> {
        let last = self.kb.inner.last_rev.load(Ordering::SeqCst);
        self.kb.with_conn(|conn| {
            resolve_item(
                conn,
                &self.kb.inner.types,
                key.branch,
                key.history,
                &key.type_name,
                key.id,
                self.observed.get(),
                last,
            )
        })
    }

    fn view_item(&self, key: &ObjectKey) -> Result<Option<StoredItem>> {
        if key.history.is_current() {
            if let Some(tx) = &*self.tx.borrow() {
                if let Some(local) = tx.objects.get(&key.item_ref()) {
                    if local.deleted {
                        return Ok(None);
                    }
                    let now = chrono::Utc::now().to_rfc3339();
                    let (create_rev, last_rev, creator, created_at) = match &local.base {
                        Some(base) => (
                            base.create_rev,
                            Revision(base.last_rev),
                            base.creator.clone(),
                            base.created_at.clone(),
                        ),
                        None => (
                            Revision::PENDING,
                            Revision::PENDING,
                            self.author.clone(),
                            now.clone(),
                        ),
                    };
                    return Ok(Some(StoredItem::from_parts(
                        key.clone(),
                        create_rev,
                        last_rev,
                        creator,
                        created_at,
                        self.author.clone(),
                        now,
                        local.merged(),
                    )));
                }
            }
        }
        self.committed_view(key)
    }

    /// Committed referer hits merged with the transaction overlay.
    fn referers_of(
        &self,
        candidates: &[ItemRef],
        policy: Option<DeletionPolicy>,
    ) -> Result<Vec<(ObjectKey, String)>> {
        let types = &self.kb.inner.types;
        let target_types: BTreeSet<&str> =
            candidates.iter().map(|c| c.type_name.as_str()).collect();
        let mut hits: Vec<(ObjectKey, String)> = Vec::new();
        for target_type in target_types {
            let committed = self.kb.with_conn(|conn| {
                committed_referers(
                    conn,
                    types,
                    target_type,
                    candidates,
                    policy,
                    self.observed.get(),
                )
            })?;
            hits.extend(committed);
        }

        if let Some(tx) = &*self.tx.borrow() {
            // A touched holder overrides its committed row entirely.
            hits.retain(|(holder, _)| !tx.objects.contains_key(&holder.item_ref()));
            for (item, local) in &tx.objects {
                if local.deleted {
                    continue;
                }
                let ty = types.get(&item.type_name)?;
                for (attr, spec) in ty.references() {
                    if policy.is_some_and(|p| spec.policy != p) {
                        continue;
                    }
                    let Some(Value::Ref(target)) = local.row.get(attr) else {
                        continue;
                    };
                    if candidates
                        .iter()
                        .any(|c| reference_matches(spec.scope, item.branch, target, c))
                    {
                        hits.push((item.current_key(), attr.to_string()));
                    }
                }
            }
        }
        hits.sort();
        hits.dedup();
        Ok(hits)
    }

    fn move_lease(&self, new: u64) {
        let old = self.observed.get();
        if old != new {
            let mut cache = self.kb.inner.cache.lock().expect("cache lock poisoned");
            cache.acquire(new);
            cache.release(old);
        }
        self.observed.set(new);
    }

    // --- commit machinery ---

    fn commit_outer(&self, tx: TxState, log: &str) -> Result<Option<Revision>> {
        let types = self.kb.inner.types.clone();

        // 1. Reduce the overlay to effective changes.
        let mut changes: Vec<(ItemRef, Change)> = Vec::new();
        for (item, local) in tx.objects {
            let change = match (local.created_here, local.deleted, local.base) {
                (true, true, _) => continue,
                (true, false, _) => Change::Create {
                    row: local.row,
                    flex: local.flex,
                },
                (false, true, Some(base)) => Change::Delete { base },
                (false, false, Some(base)) => {
                    if base.row == local.row && base.flex == local.flex {
                        continue;
                    }
                    Change::Update {
                        base,
                        row: local.row,
                        flex: local.flex,
                    }
                }
                // Non-created objects always carry a base.
                (false, _, None) => continue,
            };
            changes.push((item, change));
        }
        if changes.is_empty() {
            return Ok(None);
        }
        changes.sort_by(|a, b| a.0.cmp(&b.0));

        let _commit = self
            .kb
            .inner
            .commit_lock
            .lock()
            .expect("commit lock poisoned");
        let last = self.kb.inner.last_rev.load(Ordering::SeqCst);
        let new_rev = Revision(last + 1);
        let now = chrono::Utc::now().to_rfc3339();

        let mut conn_guard = self.kb.inner.conn.lock().expect("connection lock poisoned");

        // 2. Validate against the latest committed state.
        self.check_conflicts(&conn_guard, &changes, last)?;
        self.check_delete_referers(&conn_guard, &types, &changes, last)?;
        self.check_mandatory(&types, &changes)?;
        self.check_unique(&conn_guard, &types, &changes, last)?;

        // 3. Stabilize freshly set historic references to the new revision.
        for (item, change) in &mut changes {
            let (Change::Create { row, .. } | Change::Update { row, .. }) = change else {
                continue;
            };
            let ty = types.get(&item.type_name)?;
            for (name, spec) in ty.references() {
                if spec.history != HistoryType::Historic {
                    continue;
                }
                if let Some(Value::Ref(target)) = row.get_mut(name) {
                    if target.history.is_current() {
                        target.history = HistoryContext::Revision(new_rev);
                    }
                }
            }
        }

        // 4. Build the changeset before writing, so participants and the
        // cache see exactly what gets persisted.
        let info = RevisionInfo {
            revision: new_rev,
            author: self.author.clone(),
            commit_time: now.clone(),
            log: log.to_string(),
        };
        let mut change_set = ChangeSet::new(new_rev);
        change_set.commit = Some(info.clone());
        for (item, change) in &changes {
            let ty = types.get(&item.type_name)?;
            if !ty.versioned {
                continue;
            }
            let ekey = EventKey::new(item.branch, &item.type_name, item.id, new_rev);
            let event = match change {
                Change::Create { row, flex } => ItemEvent::Creation {
                    key: ekey,
                    values: merge(row, flex),
                },
                Change::Update { base, row, flex } => {
                    let old = merge(&base.row, &base.flex);
                    let new = merge(row, flex);
                    let (old_diff, new_diff) = diff_maps(&old, &new);
                    ItemEvent::Update {
                        key: ekey,
                        old: old_diff,
                        new: new_diff,
                    }
                }
                Change::Delete { base } => ItemEvent::Deletion {
                    key: ekey,
                    values: merge(&base.row, &base.flex),
                    create_rev: base.create_rev,
                },
            };
            change_set.events.push(event);
        }

        let commit_info = CommitInfo {
            revision: new_rev,
            author: self.author.clone(),
            touched: changes.iter().map(|(i, _)| i.current_key()).collect(),
        };

        // 5. Two-phase commit: prepare participants, persist, confirm.
        let mut participants = self
            .kb
            .inner
            .participants
            .lock()
            .expect("participant lock poisoned");
        for i in 0..participants.len() {
            if let Err(reason) = participants[i].prepare(&commit_info) {
                for p in participants[..i].iter_mut() {
                    p.rollback(&commit_info);
                }
                return Err(StrataError::PrepareFailed(reason));
            }
        }

        let persisted = self.persist(&mut conn_guard, &info, &changes, &types, new_rev, &now);
        match persisted {
            Ok(()) => {
                for p in participants.iter_mut() {
                    p.commit(&commit_info);
                }
            }
            Err(e) => {
                for p in participants.iter_mut() {
                    p.rollback(&commit_info);
                }
                return Err(e);
            }
        }
        drop(participants);
        drop(conn_guard);

        self.kb.inner.last_rev.store(new_rev.0, Ordering::SeqCst);
        self.kb.update_cache(&change_set);
        self.move_lease(new_rev.0);
        tracing::info!(
            session = %self.id,
            revision = new_rev.0,
            touched = commit_info.touched.len(),
            "commit"
        );
        Ok(Some(new_rev))
    }

    fn check_conflicts(
        &self,
        conn: &rusqlite::Connection,
        changes: &[(ItemRef, Change)],
        last: u64,
    ) -> Result<()> {
        for (item, change) in changes {
            let base = match change {
                Change::Create { .. } => continue,
                Change::Update { base, .. } | Change::Delete { base } => base,
            };
            match load_head(conn, item.branch, &item.type_name, item.id)? {
                Some(head) if head.rev_min == base.last_rev => {}
                Some(head) => {
                    return Err(StrataError::Conflict {
                        key: item.current_key(),
                        observed: base.last_rev,
                        committed: head.rev_min,
                    });
                }
                // Deleted behind our back.
                None => {
                    return Err(StrataError::Conflict {
                        key: item.current_key(),
                        observed: base.last_rev,
                        committed: last,
                    });
                }
            }
        }
        Ok(())
    }

    /// The deletion closure was planned at the session's observed revision;
    /// a referer committed since then would survive as a dangling link. Any
    /// committed referer the plan does not already cover fails the commit.
    fn check_delete_referers(
        &self,
        conn: &rusqlite::Connection,
        types: &crate::meta::TypeRepository,
        changes: &[(ItemRef, Change)],
        last: u64,
    ) -> Result<()> {
        let touched: BTreeSet<&ItemRef> = changes.iter().map(|(i, _)| i).collect();
        for (item, change) in changes {
            let Change::Delete { base } = change else {
                continue;
            };
            let candidates = [item.clone()];
            for (holder, _) in
                committed_referers(conn, types, &item.type_name, &candidates, None, last)?
            {
                if !touched.contains(&holder.item_ref()) {
                    return Err(StrataError::Conflict {
                        key: item.current_key(),
                        observed: base.last_rev,
                        committed: last,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_mandatory(
        &self,
        types: &crate::meta::TypeRepository,
        changes: &[(ItemRef, Change)],
    ) -> Result<()> {
        for (item, change) in changes {
            let row = match change {
                Change::Create { row, .. } | Change::Update { row, .. } => row,
                Change::Delete { .. } => continue,
            };
            let ty = types.get(&item.type_name)?;
            for def in ty.attributes() {
                if def.mandatory && !row.contains_key(&def.name) {
                    return Err(StrataError::MissingMandatory {
                        type_name: item.type_name.clone(),
                        attribute: def.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_unique(
        &self,
        conn: &rusqlite::Connection,
        types: &crate::meta::TypeRepository,
        changes: &[(ItemRef, Change)],
        last: u64,
    ) -> Result<()> {
        let touched: BTreeSet<&ItemRef> = changes.iter().map(|(i, _)| i).collect();
        for (item, change) in changes {
            let row = match change {
                Change::Create { row, .. } | Change::Update { row, .. } => row,
                Change::Delete { .. } => continue,
            };
            let ty = types.get(&item.type_name)?;
            for def in ty.attributes().filter(|d| d.unique) {
                let Some(value) = row.get(&def.name) else {
                    continue;
                };
                // Against other objects in this commit.
                for (other, other_change) in changes {
                    if other == item
                        || other.branch != item.branch
                        || other.type_name != item.type_name
                    {
                        continue;
                    }
                    let other_row = match other_change {
                        Change::Create { row, .. } | Change::Update { row, .. } => row,
                        Change::Delete { .. } => continue,
                    };
                    if other_row.get(&def.name) == Some(value) {
                        return Err(StrataError::UniqueViolation {
                            type_name: item.type_name.clone(),
                            attribute: def.name.clone(),
                        });
                    }
                }
                // Against committed state, skipping rows this commit replaces.
                for committed in rows_at(conn, item.branch, &item.type_name, last)? {
                    let committed_ref = ItemRef {
                        branch: item.branch,
                        type_name: item.type_name.clone(),
                        id: committed.obj_id,
                    };
                    if committed_ref == *item || touched.contains(&committed_ref) {
                        continue;
                    }
                    if committed.row.get(&def.name) == Some(value) {
                        return Err(StrataError::UniqueViolation {
                            type_name: item.type_name.clone(),
                            attribute: def.name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn persist(
        &self,
        conn: &mut rusqlite::Connection,
        info: &RevisionInfo,
        changes: &[(ItemRef, Change)],
        types: &crate::meta::TypeRepository,
        new_rev: Revision,
        now: &str,
    ) -> Result<()> {
        let sql_tx = conn.transaction()?;
        insert_revision(&sql_tx, info)?;
        for (item, change) in changes {
            let versioned = types.get(&item.type_name)?.versioned;
            match change {
                Change::Create { row, flex } => {
                    insert_version(
                        &sql_tx,
                        &VersionRow {
                            branch: item.branch,
                            type_name: item.type_name.clone(),
                            obj_id: item.id,
                            rev_min: new_rev.0,
                            rev_max: HEAD_REV,
                            create_rev: new_rev.0,
                            creator: self.author.clone(),
                            created_at: now.to_string(),
                            modifier: self.author.clone(),
                            modified_at: now.to_string(),
                            row: row.clone(),
                        },
                    )?;
                    insert_flex(&sql_tx, item.branch, &item.type_name, item.id, new_rev.0, flex)?;
                }
                Change::Update { base, row, flex } => {
                    if versioned {
                        close_head(&sql_tx, item.branch, &item.type_name, item.id, new_rev.0)?;
                    } else {
                        delete_rows(&sql_tx, item.branch, &item.type_name, item.id)?;
                    }
                    insert_version(
                        &sql_tx,
                        &VersionRow {
                            branch: item.branch,
                            type_name: item.type_name.clone(),
                            obj_id: item.id,
                            rev_min: new_rev.0,
                            rev_max: HEAD_REV,
                            create_rev: base.create_rev.0,
                            creator: base.creator.clone(),
                            created_at: base.created_at.clone(),
                            modifier: self.author.clone(),
                            modified_at: now.to_string(),
                            row: row.clone(),
                        },
                    )?;
                    if *flex != base.flex {
                        if versioned {
                            close_flex_head(
                                &sql_tx,
                                item.branch,
                                &item.type_name,
                                item.id,
                                new_rev.0,
                            )?;
                        } else {
                            delete_flex_rows(&sql_tx, item.branch, &item.type_name, item.id)?;
                        }
                        insert_flex(
                            &sql_tx,
                            item.branch,
                            &item.type_name,
                            item.id,
                            new_rev.0,
                            flex,
                        )?;
                    }
                }
                Change::Delete { .. } => {
                    if versioned {
                        close_head(&sql_tx, item.branch, &item.type_name, item.id, new_rev.0)?;
                        close_flex_head(&sql_tx, item.branch, &item.type_name, item.id, new_rev.0)?;
                    } else {
                        delete_rows(&sql_tx, item.branch, &item.type_name, item.id)?;
                        delete_flex_rows(&sql_tx, item.branch, &item.type_name, item.id)?;
                    }
                }
            }
        }
        sql_tx.commit()?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.tx.borrow().is_some() {
            tracing::warn!(session = %self.id, "session dropped with open transaction; discarding");
            *self.tx.borrow_mut() = None;
        }
        if let Ok(mut cache) = self.kb.inner.cache.lock() {
            cache.release(self.observed.get());
        }
    }
}

enum Change {
    Create {
        row: BTreeMap<String, Value>,
        flex: BTreeMap<String, Value>,
    },
    Update {
        base: BaseState,
        row: BTreeMap<String, Value>,
        flex: BTreeMap<String, Value>,
    },
    Delete {
        base: BaseState,
    },
}

fn merge(row: &BTreeMap<String, Value>, flex: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    let mut merged = flex.clone();
    for (name, value) in row {
        merged.insert(name.clone(), value.clone());
    }
    merged
}
