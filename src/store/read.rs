//! Committed-state read paths.
//!
//! Resolves items by key (with branch shine-through and as-of-revision
//! views), implements the reference-resolution matrix over the three axes
//! declared in [`ReferenceSpec`](crate::meta::ReferenceSpec), and provides
//! the reverse-reference scans behind `any_referer` and the association
//! cache. All functions here see only committed state; transaction-local
//! overlays are merged by the session layer.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;

use crate::error::Result;
use crate::meta::{BranchScope, DeletionPolicy, HistoryType, TypeRepository};
use crate::store::branch::{branch_ids, load_branch};
use crate::store::cache::{AssociationEnd, LinkQuery};
use crate::store::flex::load_flex;
use crate::store::item::{load_version, VersionRow, HEAD_REV};
use crate::store::key::{BranchId, HistoryContext, ItemRef, ObjectId, ObjectKey};
use crate::store::revision::Revision;
use crate::store::value::{RefTarget, Value};

/// A resolved, committed view of an item.
///
/// Row and flex attributes are merged into one value map; lifecycle
/// attributes are exposed through dedicated accessors. A `StoredItem` for a
/// historic key is always alive — deletion is not observable retroactively.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    key: ObjectKey,
    create_rev: Revision,
    last_rev: Revision,
    creator: String,
    created_at: String,
    modifier: String,
    modified_at: String,
    values: BTreeMap<String, Value>,
}

impl StoredItem {
    /// The key this item was resolved through.
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Creation revision of this incarnation.
    pub fn create_revision(&self) -> Revision {
        self.create_rev
    }

    /// Revision of the resolved version (last update at or before the view).
    pub fn last_update_revision(&self) -> Revision {
        self.last_rev
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    pub fn modifier(&self) -> &str {
        &self.modifier
    }

    /// RFC 3339 creation timestamp.
    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    /// RFC 3339 last-modification timestamp.
    pub fn modified_at(&self) -> &str {
        &self.modified_at
    }

    /// Merged row + flex value of an attribute, `None` when unset.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// All row and flex values, merged.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Build an item view from explicit parts. Used by the session layer to
    /// present transaction-local (uncommitted) state.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        key: ObjectKey,
        create_rev: Revision,
        last_rev: Revision,
        creator: String,
        created_at: String,
        modifier: String,
        modified_at: String,
        values: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            key,
            create_rev,
            last_rev,
            creator,
            created_at,
            modifier,
            modified_at,
            values,
        }
    }
}

/// Resolve a committed item view.
///
/// `as_of` is the revision a `Current` key reads at (a session's observed
/// revision, or the latest committed revision for store-level reads).
/// Historic keys read at their own revision; a revision beyond
/// `last_committed` is "not yet existing" and resolves to `None`. Absence is
/// never an error.
pub(crate) fn resolve_item(
    conn: &Connection,
    types: &TypeRepository,
    branch: BranchId,
    history: HistoryContext,
    type_name: &str,
    id: ObjectId,
    as_of: u64,
    last_committed: u64,
) -> Result<Option<StoredItem>> {
    let ty = types.get(type_name)?;

    if !ty.versioned {
        // Unversioned types have no history to view.
        if !history.is_current() {
            return Ok(None);
        }
        let Some(row) = load_version(conn, branch, type_name, id, HEAD_REV - 1)? else {
            return Ok(None);
        };
        return Ok(Some(assemble(conn, branch, history, row, HEAD_REV - 1)?));
    }

    let rev = match history {
        HistoryContext::Current => as_of,
        HistoryContext::Revision(r) => {
            if r.0 > last_committed {
                return Ok(None);
            }
            r.0
        }
    };

    let Some((row, physical_rev)) = resolve_physical(conn, branch, type_name, id, rev)? else {
        return Ok(None);
    };
    Ok(Some(assemble(conn, branch, history, row, physical_rev)?))
}

/// Walk the branch chain until a branch owning the type is found, clamping
/// the view revision to each fork point on the way ("shine through").
fn resolve_physical(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    id: ObjectId,
    rev: u64,
) -> Result<Option<(VersionRow, u64)>> {
    let mut current = branch;
    let mut rev = rev;
    loop {
        let Some(b) = load_branch(conn, current)? else {
            return Ok(None);
        };
        if b.owns(type_name) {
            let row = load_version(conn, current, type_name, id, rev)?;
            return Ok(row.map(|r| (r, rev)));
        }
        // Trunk owns everything, so a base always exists here.
        let Some(base) = b.base() else {
            return Ok(None);
        };
        rev = rev.min(b.base_revision().0);
        current = base;
    }
}

fn assemble(
    conn: &Connection,
    requested_branch: BranchId,
    history: HistoryContext,
    row: VersionRow,
    rev: u64,
) -> Result<StoredItem> {
    let mut values = load_flex(conn, row.branch, &row.type_name, row.obj_id, rev)?;
    for (name, value) in &row.row {
        values.insert(name.clone(), value.clone());
    }
    Ok(StoredItem {
        key: ObjectKey {
            branch: requested_branch,
            history,
            type_name: row.type_name.clone(),
            id: row.obj_id,
        },
        create_rev: Revision(row.create_rev),
        last_rev: Revision(row.rev_min),
        creator: row.creator,
        created_at: row.created_at,
        modifier: row.modifier,
        modified_at: row.modified_at,
        values,
    })
}

/// The key a stored reference value resolves to, given the holder's view.
///
/// Axis semantics:
/// - branch scope: `Global` follows the target's own branch, `Local` stays on
///   the holder's branch;
/// - history `Current` always yields a current key, even for historic
///   holders;
/// - history `Historic` yields the stabilized revision recorded in the value
///   (still current inside the uncommitted setting transaction);
/// - history `Mixed` re-derives the context from the holder's queried
///   history at every lookup.
pub(crate) fn resolve_reference_key(
    history: HistoryType,
    scope: BranchScope,
    holder: &ObjectKey,
    target: &RefTarget,
) -> ObjectKey {
    let branch = match scope {
        BranchScope::Global => target.branch,
        BranchScope::Local => holder.branch,
    };
    let hist = match history {
        HistoryType::Current => HistoryContext::Current,
        HistoryType::Historic => target.history,
        HistoryType::Mixed => holder.history,
    };
    ObjectKey {
        branch,
        history: hist,
        type_name: target.type_name.clone(),
        id: target.id,
    }
}

/// Whether a stored reference value points at the given identity.
///
/// Matching ignores the history axis: it compares type, id, and the
/// effective branch (the holder's for branch-local attributes).
pub(crate) fn reference_matches(
    scope: BranchScope,
    holder_branch: BranchId,
    target: &RefTarget,
    candidate: &ItemRef,
) -> bool {
    let branch = match scope {
        BranchScope::Global => target.branch,
        BranchScope::Local => holder_branch,
    };
    target.type_name == candidate.type_name && target.id == candidate.id && branch == candidate.branch
}

/// A committed reverse-reference hit: holder key plus the attribute name.
pub(crate) type RefererHit = (ObjectKey, String);

/// All committed holders of a reference attribute accepting `target_type`
/// (optionally restricted to a deletion policy) that point at any candidate.
///
/// Scans alive rows of every type with a matching reference attribute on
/// every branch, at the caller's view revision.
pub(crate) fn committed_referers(
    conn: &Connection,
    types: &TypeRepository,
    target_type: &str,
    candidates: &[ItemRef],
    policy: Option<DeletionPolicy>,
    as_of: u64,
) -> Result<Vec<RefererHit>> {
    let mut hits = Vec::new();
    let branches = branch_ids(conn)?;
    for ty in types.iter() {
        let matching_attrs: Vec<_> = ty
            .references()
            .filter(|(_, spec)| spec.target.accepts(target_type))
            .filter(|(_, spec)| policy.map_or(true, |p| spec.policy == p))
            .map(|(name, spec)| (name.to_string(), spec.clone()))
            .collect();
        if matching_attrs.is_empty() {
            continue;
        }
        for &branch in &branches {
            let rows = crate::store::item::rows_at(conn, branch, &ty.name, as_of)?;
            for row in rows {
                for (attr, spec) in &matching_attrs {
                    let Some(Value::Ref(target)) = row.row.get(attr) else {
                        continue;
                    };
                    if candidates
                        .iter()
                        .any(|c| reference_matches(spec.scope, branch, target, c))
                    {
                        hits.push((
                            ObjectKey::current(branch, &ty.name, row.obj_id),
                            attr.clone(),
                        ));
                    }
                }
            }
        }
    }
    hits.sort();
    hits.dedup();
    Ok(hits)
}

/// Committed result set of a link query: association items of the query's
/// type whose anchored end points at `anchor` and whose filter attribute
/// matches, at the given view revision.
pub(crate) fn committed_links(
    conn: &Connection,
    types: &TypeRepository,
    anchor: &ItemRef,
    query: &LinkQuery,
    as_of: u64,
) -> Result<BTreeSet<ItemRef>> {
    let ty = types.get(&query.association_type)?;
    let end_attr = match query.end {
        AssociationEnd::Source => crate::meta::ASSOC_SOURCE,
        AssociationEnd::Dest => crate::meta::ASSOC_DEST,
    };
    let spec = ty
        .attribute(end_attr)
        .and_then(|a| a.reference_spec())
        .cloned()
        .ok_or_else(|| crate::error::StrataError::UnknownAttribute {
            type_name: query.association_type.clone(),
            attribute: end_attr.to_string(),
        })?;

    let mut links = BTreeSet::new();
    for branch in branch_ids(conn)? {
        let rows = crate::store::item::rows_at(conn, branch, &ty.name, as_of)?;
        for row in rows {
            let Some(Value::Ref(target)) = row.row.get(end_attr) else {
                continue;
            };
            if !reference_matches(spec.scope, branch, target, anchor) {
                continue;
            }
            if let Some((filter_attr, filter_value)) = &query.filter {
                let matches = match row.row.get(filter_attr) {
                    Some(v) => v == filter_value,
                    None => {
                        // Filter attribute may be flex
                        let flex = load_flex(conn, branch, &ty.name, row.obj_id, as_of)?;
                        flex.get(filter_attr) == Some(filter_value)
                    }
                };
                if !matches {
                    continue;
                }
            }
            links.insert(ItemRef {
                branch,
                type_name: ty.name.clone(),
                id: row.obj_id,
            });
        }
    }
    Ok(links)
}

/// Split a merged event value map into row and flex parts per the type
/// definition: declared names are row attributes, everything else is flex.
pub(crate) fn split_values(
    types: &TypeRepository,
    type_name: &str,
    merged: &BTreeMap<String, Value>,
) -> Result<(BTreeMap<String, Value>, BTreeMap<String, Value>)> {
    let ty = types.get(type_name)?;
    let mut row = BTreeMap::new();
    let mut flex = BTreeMap::new();
    for (name, value) in merged {
        match ty.attribute(name) {
            Some(_) => {
                row.insert(name.clone(), value.clone());
            }
            None => {
                flex.insert(name.clone(), value.clone());
            }
        }
    }
    Ok((row, flex))
}
