//! Association cache — cached reverse-reference query results per anchor.
//!
//! A cache entry is keyed by `(anchor item, link query)` and holds revision
//! snapshots of the matching association set. The global cache is shared by
//! all sessions and maintained incrementally from published changesets; the
//! transaction-local overlay is computed by the session layer on top of the
//! snapshot for its observed revision.
//!
//! Retention is lease-based: every session holds a counted lease on its
//! observed revision. Snapshots at or after the minimum leased revision are
//! kept; older ones are evicted deterministically when the minimum rises.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::event::{ChangeSet, ItemEvent};
use crate::meta::{BranchScope, TypeRepository, ASSOC_DEST, ASSOC_SOURCE};
use crate::store::key::ItemRef;
use crate::store::read::reference_matches;
use crate::store::value::Value;

/// Which association end anchors the query. The result set holds the
/// association items whose `end` attribute points at the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationEnd {
    Source,
    Dest,
}

impl AssociationEnd {
    pub(crate) fn attribute(&self) -> &'static str {
        match self {
            Self::Source => ASSOC_SOURCE,
            Self::Dest => ASSOC_DEST,
        }
    }
}

/// A parameterized reverse-reference query: association type, anchored end,
/// and an optional attribute-equality filter on the association.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkQuery {
    pub association_type: String,
    pub end: AssociationEnd,
    pub filter: Option<(String, Value)>,
}

impl LinkQuery {
    /// Associations of `association_type` whose `end` points at the anchor.
    pub fn new(association_type: &str, end: AssociationEnd) -> Self {
        Self {
            association_type: association_type.to_string(),
            end,
            filter: None,
        }
    }

    pub fn filtered(mut self, attribute: &str, value: Value) -> Self {
        self.filter = Some((attribute.to_string(), value));
        self
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    from_rev: u64,
    links: BTreeSet<ItemRef>,
}

#[derive(Debug)]
struct QueryCache {
    query: LinkQuery,
    /// Ascending by `from_rev`; a snapshot is valid from its revision until
    /// the next snapshot's revision.
    snapshots: Vec<Snapshot>,
}

impl QueryCache {
    fn snapshot_at(&self, rev: u64) -> Option<&Snapshot> {
        self.snapshots.iter().rev().find(|s| s.from_rev <= rev)
    }

    fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    fn push_at(&mut self, rev: u64, links: BTreeSet<ItemRef>) {
        match self.snapshots.iter().position(|s| s.from_rev >= rev) {
            Some(idx) if self.snapshots[idx].from_rev == rev => {
                self.snapshots[idx].links = links;
            }
            Some(idx) => self.snapshots.insert(idx, Snapshot { from_rev: rev, links }),
            None => self.snapshots.push(Snapshot { from_rev: rev, links }),
        }
    }
}

/// The shared, cross-session association cache.
#[derive(Debug, Default)]
pub(crate) struct AssociationCache {
    entries: HashMap<ItemRef, Vec<QueryCache>>,
    /// Lease count per observed revision.
    leases: BTreeMap<u64, usize>,
}

impl AssociationCache {
    /// Cached result for `(anchor, query)` at `rev`, if a snapshot covers it.
    pub(crate) fn lookup(
        &self,
        anchor: &ItemRef,
        query: &LinkQuery,
        rev: u64,
    ) -> Option<BTreeSet<ItemRef>> {
        self.entries
            .get(anchor)?
            .iter()
            .find(|qc| qc.query == *query)?
            .snapshot_at(rev)
            .map(|s| s.links.clone())
    }

    /// Record a freshly loaded result as the snapshot valid from `rev`.
    pub(crate) fn insert_snapshot(
        &mut self,
        anchor: ItemRef,
        query: LinkQuery,
        rev: u64,
        links: BTreeSet<ItemRef>,
    ) {
        let caches = self.entries.entry(anchor).or_default();
        match caches.iter_mut().find(|qc| qc.query == query) {
            Some(qc) => qc.push_at(rev, links),
            None => caches.push(QueryCache {
                query,
                snapshots: vec![Snapshot { from_rev: rev, links }],
            }),
        }
    }

    /// Incrementally maintain cached entries from a committed changeset.
    ///
    /// Only entries whose query is affected by an event are touched.
    /// Creations and deletions adjust membership exactly; updates that leave
    /// the affected end or filter value underdetermined drop just the
    /// affected entry for lazy reload.
    pub(crate) fn apply_change_set(&mut self, types: &TypeRepository, cs: &ChangeSet) {
        for event in &cs.events {
            let type_name = &event.key().type_name;
            let Ok(ty) = types.get(type_name) else {
                continue;
            };
            if !ty.is_association {
                continue;
            }
            let item = ItemRef {
                branch: event.key().branch,
                type_name: type_name.clone(),
                id: event.key().id,
            };

            for (anchor, caches) in self.entries.iter_mut() {
                caches.retain_mut(|qc| {
                    if qc.query.association_type != *type_name {
                        return true;
                    }
                    let end_attr = qc.query.end.attribute();
                    let Some(spec) = ty.attribute(end_attr).and_then(|a| a.reference_spec())
                    else {
                        return true;
                    };
                    let was_member = qc
                        .latest()
                        .map(|s| s.links.contains(&item))
                        .unwrap_or(false);

                    let outcome = membership_outcome(
                        event,
                        end_attr,
                        spec.scope,
                        anchor,
                        &qc.query.filter,
                        was_member,
                    );
                    match outcome {
                        Outcome::Keep => true,
                        Outcome::Invalidate => {
                            tracing::debug!(
                                anchor = %anchor.current_key(),
                                query = ?qc.query,
                                "association cache entry invalidated"
                            );
                            false
                        }
                        Outcome::Add | Outcome::Remove => {
                            let mut links = qc
                                .latest()
                                .map(|s| s.links.clone())
                                .unwrap_or_default();
                            if matches!(outcome, Outcome::Add) {
                                links.insert(item.clone());
                            } else {
                                links.remove(&item);
                            }
                            qc.push_at(cs.revision.0, links);
                            true
                        }
                    }
                });
            }
        }
        self.evict();
    }

    /// Take a lease on `rev` for a session observing it.
    pub(crate) fn acquire(&mut self, rev: u64) {
        *self.leases.entry(rev).or_insert(0) += 1;
    }

    /// Release a lease; snapshots no longer covered by any lease become
    /// eligible for eviction.
    pub(crate) fn release(&mut self, rev: u64) {
        if let Some(count) = self.leases.get_mut(&rev) {
            *count -= 1;
            if *count == 0 {
                self.leases.remove(&rev);
            }
        }
        self.evict();
    }

    /// Number of retained snapshots across all entries (test observability).
    #[cfg(test)]
    pub(crate) fn snapshot_count(&self) -> usize {
        self.entries
            .values()
            .flat_map(|caches| caches.iter())
            .map(|qc| qc.snapshots.len())
            .sum()
    }

    fn evict(&mut self) {
        let min_leased = self.leases.keys().next().copied();
        let mut evicted = 0usize;
        for caches in self.entries.values_mut() {
            for qc in caches.iter_mut() {
                // Keep the newest snapshot at or before the minimum leased
                // revision and everything after it; without leases, keep
                // only the latest.
                let cutoff = match min_leased {
                    Some(min) => qc
                        .snapshots
                        .iter()
                        .rposition(|s| s.from_rev <= min)
                        .unwrap_or(0),
                    None => qc.snapshots.len().saturating_sub(1),
                };
                evicted += cutoff;
                qc.snapshots.drain(..cutoff);
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, "evicted unleased association cache snapshots");
        }
    }
}

enum Outcome {
    Add,
    Remove,
    Keep,
    Invalidate,
}

/// Decide how one association event changes membership of one cache entry.
fn membership_outcome(
    event: &ItemEvent,
    end_attr: &str,
    scope: BranchScope,
    anchor: &ItemRef,
    filter: &Option<(String, Value)>,
    was_member: bool,
) -> Outcome {
    match event {
        ItemEvent::Creation { key, values } => {
            let end_matches = match values.get(end_attr) {
                Some(Value::Ref(target)) => reference_matches(scope, key.branch, target, anchor),
                _ => false,
            };
            if !end_matches {
                return Outcome::Keep;
            }
            match filter {
                None => Outcome::Add,
                Some((attr, expected)) => {
                    if values.get(attr) == Some(expected) {
                        Outcome::Add
                    } else {
                        Outcome::Keep
                    }
                }
            }
        }
        ItemEvent::Deletion { .. } => {
            if was_member {
                Outcome::Remove
            } else {
                Outcome::Keep
            }
        }
        ItemEvent::Update { key, new, .. } => {
            let end_changed = new.contains_key(end_attr);
            let filter_changed = filter
                .as_ref()
                .map(|(attr, _)| new.contains_key(attr))
                .unwrap_or(false);
            if !end_changed && !filter_changed {
                return Outcome::Keep;
            }
            if end_changed {
                let end_matches = match new.get(end_attr) {
                    Some(Value::Ref(target)) => {
                        reference_matches(scope, key.branch, target, anchor)
                    }
                    _ => false,
                };
                if !end_matches {
                    return if was_member { Outcome::Remove } else { Outcome::Keep };
                }
                return match filter {
                    None => Outcome::Add,
                    Some((attr, expected)) => match new.get(attr) {
                        Some(v) if v == expected => Outcome::Add,
                        Some(_) => {
                            if was_member {
                                Outcome::Remove
                            } else {
                                Outcome::Keep
                            }
                        }
                        // End now matches but the filter value is unknown.
                        None => Outcome::Invalidate,
                    },
                };
            }
            // Only the filter attribute changed.
            let (attr, expected) = filter.as_ref().expect("filter_changed implies filter");
            let filter_matches = new.get(attr) == Some(expected);
            match (was_member, filter_matches) {
                (true, true) => Outcome::Keep,
                (true, false) => Outcome::Remove,
                // Non-membership may have been an end mismatch; underdetermined.
                (false, true) => Outcome::Invalidate,
                (false, false) => Outcome::Keep,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::key::{BranchId, ObjectId, TRUNK};

    fn item(id: u64) -> ItemRef {
        ItemRef {
            branch: TRUNK,
            type_name: "AB".into(),
            id: ObjectId(id),
        }
    }

    fn anchor() -> ItemRef {
        ItemRef {
            branch: TRUNK,
            type_name: "B".into(),
            id: ObjectId(1),
        }
    }

    fn query() -> LinkQuery {
        LinkQuery::new("AB", AssociationEnd::Source)
    }

    #[test]
    fn lookup_picks_newest_snapshot_at_or_before_revision() {
        let mut cache = AssociationCache::default();
        cache.acquire(2);
        cache.insert_snapshot(anchor(), query(), 2, [item(10)].into_iter().collect());
        cache.insert_snapshot(
            anchor(),
            query(),
            5,
            [item(10), item(11)].into_iter().collect(),
        );

        assert_eq!(cache.lookup(&anchor(), &query(), 2).unwrap().len(), 1);
        assert_eq!(cache.lookup(&anchor(), &query(), 4).unwrap().len(), 1);
        assert_eq!(cache.lookup(&anchor(), &query(), 5).unwrap().len(), 2);
        assert_eq!(cache.lookup(&anchor(), &query(), 9).unwrap().len(), 2);
        assert!(cache.lookup(&anchor(), &query(), 1).is_none());
    }

    #[test]
    fn leased_snapshots_survive_eviction() {
        let mut cache = AssociationCache::default();
        cache.acquire(2);
        cache.insert_snapshot(anchor(), query(), 2, BTreeSet::new());
        cache.insert_snapshot(anchor(), query(), 5, BTreeSet::new());
        cache.insert_snapshot(anchor(), query(), 8, BTreeSet::new());
        assert_eq!(cache.snapshot_count(), 3);

        // Still leased at 2: nothing may be dropped.
        cache.acquire(8);
        cache.release(8);
        assert_eq!(cache.snapshot_count(), 3);

        // Lease moves to 5: the r2 snapshot becomes unreachable.
        cache.acquire(5);
        cache.release(2);
        assert_eq!(cache.snapshot_count(), 2);
        assert!(cache.lookup(&anchor(), &query(), 5).is_some());

        // No leases at all: only the latest snapshot is kept.
        cache.release(5);
        assert_eq!(cache.snapshot_count(), 1);
        assert!(cache.lookup(&anchor(), &query(), 8).is_some());
    }
}
