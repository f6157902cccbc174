//! Applying replicated changesets to a secondary store.
//!
//! A replica materializes the origin's revisions by replaying changesets in
//! order: each set allocates the same revision number, the same version
//! windows, and the same branch rows as the origin, so reads against the
//! replica are indistinguishable from reads against the origin at the same
//! revision. Replay is strict about consistency; a set that does not fit the
//! replica's current state is a replication error.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use rusqlite::Connection;

use crate::error::{Result, StrataError};
use crate::event::{ChangeSet, EventSource, ItemEvent};
use crate::store::branch::insert_branch;
use crate::store::flex::{close_flex_head, insert_flex, load_flex};
use crate::store::item::{close_head, insert_version, load_head, VersionRow, HEAD_REV};
use crate::store::read::split_values;
use crate::store::revision::{insert_revision, Revision, RevisionInfo};
use crate::store::value::Value;
use crate::store::{branch_from_event, copy_branched_rows, KnowledgeBase};

/// Apply one changeset. Its revision must lie beyond the store's latest
/// revision; gaps are allowed, regressions are not.
pub fn apply_change_set(kb: &KnowledgeBase, cs: &ChangeSet) -> Result<()> {
    let _commit = kb.inner.commit_lock.lock().expect("commit lock poisoned");
    let last = kb.inner.last_rev.load(Ordering::SeqCst);
    let max_id = {
        let mut guard = kb.inner.conn.lock().expect("connection lock poisoned");
        let conn = &mut *guard;
        let sql_tx = conn.transaction()?;
        let max_id = stage_change_set(&sql_tx, kb, cs, last)?;
        sql_tx.commit()?;
        max_id
    };
    publish(kb, std::slice::from_ref(cs), cs.revision.0, max_id);
    Ok(())
}

/// Write one changeset into an open storage transaction. `last` is the
/// highest revision already committed or staged before this set; nothing
/// becomes visible until the caller commits the transaction.
fn stage_change_set(
    conn: &Connection,
    kb: &KnowledgeBase,
    cs: &ChangeSet,
    last: u64,
) -> Result<u64> {
    if cs.revision.0 <= last {
        return Err(StrataError::OutOfOrderChangeSet {
            last,
            got: cs.revision.0,
        });
    }

    let info = cs.commit.clone().unwrap_or_else(|| RevisionInfo {
        revision: cs.revision,
        author: "replica".to_string(),
        commit_time: chrono::Utc::now().to_rfc3339(),
        log: String::new(),
    });
    insert_revision(conn, &info)?;

    for branch_event in &cs.branch_events {
        let branch = branch_from_event(branch_event, cs.revision);
        insert_branch(conn, &branch)?;
        copy_branched_rows(conn, &kb.inner.types, &branch)?;
    }

    let mut max_id = 0u64;
    for event in &cs.events {
        apply_event(conn, kb, cs.revision, &info, event)?;
        max_id = max_id.max(event.key().id.0);
    }
    Ok(max_id)
}

/// Advance the visible revision and fold the applied sets into the
/// association cache, after durable storage.
fn publish(kb: &KnowledgeBase, sets: &[ChangeSet], last: u64, max_id: u64) {
    kb.inner.last_rev.store(last, Ordering::SeqCst);
    kb.inner.next_id.fetch_max(max_id, Ordering::SeqCst);
    for cs in sets {
        kb.update_cache(cs);
        tracing::debug!(
            revision = cs.revision.0,
            events = cs.events.len(),
            branches = cs.branch_events.len(),
            "changeset applied"
        );
    }
}

fn apply_event(
    conn: &Connection,
    kb: &KnowledgeBase,
    revision: Revision,
    info: &RevisionInfo,
    event: &ItemEvent,
) -> Result<()> {
    let types = &kb.inner.types;
    let key = event.key();
    let ty = types.get(&key.type_name)?;
    if !ty.versioned {
        return Err(StrataError::ReplayInconsistent {
            revision: revision.0,
            detail: format!("event for unversioned type {}", key.type_name),
        });
    }
    let head = load_head(conn, key.branch, &key.type_name, key.id)?;

    match event {
        ItemEvent::Creation { values, .. } => {
            if head.is_some() {
                return Err(StrataError::ReplayInconsistent {
                    revision: revision.0,
                    detail: format!("creation of already alive {}", key.object_key()),
                });
            }
            let (row, flex) = split_values(types, &key.type_name, values)?;
            insert_version(
                conn,
                &VersionRow {
                    branch: key.branch,
                    type_name: key.type_name.clone(),
                    obj_id: key.id,
                    rev_min: revision.0,
                    rev_max: HEAD_REV,
                    create_rev: revision.0,
                    creator: info.author.clone(),
                    created_at: info.commit_time.clone(),
                    modifier: info.author.clone(),
                    modified_at: info.commit_time.clone(),
                    row,
                },
            )?;
            insert_flex(conn, key.branch, &key.type_name, key.id, revision.0, &flex)?;
        }
        ItemEvent::Update { old, new, .. } => {
            let Some(head) = head else {
                return Err(StrataError::ReplayInconsistent {
                    revision: revision.0,
                    detail: format!("update of missing {}", key.object_key()),
                });
            };
            let old_flex = load_flex(conn, key.branch, &key.type_name, key.id, revision.0 - 1)?;
            let mut merged: BTreeMap<String, Value> = old_flex.clone();
            for (name, value) in &head.row {
                merged.insert(name.clone(), value.clone());
            }
            for name in old.keys().chain(new.keys()) {
                if merged.get(name) != old.get(name) {
                    return Err(StrataError::ReplayInconsistent {
                        revision: revision.0,
                        detail: format!("stale value for {}.{name}", key.object_key()),
                    });
                }
            }
            for name in old.keys() {
                if !new.contains_key(name) {
                    merged.remove(name);
                }
            }
            for (name, value) in new {
                merged.insert(name.clone(), value.clone());
            }

            let (row, flex) = split_values(types, &key.type_name, &merged)?;
            close_head(conn, key.branch, &key.type_name, key.id, revision.0)?;
            insert_version(
                conn,
                &VersionRow {
                    branch: key.branch,
                    type_name: key.type_name.clone(),
                    obj_id: key.id,
                    rev_min: revision.0,
                    rev_max: HEAD_REV,
                    create_rev: head.create_rev,
                    creator: head.creator.clone(),
                    created_at: head.created_at.clone(),
                    modifier: info.author.clone(),
                    modified_at: info.commit_time.clone(),
                    row,
                },
            )?;
            if flex != old_flex {
                close_flex_head(conn, key.branch, &key.type_name, key.id, revision.0)?;
                insert_flex(conn, key.branch, &key.type_name, key.id, revision.0, &flex)?;
            }
        }
        ItemEvent::Deletion { .. } => {
            if head.is_none() {
                return Err(StrataError::ReplayInconsistent {
                    revision: revision.0,
                    detail: format!("deletion of missing {}", key.object_key()),
                });
            }
            close_head(conn, key.branch, &key.type_name, key.id, revision.0)?;
            close_flex_head(conn, key.branch, &key.type_name, key.id, revision.0)?;
        }
    }
    Ok(())
}

/// Pull everything beyond the store's latest revision from `source` and
/// apply it. The whole batch is staged in one storage transaction and the
/// visible revision advances once at the end, so a failure anywhere in the
/// batch leaves the store untouched and readers never observe intermediate
/// revisions.
pub(crate) fn refetch(kb: &KnowledgeBase, source: &dyn EventSource) -> Result<Revision> {
    let sets = source.change_sets_since(kb.last_revision())?;
    if sets.is_empty() {
        return Ok(kb.last_revision());
    }

    let _commit = kb.inner.commit_lock.lock().expect("commit lock poisoned");
    let mut last = kb.inner.last_rev.load(Ordering::SeqCst);
    let mut max_id = 0u64;
    {
        let mut guard = kb.inner.conn.lock().expect("connection lock poisoned");
        let conn = &mut *guard;
        let sql_tx = conn.transaction()?;
        for cs in &sets {
            max_id = max_id.max(stage_change_set(&sql_tx, kb, cs, last)?);
            last = cs.revision.0;
        }
        sql_tx.commit()?;
    }
    publish(kb, &sets, last, max_id);
    Ok(Revision(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{TypeBuilder, TypeRepository, ValueKind};
    use crate::store::key::TRUNK;

    fn types() -> TypeRepository {
        TypeRepository::builder()
            .ty(TypeBuilder::item("B").plain("a1", ValueKind::String))
            .build()
            .unwrap()
    }

    #[test]
    fn stale_changeset_is_rejected() {
        let origin = KnowledgeBase::open_in_memory(types()).unwrap();
        let session = origin.session("tester");
        session.begin();
        session.create_object(TRUNK, "B", BTreeMap::new()).unwrap();
        session.commit("create").unwrap();

        let replica = KnowledgeBase::open_in_memory(types()).unwrap();
        replica.refetch(&origin).unwrap();
        let sets = origin.change_sets_since(Revision::INITIAL).unwrap();
        let err = apply_change_set(&replica, &sets[0]).unwrap_err();
        assert!(matches!(err, StrataError::OutOfOrderChangeSet { .. }));
    }

    #[test]
    fn refetch_mirrors_origin_state() {
        let origin = KnowledgeBase::open_in_memory(types()).unwrap();
        let session = origin.session("tester");
        session.begin();
        let key = session
            .create_object(
                TRUNK,
                "B",
                [("a1".to_string(), Value::from("x"))].into_iter().collect(),
            )
            .unwrap();
        session.commit("create").unwrap();
        session.begin();
        session
            .set_attribute(&key, "a1", Some(Value::from("y")))
            .unwrap();
        session.commit("update").unwrap();

        let replica = KnowledgeBase::open_in_memory(types()).unwrap();
        let rev = replica.refetch(&origin).unwrap();
        assert_eq!(rev, origin.last_revision());

        let mirrored = replica.get_item(&key).unwrap().unwrap();
        assert_eq!(mirrored.value("a1").unwrap().as_str(), Some("y"));
        assert_eq!(mirrored.create_revision(), Revision(1));

        // Incremental refetch with nothing new is a no-op.
        assert_eq!(replica.refetch(&origin).unwrap(), rev);
    }
}
