//! State diffs between two store views.
//!
//! [`diff`] compares the alive state of two `(branch, revision)` views and
//! returns the item events that transform the first view into the second.
//! Swapping the views yields the exact inverse: creations become deletions
//! and updates swap their old and new sides.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;

use crate::error::{Result, StrataError};
use crate::event::{diff_maps, EventKey, ItemEvent};
use crate::store::flex::load_flex;
use crate::store::item::rows_at;
use crate::store::key::{BranchId, ObjectId};
use crate::store::owning_view;
use crate::store::revision::Revision;
use crate::store::value::Value;
use crate::store::KnowledgeBase;

/// A `(branch, revision)` view of the store.
pub type View = (BranchId, Revision);

/// The events turning the state at `from` into the state at `to`, ordered by
/// type and id. Only versioned types take part; event keys carry the `to`
/// view's branch and revision.
pub fn diff(kb: &KnowledgeBase, from: View, to: View) -> Result<Vec<ItemEvent>> {
    let last = kb.last_revision();
    for (branch, rev) in [from, to] {
        if rev > last {
            return Err(StrataError::FutureRevision {
                branch: branch.0,
                revision: rev.0,
            });
        }
    }

    kb.with_conn(|conn| {
        let mut events = Vec::new();
        for ty in kb.inner.types.iter().filter(|t| t.versioned) {
            let before = alive_view(conn, from.0, &ty.name, from.1 .0)?;
            let after = alive_view(conn, to.0, &ty.name, to.1 .0)?;
            let ids: BTreeSet<ObjectId> = before.keys().chain(after.keys()).copied().collect();
            for id in ids {
                let key = EventKey::new(to.0, &ty.name, id, to.1);
                match (before.get(&id), after.get(&id)) {
                    (None, Some((values, _))) => events.push(ItemEvent::Creation {
                        key,
                        values: values.clone(),
                    }),
                    (Some((values, create_rev)), None) => events.push(ItemEvent::Deletion {
                        key,
                        values: values.clone(),
                        create_rev: *create_rev,
                    }),
                    (Some((old_values, _)), Some((new_values, _))) => {
                        let (old, new) = diff_maps(old_values, new_values);
                        if !old.is_empty() || !new.is_empty() {
                            events.push(ItemEvent::Update { key, old, new });
                        }
                    }
                    (None, None) => {}
                }
            }
        }
        events.sort_by(|a, b| a.key().cmp(b.key()));
        Ok(events)
    })
}

/// Alive items of one type in a view: merged values and creation revision
/// per id, resolved through the owning branch at the clamped revision.
fn alive_view(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    rev: u64,
) -> Result<BTreeMap<ObjectId, (BTreeMap<String, Value>, Revision)>> {
    let mut view = BTreeMap::new();
    let Some((owning, clamped)) = owning_view(conn, branch, type_name, rev)? else {
        return Ok(view);
    };
    for row in rows_at(conn, owning, type_name, clamped)? {
        let mut values = load_flex(conn, owning, type_name, row.obj_id, clamped)?;
        for (name, value) in &row.row {
            values.insert(name.clone(), value.clone());
        }
        view.insert(row.obj_id, (values, Revision(row.create_rev)));
    }
    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{TypeBuilder, TypeRepository, ValueKind};
    use crate::store::key::TRUNK;

    fn kb() -> KnowledgeBase {
        let types = TypeRepository::builder()
            .ty(TypeBuilder::item("B").plain("a1", ValueKind::String))
            .build()
            .unwrap();
        KnowledgeBase::open_in_memory(types).unwrap()
    }

    #[test]
    fn diff_reports_creations_updates_and_deletions() {
        let kb = kb();
        let session = kb.session("tester");
        session.begin();
        let stays = session
            .create_object(
                TRUNK,
                "B",
                [("a1".to_string(), Value::from("x"))].into_iter().collect(),
            )
            .unwrap();
        let goes = session.create_object(TRUNK, "B", BTreeMap::new()).unwrap();
        session.commit("seed").unwrap();

        session.begin();
        session
            .set_attribute(&stays, "a1", Some(Value::from("y")))
            .unwrap();
        session.delete_object(&goes).unwrap();
        session
            .create_object(TRUNK, "B", BTreeMap::new())
            .unwrap();
        session.commit("change").unwrap();

        let events = diff(&kb, (TRUNK, Revision(1)), (TRUNK, Revision(2))).unwrap();
        assert_eq!(events.len(), 3);
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                ItemEvent::Creation { .. } => "creation",
                ItemEvent::Update { .. } => "update",
                ItemEvent::Deletion { .. } => "deletion",
            })
            .collect();
        assert!(kinds.contains(&"creation"));
        assert!(kinds.contains(&"update"));
        assert!(kinds.contains(&"deletion"));
    }

    #[test]
    fn reversed_views_yield_the_inverse_diff() {
        let kb = kb();
        let session = kb.session("tester");
        session.begin();
        let key = session
            .create_object(
                TRUNK,
                "B",
                [("a1".to_string(), Value::from("x"))].into_iter().collect(),
            )
            .unwrap();
        session.commit("seed").unwrap();
        session.begin();
        session
            .set_attribute(&key, "a1", Some(Value::from("y")))
            .unwrap();
        session.commit("change").unwrap();

        let forward = diff(&kb, (TRUNK, Revision(1)), (TRUNK, Revision(2))).unwrap();
        let backward = diff(&kb, (TRUNK, Revision(2)), (TRUNK, Revision(1))).unwrap();
        assert_eq!(forward.len(), 1);
        assert_eq!(backward.len(), 1);
        match (&forward[0], &backward[0]) {
            (
                ItemEvent::Update { old, new, .. },
                ItemEvent::Update {
                    old: rev_old,
                    new: rev_new,
                    ..
                },
            ) => {
                assert_eq!(old, rev_new);
                assert_eq!(new, rev_old);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn future_revision_is_rejected() {
        let kb = kb();
        let err = diff(&kb, (TRUNK, Revision(0)), (TRUNK, Revision(5))).unwrap_err();
        assert!(matches!(err, StrataError::FutureRevision { .. }));
    }
}
