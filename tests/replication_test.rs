mod helpers;

use helpers::{scenario_types, seed_b, test_kb, values};
use strata::event::diff::diff;
use strata::{
    ChangeSet, EventSource, HistoryContext, ItemEvent, KnowledgeBase, ObjectKey, Revision,
    StrataError, Value, TRUNK,
};

/// Drive an origin store through creates, flex writes, an update, a partial
/// branch, a post-fork branch commit, and a deletion. Returns the keys the
/// equivalence checks look at.
fn populate_origin(origin: &KnowledgeBase) -> (ObjectKey, ObjectKey, ObjectKey) {
    let b = seed_b(origin, "b1", "x");

    let session = origin.session("writer");
    session.begin();
    let c = session
        .create_object(TRUNK, "C", values(&[("c1", Value::from("base"))]))
        .unwrap();
    // Undeclared plain attribute, stored as flex.
    session
        .set_attribute(&b, "note", Some(Value::from("keep me")))
        .unwrap();
    session.commit("c and flex").unwrap();

    let branch = origin
        .create_branch("writer", TRUNK, origin.last_revision(), Some(&["C", "H"]))
        .unwrap();

    session.begin();
    let on_branch = session
        .create_object(branch.id(), "C", values(&[("c1", Value::from("forked"))]))
        .unwrap();
    session
        .set_attribute(&b, "a2", Some(Value::from("y")))
        .unwrap();
    session.commit("branch work").unwrap();

    session.begin();
    session.delete_object(&c).unwrap();
    session.commit("drop c").unwrap();

    (b, c, on_branch)
}

fn assert_same_item(origin: &KnowledgeBase, replica: &KnowledgeBase, key: &ObjectKey) {
    let a = origin.get_item(key).unwrap();
    let b = replica.get_item(key).unwrap();
    match (a, b) {
        (None, None) => {}
        (Some(a), Some(b)) => {
            assert_eq!(a.values(), b.values(), "values diverge for {key}");
            assert_eq!(a.create_revision(), b.create_revision(), "create revision diverges for {key}");
            assert_eq!(
                a.last_update_revision(),
                b.last_update_revision(),
                "update revision diverges for {key}"
            );
        }
        (a, b) => panic!("presence diverges for {key}: origin {:?}, replica {:?}", a, b),
    }
}

#[test]
fn refetch_reproduces_the_origin_state() {
    let origin = test_kb();
    let (b, c, on_branch) = populate_origin(&origin);

    let replica = KnowledgeBase::open_in_memory(scenario_types()).unwrap();
    let reached = replica.refetch(&origin).unwrap();
    assert_eq!(reached, origin.last_revision());

    for key in [&b, &c, &on_branch] {
        assert_same_item(&origin, &replica, key);
    }
    // Historic views replay too, including the branch shine-through.
    for rev in 1..=origin.last_revision().0 {
        let at = HistoryContext::Revision(Revision(rev));
        assert_same_item(&origin, &replica, &b.with_history(at));
        assert_same_item(&origin, &replica, &c.with_history(at));
        assert_same_item(
            &origin,
            &replica,
            &ObjectKey::current(on_branch.branch, "B", b.id).with_history(at),
        );
    }
}

#[test]
fn a_replica_emits_the_same_event_stream() {
    let origin = test_kb();
    populate_origin(&origin);

    let replica = KnowledgeBase::open_in_memory(scenario_types()).unwrap();
    replica.refetch(&origin).unwrap();

    let original = origin.change_sets_since(Revision(0)).unwrap();
    let replayed = replica.change_sets_since(Revision(0)).unwrap();
    assert_eq!(original, replayed);
}

#[test]
fn refetch_is_idempotent_and_resumable() {
    let origin = test_kb();
    let b = seed_b(&origin, "b1", "x");

    let replica = KnowledgeBase::open_in_memory(scenario_types()).unwrap();
    assert_eq!(replica.refetch(&origin).unwrap(), Revision(1));
    // Nothing new: a second refetch is a no-op.
    assert_eq!(replica.refetch(&origin).unwrap(), Revision(1));

    let session = origin.session("writer");
    session.begin();
    session
        .set_attribute(&b, "a2", Some(Value::from("y")))
        .unwrap();
    session.commit("update").unwrap();

    assert_eq!(replica.refetch(&origin).unwrap(), Revision(2));
    assert_eq!(
        replica
            .get_item(&b)
            .unwrap()
            .unwrap()
            .value("a2")
            .unwrap()
            .as_str(),
        Some("y")
    );
}

#[test]
fn replicas_continue_numbering_after_the_origin() {
    let origin = test_kb();
    seed_b(&origin, "b1", "x");

    let replica = KnowledgeBase::open_in_memory(scenario_types()).unwrap();
    replica.refetch(&origin).unwrap();

    // Local commits on a caught-up replica allocate fresh revisions and ids.
    let session = replica.session("local");
    session.begin();
    let local = session
        .create_object(TRUNK, "B", values(&[("a1", Value::from("b2"))]))
        .unwrap();
    let rev = session.commit("local work").unwrap().unwrap();
    assert_eq!(rev, Revision(2));
    assert!(replica.get_item(&local).unwrap().is_some());
}

#[test]
fn stale_changesets_are_rejected() {
    let origin = test_kb();
    seed_b(&origin, "b1", "x");
    seed_b(&origin, "b2", "y");

    let replica = KnowledgeBase::open_in_memory(scenario_types()).unwrap();
    replica.refetch(&origin).unwrap();

    let sets = origin.change_sets_since(Revision(0)).unwrap();
    let err = strata::event::apply::apply_change_set(&replica, &sets[0]).unwrap_err();
    assert!(matches!(err, StrataError::OutOfOrderChangeSet { last: 2, got: 1 }));
}

/// An event source serving a fixed batch of changesets.
struct Canned(Vec<ChangeSet>);

impl EventSource for Canned {
    fn change_sets_since(&self, after: Revision) -> strata::Result<Vec<ChangeSet>> {
        Ok(self
            .0
            .iter()
            .filter(|cs| cs.revision > after)
            .cloned()
            .collect())
    }
}

#[test]
fn a_bad_set_in_a_refetch_batch_applies_nothing() {
    let origin = test_kb();
    let b = seed_b(&origin, "b1", "x");
    let session = origin.session("writer");
    session.begin();
    session
        .set_attribute(&b, "a2", Some(Value::from("y")))
        .unwrap();
    session.commit("update").unwrap();

    let mut sets = origin.change_sets_since(Revision(0)).unwrap();
    // The second set no longer fits the state the first one produces.
    match &mut sets[1].events[0] {
        ItemEvent::Update { old, .. } => {
            old.insert("a2".to_string(), Value::from("never committed"));
        }
        other => panic!("expected an update event, got {other:?}"),
    }

    let replica = KnowledgeBase::open_in_memory(scenario_types()).unwrap();
    let err = replica.refetch(&Canned(sets)).unwrap_err();
    assert!(matches!(err, StrataError::ReplayInconsistent { revision: 2, .. }));

    // The valid first set was not applied either; the replica is untouched.
    assert_eq!(replica.last_revision(), Revision(0));
    assert!(replica.get_item(&b).unwrap().is_none());
}

#[test]
fn view_diffs_between_stores_agree() {
    let origin = test_kb();
    populate_origin(&origin);
    let replica = KnowledgeBase::open_in_memory(scenario_types()).unwrap();
    replica.refetch(&origin).unwrap();

    let last = origin.last_revision();
    let from = (TRUNK, Revision(1));
    let to = (TRUNK, last);
    assert_eq!(
        diff(&origin, from, to).unwrap(),
        diff(&replica, from, to).unwrap()
    );
}
