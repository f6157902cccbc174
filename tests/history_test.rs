mod helpers;

use helpers::{seed_b, test_kb, values};
use strata::{HistoryContext, Revision, StrataError, Value, TRUNK};

#[test]
fn historic_keys_read_frozen_state() {
    let kb = test_kb();
    let key = seed_b(&kb, "b1", "first");

    let session = kb.session("tester");
    session.begin();
    session
        .set_attribute(&key, "a2", Some(Value::from("second")))
        .unwrap();
    session.commit("update").unwrap();

    let at_1 = key.with_history(HistoryContext::Revision(Revision(1)));
    let at_2 = key.with_history(HistoryContext::Revision(Revision(2)));

    let old = kb.get_item(&at_1).unwrap().unwrap();
    assert_eq!(old.value("a2").unwrap().as_str(), Some("first"));
    assert_eq!(old.last_update_revision(), Revision(1));

    let new = kb.get_item(&at_2).unwrap().unwrap();
    assert_eq!(new.value("a2").unwrap().as_str(), Some("second"));
    assert_eq!(new.create_revision(), Revision(1));
}

#[test]
fn deletion_is_not_retroactive() {
    let kb = test_kb();
    let key = seed_b(&kb, "b1", "x");
    let session = kb.session("tester");
    session.begin();
    session.delete_object(&key).unwrap();
    session.commit("delete").unwrap();

    assert!(kb.get_item(&key).unwrap().is_none());
    // The state before the deletion stays readable forever.
    let at_1 = key.with_history(HistoryContext::Revision(Revision(1)));
    assert!(kb.get_item(&at_1).unwrap().is_some());
    // The deletion revision no longer covers the item.
    let at_2 = key.with_history(HistoryContext::Revision(Revision(2)));
    assert!(kb.get_item(&at_2).unwrap().is_none());
}

#[test]
fn future_historic_keys_do_not_resolve() {
    let kb = test_kb();
    let key = seed_b(&kb, "b1", "x");
    let future = key.with_history(HistoryContext::Revision(Revision(99)));
    assert!(kb.get_item(&future).unwrap().is_none());
}

#[test]
fn session_reads_stay_pinned_until_refresh() {
    let kb = test_kb();
    let key = seed_b(&kb, "b1", "first");

    let reader = kb.session("reader");
    let writer = kb.session("writer");
    writer.begin();
    writer
        .set_attribute(&key, "a2", Some(Value::from("second")))
        .unwrap();
    writer.commit("update").unwrap();

    // The reader still sees the state of its observed revision.
    let pinned = reader.get_item(&key).unwrap().unwrap();
    assert_eq!(pinned.value("a2").unwrap().as_str(), Some("first"));
    // But a committed-state read bypasses the pin.
    assert_eq!(
        reader
            .global_attribute(&key, "a2")
            .unwrap()
            .unwrap()
            .as_str(),
        Some("second")
    );

    reader.refresh().unwrap();
    let fresh = reader.get_item(&key).unwrap().unwrap();
    assert_eq!(fresh.value("a2").unwrap().as_str(), Some("second"));
}

#[test]
fn global_read_of_uncommitted_object_is_an_error() {
    let kb = test_kb();
    let session = kb.session("tester");
    session.begin();
    let key = session
        .create_object(TRUNK, "B", values(&[("a1", Value::from("new"))]))
        .unwrap();
    let err = session.global_attribute(&key, "a1").unwrap_err();
    assert!(matches!(err, StrataError::NotCommitted(_)));
    session.rollback().unwrap();
}

#[test]
fn re_creation_starts_a_fresh_incarnation() {
    let kb = test_kb();
    let key = seed_b(&kb, "b1", "x");
    let session = kb.session("tester");
    session.begin();
    session.delete_object(&key).unwrap();
    session.commit("delete").unwrap();

    session.begin();
    let again = session
        .create_object(TRUNK, "B", values(&[("a1", Value::from("b1"))]))
        .unwrap();
    let rev = session.commit("re-create").unwrap().unwrap();

    // New identity, new creation revision; the old incarnation's history is
    // untouched.
    assert_ne!(again.id, key.id);
    let fresh = kb.get_item(&again).unwrap().unwrap();
    assert_eq!(fresh.create_revision(), rev);
    let old = key.with_history(HistoryContext::Revision(Revision(1)));
    assert!(kb.get_item(&old).unwrap().is_some());
}
