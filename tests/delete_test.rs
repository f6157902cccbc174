mod helpers;

use helpers::{seed_b, test_kb, values};
use strata::{AssociationEnd, DeletionPolicy, ErrorKind, LinkQuery, StrataError, Value, TRUNK};

#[test]
fn deleting_an_endpoint_deletes_the_association() {
    let kb = test_kb();
    let b = seed_b(&kb, "b1", "x");
    let session = kb.session("tester");
    session.begin();
    let c = session.create_object(TRUNK, "C", values(&[])).unwrap();
    let link = session
        .create_association(TRUNK, "AB", &b, &c, values(&[("tag", Value::from("t"))]))
        .unwrap();
    session.commit("link").unwrap();

    session.begin();
    session.delete_object(&b).unwrap();
    session.commit("delete endpoint").unwrap();

    assert!(kb.get_item(&link).unwrap().is_none());
    // The other endpoint is untouched.
    assert!(kb.get_item(&c).unwrap().is_some());
    let remaining = session
        .resolve_links(&c, &LinkQuery::new("AB", AssociationEnd::Dest))
        .unwrap();
    assert!(remaining.is_empty());
}

#[test]
fn vetoing_referers_block_the_deletion() {
    let kb = test_kb();
    let b = seed_b(&kb, "b1", "x");
    let session = kb.session("tester");
    session.begin();
    let v = session
        .create_object(TRUNK, "V", values(&[("pinned", Value::reference(&b))]))
        .unwrap();
    session.commit("pin").unwrap();

    session.begin();
    let err = session.delete_object(&b).unwrap_err();
    match err {
        StrataError::DeleteVetoed { target, referer } => {
            assert_eq!(target, b);
            assert_eq!(referer, v);
        }
        other => panic!("unexpected error: {other}"),
    }
    session.rollback().unwrap();
    assert!(kb.get_item(&b).unwrap().is_some());
}

#[test]
fn a_veto_does_not_outlive_its_holder() {
    let kb = test_kb();
    let b = seed_b(&kb, "b1", "x");
    let session = kb.session("tester");
    session.begin();
    let v = session
        .create_object(TRUNK, "V", values(&[("pinned", Value::reference(&b))]))
        .unwrap();
    session.commit("pin").unwrap();

    // Once the vetoing holder goes in the same transaction, the target may
    // follow.
    session.begin();
    session.delete_object(&v).unwrap();
    session.delete_object(&b).unwrap();
    session.commit("unpin and delete").unwrap();
    assert!(kb.get_item(&b).unwrap().is_none());
    assert!(kb.get_item(&v).unwrap().is_none());
}

#[test]
fn clear_reference_nulls_the_attribute_and_keeps_the_holder() {
    let kb = test_kb();
    let b = seed_b(&kb, "b1", "x");
    let session = kb.session("tester");
    session.begin();
    let holder = session
        .create_object(
            TRUNK,
            "H",
            values(&[("mono_current_global", Value::reference(&b))]),
        )
        .unwrap();
    session.commit("hold").unwrap();

    session.begin();
    session.delete_object(&b).unwrap();
    session.commit("delete target").unwrap();

    let kept = kb.get_item(&holder).unwrap().unwrap();
    assert!(kept.value("mono_current_global").is_none());
}

#[test]
fn a_link_committed_after_the_deletion_plan_conflicts() {
    let kb = test_kb();
    let b = seed_b(&kb, "b1", "x");
    let session = kb.session("tester");
    session.begin();
    let c = session.create_object(TRUNK, "C", values(&[])).unwrap();
    session.commit("c").unwrap();

    let deleter = kb.session("deleter");
    deleter.begin();
    deleter.delete_object(&b).unwrap();

    // Another session links to b before the deleter commits.
    let linker = kb.session("linker");
    linker.begin();
    let link = linker
        .create_association(TRUNK, "AB", &b, &c, values(&[]))
        .unwrap();
    linker.commit("link").unwrap();

    let err = deleter.commit("delete b").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    // Nothing persisted: endpoint and link are both alive.
    assert!(kb.get_item(&b).unwrap().is_some());
    assert!(kb.get_item(&link).unwrap().is_some());

    // Replanned against the new state, the deletion takes the link with it.
    deleter.refresh().unwrap();
    deleter.begin();
    deleter.delete_object(&b).unwrap();
    deleter.commit("delete b").unwrap();
    assert!(kb.get_item(&b).unwrap().is_none());
    assert!(kb.get_item(&link).unwrap().is_none());
}

#[test]
fn double_delete_in_one_transaction_is_rejected() {
    let kb = test_kb();
    let b = seed_b(&kb, "b1", "x");
    let session = kb.session("tester");
    session.begin();
    session.delete_object(&b).unwrap();
    let err = session.delete_object(&b).unwrap_err();
    assert!(matches!(err, StrataError::AlreadyDeleted(_)));
}

#[test]
fn any_referer_reports_holders_by_policy() {
    let kb = test_kb();
    let b = seed_b(&kb, "b1", "x");
    let b2 = seed_b(&kb, "b2", "y");
    let session = kb.session("tester");
    session.begin();
    let v = session
        .create_object(TRUNK, "V", values(&[("pinned", Value::reference(&b))]))
        .unwrap();
    let h = session
        .create_object(
            TRUNK,
            "H",
            values(&[("mono_current_global", Value::reference(&b2))]),
        )
        .unwrap();
    session.commit("referers").unwrap();

    let one = session.any_referer(&[b.clone()], None).unwrap();
    assert_eq!(one, vec![(v.clone(), "pinned".to_string())]);

    // Candidates form a set; holders of any of them are reported.
    let all = session.any_referer(&[b.clone(), b2.clone()], None).unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.contains(&(h, "mono_current_global".to_string())));

    let vetoers = session
        .any_referer(&[b, b2], Some(DeletionPolicy::Veto))
        .unwrap();
    assert_eq!(vetoers, vec![(v, "pinned".to_string())]);
}
