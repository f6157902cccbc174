mod helpers;

use helpers::{scenario_types, values};
use strata::{HistoryContext, KnowledgeBase, Revision, StrataConfig, Value, TRUNK};

fn file_config(dir: &tempfile::TempDir) -> StrataConfig {
    let mut config = StrataConfig::default();
    config.storage.db_path = dir
        .path()
        .join("store.db")
        .to_string_lossy()
        .into_owned();
    config
}

#[test]
fn committed_state_survives_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(&dir);

    let key = {
        let kb = KnowledgeBase::open(&config, scenario_types()).unwrap();
        let session = kb.session("writer");
        session.begin();
        let key = session
            .create_object(
                TRUNK,
                "B",
                values(&[("a1", Value::from("b1")), ("a2", Value::from("first"))]),
            )
            .unwrap();
        session.commit("create").unwrap();

        session.begin();
        session
            .set_attribute(&key, "a2", Some(Value::from("second")))
            .unwrap();
        session.commit("update").unwrap();
        key
    };

    let reopened = KnowledgeBase::open(&config, scenario_types()).unwrap();
    assert_eq!(reopened.last_revision(), Revision(2));
    let stored = reopened.get_item(&key).unwrap().unwrap();
    assert_eq!(stored.value("a2").unwrap().as_str(), Some("second"));
    // History stays readable across the reopen.
    let old = key.with_history(HistoryContext::Revision(Revision(1)));
    let frozen = reopened.get_item(&old).unwrap().unwrap();
    assert_eq!(frozen.value("a2").unwrap().as_str(), Some("first"));
}

#[test]
fn reopened_stores_resume_id_and_revision_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(&dir);

    let first = {
        let kb = KnowledgeBase::open(&config, scenario_types()).unwrap();
        let session = kb.session("writer");
        session.begin();
        let key = session
            .create_object(TRUNK, "B", values(&[("a1", Value::from("b1"))]))
            .unwrap();
        session.commit("create").unwrap();
        key
    };

    let reopened = KnowledgeBase::open(&config, scenario_types()).unwrap();
    let session = reopened.session("writer");
    session.begin();
    let second = session
        .create_object(TRUNK, "B", values(&[("a1", Value::from("b2"))]))
        .unwrap();
    let rev = session.commit("create more").unwrap().unwrap();

    assert_eq!(rev, Revision(2));
    assert!(second.id > first.id);
}
