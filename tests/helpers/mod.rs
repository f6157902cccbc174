#![allow(dead_code)]

use std::collections::BTreeMap;

use strata::{
    DeletionPolicy, KnowledgeBase, ObjectKey, ReferenceSpec, TypeBuilder, TypeRepository, Value,
    ValueKind, TRUNK,
};

/// The shared test schema.
///
/// - `B`: versioned item, `a1` unique, `a2` plain
/// - `C`: versioned item
/// - `M`: versioned item with a mandatory attribute
/// - `U`: unversioned item
/// - `V`: holds a vetoing reference to `B`
/// - `AB`: association from `B` to `C` with a filterable `tag`
/// - `H`: holder with one reference attribute per axis combination
pub fn scenario_types() -> TypeRepository {
    TypeRepository::builder()
        .ty(TypeBuilder::item("B")
            .plain("a1", ValueKind::String)
            .unique()
            .plain("a2", ValueKind::String))
        .ty(TypeBuilder::item("C").plain("c1", ValueKind::String))
        .ty(TypeBuilder::item("M")
            .plain("name", ValueKind::String)
            .mandatory())
        .ty(TypeBuilder::item("U")
            .unversioned()
            .plain("u1", ValueKind::String))
        .ty(TypeBuilder::item("V").reference(
            "pinned",
            ReferenceSpec::to("B").on_delete(DeletionPolicy::Veto),
        ))
        .ty(TypeBuilder::association("AB", ReferenceSpec::to("B"), ReferenceSpec::to("C"))
            .plain("tag", ValueKind::String))
        .ty(holder_type())
        .build()
        .unwrap()
}

/// One reference attribute per (target, history, scope) combination, all
/// clear-reference on deletion.
fn holder_type() -> TypeBuilder {
    TypeBuilder::item("H")
        .reference("mono_current_global", ReferenceSpec::to("B"))
        .reference("mono_current_local", ReferenceSpec::to("B").branch_local())
        .reference("mono_historic_global", ReferenceSpec::to("B").historic())
        .reference(
            "mono_historic_local",
            ReferenceSpec::to("B").historic().branch_local(),
        )
        .reference("mono_mixed_global", ReferenceSpec::to("B").mixed())
        .reference("mono_mixed_local", ReferenceSpec::to("B").mixed().branch_local())
        .reference("poly_current_global", ReferenceSpec::poly())
        .reference("poly_current_local", ReferenceSpec::poly().branch_local())
        .reference("poly_historic_global", ReferenceSpec::poly().historic())
        .reference(
            "poly_historic_local",
            ReferenceSpec::poly().historic().branch_local(),
        )
        .reference("poly_mixed_global", ReferenceSpec::poly().mixed())
        .reference("poly_mixed_local", ReferenceSpec::poly().mixed().branch_local())
}

/// Open a fresh in-memory store with the shared schema.
pub fn test_kb() -> KnowledgeBase {
    KnowledgeBase::open_in_memory(scenario_types()).unwrap()
}

/// Shorthand for an initial value map.
pub fn values(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Create and commit a single `B` on trunk, returning its key.
pub fn seed_b(kb: &KnowledgeBase, a1: &str, a2: &str) -> ObjectKey {
    let session = kb.session("seeder");
    session.begin();
    let key = session
        .create_object(
            TRUNK,
            "B",
            values(&[("a1", Value::from(a1)), ("a2", Value::from(a2))]),
        )
        .unwrap();
    session.commit("seed b").unwrap();
    key
}

/// Install a subscriber so failing tests show their trace output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}
