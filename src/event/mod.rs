//! Event and replication model.
//!
//! A committed revision is described by one [`ChangeSet`]: optional
//! branch-creation events, the item creation/update/deletion events of the
//! commit, and the commit metadata. Changesets are the replication wire
//! format (serde-serializable) and the unit of replay on a secondary node.

pub mod apply;
pub mod diff;
pub mod reader;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::key::{BranchId, ObjectId, ObjectKey};
use crate::store::revision::{Revision, RevisionInfo};
use crate::store::value::Value;

/// Identity of the object an event touches, pinned to the event's revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub branch: BranchId,
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: ObjectId,
    pub revision: Revision,
}

impl EventKey {
    pub fn new(branch: BranchId, type_name: &str, id: ObjectId, revision: Revision) -> Self {
        Self {
            branch,
            type_name: type_name.to_string(),
            id,
            revision,
        }
    }

    /// The current key of the touched object.
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::current(self.branch, &self.type_name, self.id)
    }
}

/// A single item change. Value maps merge row and flex attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemEvent {
    /// Initial state of a new incarnation. Always emitted, even with an
    /// empty value map.
    Creation {
        key: EventKey,
        values: BTreeMap<String, Value>,
    },
    /// Old and new values of exactly the attributes that differ. Never
    /// emitted with empty maps — a no-difference update is suppressed.
    Update {
        key: EventKey,
        old: BTreeMap<String, Value>,
        new: BTreeMap<String, Value>,
    },
    /// Full last-known state, including the creation revision of the
    /// deleted incarnation.
    Deletion {
        key: EventKey,
        values: BTreeMap<String, Value>,
        create_rev: Revision,
    },
}

impl ItemEvent {
    pub fn key(&self) -> &EventKey {
        match self {
            Self::Creation { key, .. } | Self::Update { key, .. } | Self::Deletion { key, .. } => {
                key
            }
        }
    }
}

/// Creation of a branch, as seen in the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchEvent {
    pub branch: BranchId,
    pub base_branch: Option<BranchId>,
    pub base_rev: Revision,
    /// Types cut onto the branch; empty means a partial branch owning
    /// nothing (everything shines through).
    pub branched_types: Vec<String>,
}

/// An ordered batch of events for exactly one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub revision: Revision,
    pub branch_events: Vec<BranchEvent>,
    pub events: Vec<ItemEvent>,
    /// Commit metadata; present unless the producing reader was configured
    /// without commit events.
    pub commit: Option<RevisionInfo>,
}

impl ChangeSet {
    pub fn new(revision: Revision) -> Self {
        Self {
            revision,
            branch_events: Vec::new(),
            events: Vec::new(),
            commit: None,
        }
    }

    /// Whether the set carries no events at all.
    pub fn is_empty(&self) -> bool {
        self.branch_events.is_empty() && self.events.is_empty()
    }
}

/// Old and new values of exactly the attributes whose value differs.
pub(crate) fn diff_maps(
    old: &BTreeMap<String, Value>,
    new: &BTreeMap<String, Value>,
) -> (BTreeMap<String, Value>, BTreeMap<String, Value>) {
    let mut old_diff = BTreeMap::new();
    let mut new_diff = BTreeMap::new();
    let names: std::collections::BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for name in names {
        if old.get(name) != new.get(name) {
            if let Some(v) = old.get(name) {
                old_diff.insert(name.clone(), v.clone());
            }
            if let Some(v) = new.get(name) {
                new_diff.insert(name.clone(), v.clone());
            }
        }
    }
    (old_diff, new_diff)
}

/// A source of changesets for replication, by last-known revision.
///
/// The origin store implements this over its event reader; tests and
/// transports may implement it over captured or deserialized sets.
pub trait EventSource {
    /// All changesets with a revision strictly greater than `after`,
    /// ascending.
    fn change_sets_since(&self, after: Revision) -> crate::error::Result<Vec<ChangeSet>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::key::TRUNK;

    #[test]
    fn change_set_round_trips_through_json() {
        let mut values = BTreeMap::new();
        values.insert("a1".to_string(), Value::from("x"));
        let cs = ChangeSet {
            revision: Revision(4),
            branch_events: vec![BranchEvent {
                branch: BranchId(2),
                base_branch: Some(TRUNK),
                base_rev: Revision(3),
                branched_types: vec!["C".into()],
            }],
            events: vec![ItemEvent::Creation {
                key: EventKey::new(TRUNK, "B", ObjectId(7), Revision(4)),
                values,
            }],
            commit: Some(RevisionInfo {
                revision: Revision(4),
                author: "tester".into(),
                commit_time: chrono::Utc::now().to_rfc3339(),
                log: "create b".into(),
            }),
        };

        let json = serde_json::to_string(&cs).unwrap();
        let back: ChangeSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cs);
    }

    #[test]
    fn event_key_exposes_current_object_key() {
        let key = EventKey::new(TRUNK, "B", ObjectId(3), Revision(9));
        let object_key = key.object_key();
        assert_eq!(object_key.to_string(), "B:ID(3)#1-current");
    }
}
