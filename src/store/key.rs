//! Object identity — [`ObjectKey`] and its compact string form.
//!
//! A key names an item as `(branch, history context, type, local id)`. The
//! current identity and every stabilized historic identity of the same item
//! are distinct key values; they never compare equal.
//!
//! String form: `<type>:ID(<id>)#<branch>-<history>` where `<history>` is
//! `current` or a revision number. A legacy form without the `#` suffix
//! parses as trunk + current.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store::revision::Revision;

/// Identifier of a branch. Trunk is branch 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId(pub u64);

/// The root branch.
pub const TRUNK: BranchId = BranchId(1);

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Branch-local identifier of an item. Unique per store, allocated at
/// creation time, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// History axis of a key: the live state, or a stabilized past revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryContext {
    /// Latest, possibly uncommitted state.
    Current,
    /// The state as of a specific committed revision.
    Revision(Revision),
}

impl HistoryContext {
    pub fn is_current(&self) -> bool {
        matches!(self, Self::Current)
    }

    pub fn revision(&self) -> Option<Revision> {
        match self {
            Self::Current => None,
            Self::Revision(r) => Some(*r),
        }
    }
}

impl fmt::Display for HistoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => f.write_str("current"),
            Self::Revision(r) => write!(f, "{}", r.0),
        }
    }
}

/// Full identity of an item in a specific branch and history context.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub branch: BranchId,
    pub history: HistoryContext,
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: ObjectId,
}

impl ObjectKey {
    pub fn current(branch: BranchId, type_name: &str, id: ObjectId) -> Self {
        Self {
            branch,
            history: HistoryContext::Current,
            type_name: type_name.to_string(),
            id,
        }
    }

    pub fn historic(branch: BranchId, revision: Revision, type_name: &str, id: ObjectId) -> Self {
        Self {
            branch,
            history: HistoryContext::Revision(revision),
            type_name: type_name.to_string(),
            id,
        }
    }

    /// The same item identity in a different history context.
    pub fn with_history(&self, history: HistoryContext) -> Self {
        Self {
            history,
            ..self.clone()
        }
    }

    /// Branch/type/id triple without the history axis.
    pub(crate) fn item_ref(&self) -> ItemRef {
        ItemRef {
            branch: self.branch,
            type_name: self.type_name.clone(),
            id: self.id,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:ID({})#{}-{}",
            self.type_name, self.id, self.branch, self.history
        )
    }
}

impl FromStr for ObjectKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, context) = match s.split_once('#') {
            Some((head, ctx)) => (head, Some(ctx)),
            None => (s, None),
        };

        let (type_name, id_part) = head
            .split_once(":ID(")
            .ok_or_else(|| format!("malformed object key: {s}"))?;
        let id_digits = id_part
            .strip_suffix(')')
            .ok_or_else(|| format!("malformed object key: {s}"))?;
        let id: u64 = id_digits
            .parse()
            .map_err(|_| format!("malformed object id in key: {s}"))?;
        if type_name.is_empty() {
            return Err(format!("malformed object key: {s}"));
        }

        let (branch, history) = match context {
            // Legacy form without branch context: trunk, current.
            None => (TRUNK, HistoryContext::Current),
            Some(ctx) => {
                let (branch_digits, history_part) = ctx
                    .split_once('-')
                    .ok_or_else(|| format!("malformed key context: {s}"))?;
                let branch: u64 = branch_digits
                    .parse()
                    .map_err(|_| format!("malformed branch in key: {s}"))?;
                let history = if history_part == "current" {
                    HistoryContext::Current
                } else {
                    let rev: u64 = history_part
                        .parse()
                        .map_err(|_| format!("malformed history context in key: {s}"))?;
                    HistoryContext::Revision(Revision(rev))
                };
                (BranchId(branch), history)
            }
        };

        Ok(ObjectKey {
            branch,
            history,
            type_name: type_name.to_string(),
            id: ObjectId(id),
        })
    }
}

/// History-free identity triple, used as cache and overlay key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ItemRef {
    pub branch: BranchId,
    pub type_name: String,
    pub id: ObjectId,
}

impl ItemRef {
    pub(crate) fn current_key(&self) -> ObjectKey {
        ObjectKey::current(self.branch, &self.type_name, self.id)
    }
}
