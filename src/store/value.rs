//! Attribute values — a closed, serializable union.
//!
//! Row attributes, flex attributes, and event value maps all carry [`Value`].
//! Reference attributes store a [`RefTarget`]; how that target resolves to an
//! [`ObjectKey`](crate::store::key::ObjectKey) depends on the attribute's
//! declared axes, not on the stored value (see `store::read`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::ValueKind;
use crate::store::key::{BranchId, HistoryContext, ObjectId, ObjectKey};

/// Stored form of a reference attribute value.
///
/// The target type is always recorded (even for monomorphic attributes, where
/// it is redundant); the branch is the target's own branch for branch-global
/// attributes and the holder's branch for branch-local ones. `history` is
/// `Current` until a historic reference stabilizes at commit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RefTarget {
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: ObjectId,
    pub branch: BranchId,
    pub history: HistoryContext,
}

impl RefTarget {
    /// Target from a key, keeping its branch and history context.
    pub fn from_key(key: &ObjectKey) -> Self {
        Self {
            type_name: key.type_name.clone(),
            id: key.id,
            branch: key.branch,
            history: key.history,
        }
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Ref(RefTarget),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::String(_) => ValueKind::String,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::Ref(_) => ValueKind::Ref,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_ref_target(&self) -> Option<&RefTarget> {
        match self {
            Self::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Reference to the given key (current or historic as the key says).
    pub fn reference(key: &ObjectKey) -> Self {
        Self::Ref(RefTarget::from_key(key))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}
