//! Branch bookkeeping — the branch tree and partial-branch type ownership.
//!
//! Every branch except trunk has a base branch and a base revision (the fork
//! point). A branch *owns* the types that were branched onto it; data of
//! non-owned types shines through from the base branch, clamped to the fork
//! revision. Trunk owns every type.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::store::key::{BranchId, TRUNK};
use crate::store::revision::Revision;

/// A branch handle. Handles naming the same branch id compare equal, no
/// matter which context they were obtained through.
#[derive(Debug, Clone)]
pub struct Branch {
    id: BranchId,
    base: Option<BranchId>,
    base_rev: Revision,
    create_rev: Revision,
    owned_types: BTreeSet<String>,
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Branch {}

impl Branch {
    pub fn id(&self) -> BranchId {
        self.id
    }

    /// Base branch; `None` only for trunk.
    pub fn base(&self) -> Option<BranchId> {
        self.base
    }

    /// Revision of the base branch at which this branch was forked.
    pub fn base_revision(&self) -> Revision {
        self.base_rev
    }

    /// Revision allocated by the branch-creating commit.
    pub fn create_revision(&self) -> Revision {
        self.create_rev
    }

    pub fn is_trunk(&self) -> bool {
        self.base.is_none()
    }

    /// Whether items of `type_name` live on this branch itself (as opposed to
    /// shining through from the base).
    pub fn owns(&self, type_name: &str) -> bool {
        self.is_trunk() || self.owned_types.contains(type_name)
    }

    /// Types branched onto this branch. Empty for trunk (which owns all).
    pub fn owned_types(&self) -> &BTreeSet<String> {
        &self.owned_types
    }
}

pub(crate) fn load_branch(conn: &Connection, id: BranchId) -> Result<Option<Branch>> {
    let row = conn
        .query_row(
            "SELECT base_branch, base_rev, create_rev FROM branches WHERE branch_id = ?1",
            params![id.0 as i64],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((base, base_rev, create_rev)) = row else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT type_name FROM branch_types WHERE branch_id = ?1 ORDER BY type_name")?;
    let owned_types = stmt
        .query_map(params![id.0 as i64], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;

    Ok(Some(Branch {
        id,
        base: base.map(|b| BranchId(b as u64)),
        base_rev: Revision(base_rev as u64),
        create_rev: Revision(create_rev as u64),
        owned_types,
    }))
}

pub(crate) fn insert_branch(conn: &Connection, branch: &Branch) -> Result<()> {
    conn.execute(
        "INSERT INTO branches (branch_id, base_branch, base_rev, create_rev) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            branch.id.0 as i64,
            branch.base.map(|b| b.0 as i64),
            branch.base_rev.0 as i64,
            branch.create_rev.0 as i64,
        ],
    )?;
    for type_name in &branch.owned_types {
        conn.execute(
            "INSERT INTO branch_types (branch_id, type_name) VALUES (?1, ?2)",
            params![branch.id.0 as i64, type_name],
        )?;
    }
    Ok(())
}

/// Build an in-memory handle for a branch about to be created.
pub(crate) fn new_branch(
    id: BranchId,
    base: BranchId,
    base_rev: Revision,
    create_rev: Revision,
    owned_types: BTreeSet<String>,
) -> Branch {
    Branch {
        id,
        base: Some(base),
        base_rev,
        create_rev,
        owned_types,
    }
}

/// All branch ids, ascending. Trunk is always present.
pub(crate) fn branch_ids(conn: &Connection) -> Result<Vec<BranchId>> {
    let mut stmt = conn.prepare("SELECT branch_id FROM branches ORDER BY branch_id")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .map(|r| r.map(|id| BranchId(id as u64)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub(crate) fn next_branch_id(conn: &Connection) -> Result<BranchId> {
    let max: Option<i64> =
        conn.query_row("SELECT MAX(branch_id) FROM branches", [], |row| row.get(0))?;
    Ok(BranchId(max.unwrap_or(0) as u64 + 1))
}

/// Branches whose creating commit is `rev`, for the event reader.
pub(crate) fn branches_created_at(conn: &Connection, rev: Revision) -> Result<Vec<Branch>> {
    let mut stmt = conn.prepare(
        "SELECT branch_id FROM branches WHERE create_rev = ?1 ORDER BY branch_id",
    )?;
    let ids = stmt
        .query_map(params![rev.0 as i64], |row| row.get::<_, i64>(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    let mut branches = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(b) = load_branch(conn, BranchId(id as u64))? {
            branches.push(b);
        }
    }
    Ok(branches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn trunk_owns_everything() {
        let conn = db::open_memory_database().unwrap();
        let trunk = load_branch(&conn, TRUNK).unwrap().unwrap();
        assert!(trunk.is_trunk());
        assert!(trunk.owns("anything"));
        assert_eq!(trunk.base(), None);
    }

    #[test]
    fn partial_branch_owns_only_cut_types() {
        let conn = db::open_memory_database().unwrap();
        let branch = new_branch(
            BranchId(2),
            TRUNK,
            Revision(5),
            Revision(6),
            ["C".to_string()].into_iter().collect(),
        );
        insert_branch(&conn, &branch).unwrap();

        let loaded = load_branch(&conn, BranchId(2)).unwrap().unwrap();
        assert!(loaded.owns("C"));
        assert!(!loaded.owns("B"));
        assert_eq!(loaded.base(), Some(TRUNK));
        assert_eq!(loaded.base_revision(), Revision(5));
    }

    #[test]
    fn handles_for_same_id_compare_equal() {
        let conn = db::open_memory_database().unwrap();
        let a = load_branch(&conn, TRUNK).unwrap().unwrap();
        let b = load_branch(&conn, TRUNK).unwrap().unwrap();
        assert_eq!(a, b);
    }
}
