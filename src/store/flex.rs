//! Flex attribute overlay — schema-less values layered on items.
//!
//! Flex data is versioned at item granularity: the whole map gets a new
//! version window when any flex attribute of the item changes, independent of
//! row-attribute windows. Read paths merge flex values under row values;
//! callers cannot tell the two apart except through constraint rules (flex
//! attributes are never mandatory or unique, and may not hold references).

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::store::item::HEAD_REV;
use crate::store::key::{BranchId, ObjectId};
use crate::store::value::Value;

/// The flex map of an object as of `rev`. Empty map if no window covers it.
pub(crate) fn load_flex(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    id: ObjectId,
    rev: u64,
) -> Result<BTreeMap<String, Value>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM flex_versions \
             WHERE branch = ?1 AND type_name = ?2 AND obj_id = ?3 \
               AND rev_min <= ?4 AND rev_max > ?4",
            params![branch.0 as i64, type_name, id.0 as i64, rev as i64],
            |row| row.get(0),
        )
        .optional()?;
    match data {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(BTreeMap::new()),
    }
}

pub(crate) fn close_flex_head(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    id: ObjectId,
    rev: u64,
) -> Result<()> {
    conn.execute(
        "UPDATE flex_versions SET rev_max = ?4 \
         WHERE branch = ?1 AND type_name = ?2 AND obj_id = ?3 AND rev_max = ?5",
        params![
            branch.0 as i64,
            type_name,
            id.0 as i64,
            rev as i64,
            HEAD_REV as i64
        ],
    )?;
    Ok(())
}

/// Open a new flex window at `rev`. Empty maps are not persisted.
pub(crate) fn insert_flex(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    id: ObjectId,
    rev: u64,
    flex: &BTreeMap<String, Value>,
) -> Result<()> {
    if flex.is_empty() {
        return Ok(());
    }
    let data = serde_json::to_string(flex)?;
    conn.execute(
        "INSERT INTO flex_versions (branch, type_name, obj_id, rev_min, rev_max, data) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            branch.0 as i64,
            type_name,
            id.0 as i64,
            rev as i64,
            HEAD_REV as i64,
            data,
        ],
    )?;
    Ok(())
}

/// Physically remove all flex windows of an object (unversioned deletion).
pub(crate) fn delete_flex_rows(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    id: ObjectId,
) -> Result<()> {
    conn.execute(
        "DELETE FROM flex_versions WHERE branch = ?1 AND type_name = ?2 AND obj_id = ?3",
        params![branch.0 as i64, type_name, id.0 as i64],
    )?;
    Ok(())
}
