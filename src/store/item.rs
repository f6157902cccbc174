//! Version-row persistence for item row attributes.
//!
//! Every committed state of an item is one row covering the revision window
//! `[rev_min, rev_max)`. The head window of an alive item has `rev_max` =
//! [`HEAD_REV`]. Deletion closes the head window without a successor;
//! re-creation of the same identity later starts a fresh incarnation with its
//! own `create_rev`. Unversioned types keep a single head window that is
//! rewritten in place and physically removed on deletion.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::store::key::{BranchId, ObjectId};
use crate::store::value::Value;

/// Open end of a head version window (`i64::MAX` in storage).
pub(crate) const HEAD_REV: u64 = i64::MAX as u64;

/// One persisted version window of an item.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VersionRow {
    pub branch: BranchId,
    pub type_name: String,
    pub obj_id: ObjectId,
    pub rev_min: u64,
    pub rev_max: u64,
    pub create_rev: u64,
    pub creator: String,
    pub created_at: String,
    pub modifier: String,
    pub modified_at: String,
    pub row: BTreeMap<String, Value>,
}

fn row_from_sql(branch: BranchId, type_name: &str, row: &Row<'_>) -> rusqlite::Result<VersionRow> {
    let data: String = row.get(8)?;
    let values: BTreeMap<String, Value> = serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(VersionRow {
        branch,
        type_name: type_name.to_string(),
        obj_id: ObjectId(row.get::<_, i64>(0)? as u64),
        rev_min: row.get::<_, i64>(1)? as u64,
        rev_max: row.get::<_, i64>(2)? as u64,
        create_rev: row.get::<_, i64>(3)? as u64,
        creator: row.get(4)?,
        created_at: row.get(5)?,
        modifier: row.get(6)?,
        modified_at: row.get(7)?,
        row: values,
    })
}

const ROW_COLUMNS: &str =
    "obj_id, rev_min, rev_max, create_rev, creator, created_at, modifier, modified_at, data";

/// The version window of an object containing `rev`, if any.
pub(crate) fn load_version(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    id: ObjectId,
    rev: u64,
) -> Result<Option<VersionRow>> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM item_versions \
         WHERE branch = ?1 AND type_name = ?2 AND obj_id = ?3 \
           AND rev_min <= ?4 AND rev_max > ?4"
    );
    let row = conn
        .query_row(
            &sql,
            params![branch.0 as i64, type_name, id.0 as i64, rev as i64],
            |r| row_from_sql(branch, type_name, r),
        )
        .optional()?;
    Ok(row)
}

/// The head (alive) window of an object, if any.
pub(crate) fn load_head(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    id: ObjectId,
) -> Result<Option<VersionRow>> {
    load_version(conn, branch, type_name, id, HEAD_REV - 1)
}

/// Close the head window at `rev` (the window stops covering `rev`).
pub(crate) fn close_head(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    id: ObjectId,
    rev: u64,
) -> Result<()> {
    conn.execute(
        "UPDATE item_versions SET rev_max = ?4 \
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

pub(crate) fn insert_version(conn: &Connection, v: &VersionRow) -> Result<()> {
    let data = serde_json::to_string(&v.row)?;
    conn.execute(
        "INSERT INTO item_versions \
         (branch, type_name, obj_id, rev_min, rev_max, create_rev, \
          creator, created_at, modifier, modified_at, data) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            v.branch.0 as i64,
            v.type_name,
            v.obj_id.0 as i64,
            v.rev_min as i64,
            v.rev_max as i64,
            v.create_rev as i64,
            v.creator,
            v.created_at,
            v.modifier,
            v.modified_at,
            data,
        ],
    )?;
    Ok(())
}

/// Physically remove all windows of an object (unversioned deletion).
pub(crate) fn delete_rows(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    id: ObjectId,
) -> Result<()> {
    conn.execute(
        "DELETE FROM item_versions WHERE branch = ?1 AND type_name = ?2 AND obj_id = ?3",
        params![branch.0 as i64, type_name, id.0 as i64],
    )?;
    Ok(())
}

/// All version windows of a type on a branch that cover `rev`, ordered by id.
pub(crate) fn rows_at(
    conn: &Connection,
    branch: BranchId,
    type_name: &str,
    rev: u64,
) -> Result<Vec<VersionRow>> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM item_versions \
         WHERE branch = ?1 AND type_name = ?2 AND rev_min <= ?3 AND rev_max > ?3 \
         ORDER BY obj_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![branch.0 as i64, type_name, rev as i64], |r| {
            row_from_sql(branch, type_name, r)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Windows that became valid exactly at `rev`, across all branches and types,
/// ordered by (branch, type, id). Used by the event reader.
pub(crate) fn rows_opened_at(conn: &Connection, rev: u64) -> Result<Vec<VersionRow>> {
    let mut stmt = conn.prepare(
        "SELECT branch, type_name, obj_id, rev_min, rev_max, create_rev, \
                creator, created_at, modifier, modified_at, data \
         FROM item_versions WHERE rev_min = ?1 ORDER BY branch, type_name, obj_id",
    )?;
    collect_full_rows(&mut stmt, rev)
}

/// Windows that were closed exactly at `rev`, ordered by (branch, type, id).
pub(crate) fn rows_closed_at(conn: &Connection, rev: u64) -> Result<Vec<VersionRow>> {
    let mut stmt = conn.prepare(
        "SELECT branch, type_name, obj_id, rev_min, rev_max, create_rev, \
                creator, created_at, modifier, modified_at, data \
         FROM item_versions WHERE rev_max = ?1 ORDER BY branch, type_name, obj_id",
    )?;
    collect_full_rows(&mut stmt, rev)
}

fn collect_full_rows(stmt: &mut rusqlite::Statement<'_>, rev: u64) -> Result<Vec<VersionRow>> {
    let rows = stmt
        .query_map(params![rev as i64], |r| {
            let branch = BranchId(r.get::<_, i64>(0)? as u64);
            let type_name: String = r.get(1)?;
            let data: String = r.get(10)?;
            let values: BTreeMap<String, Value> = serde_json::from_str(&data).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    10,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Ok(VersionRow {
                branch,
                type_name,
                obj_id: ObjectId(r.get::<_, i64>(2)? as u64),
                rev_min: r.get::<_, i64>(3)? as u64,
                rev_max: r.get::<_, i64>(4)? as u64,
                create_rev: r.get::<_, i64>(5)? as u64,
                creator: r.get(6)?,
                created_at: r.get(7)?,
                modifier: r.get(8)?,
                modified_at: r.get(9)?,
                row: values,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Highest allocated object id, 0 for an empty store.
pub(crate) fn max_object_id(conn: &Connection) -> Result<u64> {
    let max: Option<i64> =
        conn.query_row("SELECT MAX(obj_id) FROM item_versions", [], |row| row.get(0))?;
    Ok(max.unwrap_or(0) as u64)
}
