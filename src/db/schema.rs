//! SQL DDL for the backing store.
//!
//! Defines the `revisions`, `branches`, `branch_types`, `item_versions`,
//! `flex_versions`, and `schema_meta` tables. All DDL uses `IF NOT EXISTS`
//! for idempotent initialization.
//!
//! Version windows: every row in `item_versions` / `flex_versions` covers the
//! half-open revision range `[rev_min, rev_max)`; the head window of an alive
//! object has `rev_max` = `i64::MAX`.

use rusqlite::Connection;

/// All schema DDL statements for the store's tables.
const SCHEMA_SQL: &str = r#"
-- Commit metadata, one row per allocated revision
CREATE TABLE IF NOT EXISTS revisions (
    rev INTEGER PRIMARY KEY,
    author TEXT NOT NULL,
    commit_time TEXT NOT NULL,
    log TEXT NOT NULL
);

-- Branch tree; base_branch is NULL only for trunk
CREATE TABLE IF NOT EXISTS branches (
    branch_id INTEGER PRIMARY KEY,
    base_branch INTEGER REFERENCES branches(branch_id),
    base_rev INTEGER NOT NULL,
    create_rev INTEGER NOT NULL
);

-- Types owned ("cut") by a branch; types absent here shine through to the base
CREATE TABLE IF NOT EXISTS branch_types (
    branch_id INTEGER NOT NULL REFERENCES branches(branch_id),
    type_name TEXT NOT NULL,
    PRIMARY KEY (branch_id, type_name)
);

-- Row-attribute version windows
CREATE TABLE IF NOT EXISTS item_versions (
    branch INTEGER NOT NULL,
    type_name TEXT NOT NULL,
    obj_id INTEGER NOT NULL,
    rev_min INTEGER NOT NULL,
    rev_max INTEGER NOT NULL,
    create_rev INTEGER NOT NULL,
    creator TEXT NOT NULL,
    created_at TEXT NOT NULL,
    modifier TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (branch, type_name, obj_id, rev_min)
);

CREATE INDEX IF NOT EXISTS idx_item_versions_head
    ON item_versions(branch, type_name, rev_max);
CREATE INDEX IF NOT EXISTS idx_item_versions_rev_min
    ON item_versions(rev_min);
CREATE INDEX IF NOT EXISTS idx_item_versions_rev_max
    ON item_versions(rev_max);

-- Flex-attribute version windows; a new window only when flex data changes
CREATE TABLE IF NOT EXISTS flex_versions (
    branch INTEGER NOT NULL,
    type_name TEXT NOT NULL,
    obj_id INTEGER NOT NULL,
    rev_min INTEGER NOT NULL,
    rev_max INTEGER NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (branch, type_name, obj_id, rev_min)
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    // Bootstrap trunk
    conn.execute(
        "INSERT OR IGNORE INTO branches (branch_id, base_branch, base_rev, create_rev) \
         VALUES (1, NULL, 0, 0)",
        [],
    )?;

    Ok(())
}
