//! Revision numbers and commit metadata.
//!
//! A revision is an immutable, strictly increasing commit number. Numbers are
//! allocated under the store's commit lock and never reused or renumbered.
//! Each committed revision has a metadata row: author, RFC 3339 commit time,
//! and a free-text log message.

use std::fmt;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An immutable commit number. `Revision(0)` is the pre-history sentinel
/// (state of a freshly created store, before any commit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl Revision {
    /// State before the first commit.
    pub const INITIAL: Revision = Revision(0);

    /// Lifecycle placeholder for objects created in an open transaction,
    /// before a commit assigns the real number. Never persisted.
    pub const PENDING: Revision = Revision(u64::MAX);

    pub fn next(&self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Revision::PENDING {
            write!(f, "pending")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

/// Metadata of a committed revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    pub revision: Revision,
    pub author: String,
    /// RFC 3339 commit timestamp.
    pub commit_time: String,
    pub log: String,
}

/// Highest committed revision number, 0 for an empty store.
pub(crate) fn max_revision(conn: &Connection) -> Result<u64> {
    let max: Option<i64> = conn.query_row("SELECT MAX(rev) FROM revisions", [], |row| row.get(0))?;
    Ok(max.unwrap_or(0) as u64)
}

pub(crate) fn insert_revision(conn: &Connection, info: &RevisionInfo) -> Result<()> {
    conn.execute(
        "INSERT INTO revisions (rev, author, commit_time, log) VALUES (?1, ?2, ?3, ?4)",
        params![info.revision.0 as i64, info.author, info.commit_time, info.log],
    )?;
    Ok(())
}

pub(crate) fn load_revision(conn: &Connection, rev: Revision) -> Result<Option<RevisionInfo>> {
    let info = conn
        .query_row(
            "SELECT author, commit_time, log FROM revisions WHERE rev = ?1",
            params![rev.0 as i64],
            |row| {
                Ok(RevisionInfo {
                    revision: rev,
                    author: row.get(0)?,
                    commit_time: row.get(1)?,
                    log: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(info)
}

/// Revisions in the half-open range `[from, to)`, ascending.
pub(crate) fn revisions_in_range(
    conn: &Connection,
    from: Revision,
    to: Revision,
) -> Result<Vec<RevisionInfo>> {
    let mut stmt = conn.prepare(
        "SELECT rev, author, commit_time, log FROM revisions \
         WHERE rev >= ?1 AND rev < ?2 ORDER BY rev",
    )?;
    let rows = stmt
        .query_map(params![from.0 as i64, to.0 as i64], |row| {
            Ok(RevisionInfo {
                revision: Revision(row.get::<_, i64>(0)? as u64),
                author: row.get(1)?,
                commit_time: row.get(2)?,
                log: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn revision_rows_round_trip() {
        let conn = db::open_memory_database().unwrap();
        let info = RevisionInfo {
            revision: Revision(1),
            author: "tester".into(),
            commit_time: chrono::Utc::now().to_rfc3339(),
            log: "first".into(),
        };
        insert_revision(&conn, &info).unwrap();

        assert_eq!(max_revision(&conn).unwrap(), 1);
        assert_eq!(load_revision(&conn, Revision(1)).unwrap().unwrap(), info);
        assert!(load_revision(&conn, Revision(2)).unwrap().is_none());
    }

    #[test]
    fn range_is_half_open_and_ordered() {
        let conn = db::open_memory_database().unwrap();
        for r in 1..=4u64 {
            insert_revision(
                &conn,
                &RevisionInfo {
                    revision: Revision(r),
                    author: "tester".into(),
                    commit_time: chrono::Utc::now().to_rfc3339(),
                    log: format!("commit {r}"),
                },
            )
            .unwrap();
        }
        let range = revisions_in_range(&conn, Revision(2), Revision(4)).unwrap();
        let revs: Vec<u64> = range.iter().map(|i| i.revision.0).collect();
        assert_eq!(revs, vec![2, 3]);
    }
}
