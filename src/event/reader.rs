//! Reading committed revisions back as changesets.
//!
//! An [`EventReader`] iterates the changesets of a revision range, rebuilt
//! from the version windows each commit opened and closed. Filters restrict
//! the result to selected branches or types; branch and commit events are
//! opt-in. The reader is the producer side of replication: the store's
//! [`EventSource`] implementation is a fully configured reader.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rusqlite::Connection;

use crate::error::Result;
use crate::event::{diff_maps, ChangeSet, EventKey, EventSource, ItemEvent};
use crate::store::branch::branches_created_at;
use crate::store::flex::load_flex;
use crate::store::item::{rows_closed_at, rows_opened_at, VersionRow};
use crate::store::key::{BranchId, ObjectId};
use crate::store::revision::{revisions_in_range, Revision, RevisionInfo};
use crate::store::value::Value;
use crate::store::{branch_event, KnowledgeBase};

/// Iterator over the changesets of the half-open revision range `[from, to)`.
///
/// Yields one changeset per revision that produced events under the active
/// filters; revisions without matching events are skipped unless commit
/// events are requested.
pub struct EventReader {
    kb: KnowledgeBase,
    from: Revision,
    to: Revision,
    branches: Option<BTreeSet<BranchId>>,
    types: Option<BTreeSet<String>>,
    branch_events: bool,
    commit_events: bool,
    pending: Option<VecDeque<RevisionInfo>>,
}

impl EventReader {
    pub fn new(kb: &KnowledgeBase, from: Revision, to: Revision) -> Self {
        Self {
            kb: kb.clone(),
            from,
            to,
            branches: None,
            types: None,
            branch_events: false,
            commit_events: false,
            pending: None,
        }
    }

    /// Restrict item and branch events to the given branches.
    pub fn branches(mut self, branches: &[BranchId]) -> Self {
        self.branches = Some(branches.iter().copied().collect());
        self
    }

    /// Restrict item events to the given item types.
    pub fn types(mut self, types: &[&str]) -> Self {
        self.types = Some(types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Include branch-creation events.
    pub fn with_branch_events(mut self) -> Self {
        self.branch_events = true;
        self
    }

    /// Include commit metadata on every changeset, and emit a changeset for
    /// every revision in range even when no event matches.
    pub fn with_commit_events(mut self) -> Self {
        self.commit_events = true;
        self
    }

    fn branch_allowed(&self, branch: BranchId) -> bool {
        self.branches.as_ref().map_or(true, |b| b.contains(&branch))
    }

    fn row_allowed(&self, row: &VersionRow) -> bool {
        self.branch_allowed(row.branch)
            && self
                .types
                .as_ref()
                .map_or(true, |t| t.contains(&row.type_name))
    }

    /// Rebuild the changeset of one committed revision.
    fn build(&self, conn: &Connection, info: &RevisionInfo) -> Result<Option<ChangeSet>> {
        let rev = info.revision;
        let types = &self.kb.inner.types;
        let mut set = ChangeSet::new(rev);
        if self.commit_events {
            set.commit = Some(info.clone());
        }

        let created_branches = branches_created_at(conn, rev)?;
        // Rows opened by a branch-creating commit are fork copies; consumers
        // materialize those from the branch event instead.
        let fresh: BTreeSet<BranchId> = created_branches.iter().map(|b| b.id()).collect();
        if self.branch_events {
            for branch in &created_branches {
                if self.branch_allowed(branch.id()) {
                    set.branch_events.push(branch_event(branch));
                }
            }
        }

        let mut closed: BTreeMap<(BranchId, String, ObjectId), VersionRow> =
            rows_closed_at(conn, rev.0)?
                .into_iter()
                .map(|r| ((r.branch, r.type_name.clone(), r.obj_id), r))
                .collect();

        for opened in rows_opened_at(conn, rev.0)? {
            let slot = (opened.branch, opened.type_name.clone(), opened.obj_id);
            if fresh.contains(&opened.branch) {
                closed.remove(&slot);
                continue;
            }
            if !self.row_allowed(&opened) {
                closed.remove(&slot);
                continue;
            }
            let Ok(ty) = types.get(&opened.type_name) else {
                continue;
            };
            if !ty.versioned {
                closed.remove(&slot);
                continue;
            }
            let key = EventKey::new(opened.branch, &opened.type_name, opened.obj_id, rev);
            let new_values = merged_at(conn, &opened, rev.0)?;
            match closed.remove(&slot) {
                Some(old_row) => {
                    let old_values = merged_at(conn, &old_row, rev.0 - 1)?;
                    let (old, new) = diff_maps(&old_values, &new_values);
                    if !old.is_empty() || !new.is_empty() {
                        set.events.push(ItemEvent::Update { key, old, new });
                    }
                }
                None => set.events.push(ItemEvent::Creation {
                    key,
                    values: new_values,
                }),
            }
        }

        // Windows closed without a successor are deletions.
        for ((branch, type_name, id), row) in closed {
            if !self.row_allowed(&row) {
                continue;
            }
            let Ok(ty) = types.get(&type_name) else {
                continue;
            };
            if !ty.versioned {
                continue;
            }
            set.events.push(ItemEvent::Deletion {
                key: EventKey::new(branch, &type_name, id, rev),
                values: merged_at(conn, &row, rev.0 - 1)?,
                create_rev: Revision(row.create_rev),
            });
        }
        set.events.sort_by(|a, b| a.key().cmp(b.key()));

        if set.is_empty() && !self.commit_events {
            return Ok(None);
        }
        Ok(Some(set))
    }
}

fn merged_at(conn: &Connection, row: &VersionRow, rev: u64) -> Result<BTreeMap<String, Value>> {
    let mut values = load_flex(conn, row.branch, &row.type_name, row.obj_id, rev)?;
    for (name, value) in &row.row {
        values.insert(name.clone(), value.clone());
    }
    Ok(values)
}

impl Iterator for EventReader {
    type Item = Result<ChangeSet>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pending.is_none() {
                match self
                    .kb
                    .with_conn(|conn| revisions_in_range(conn, self.from, self.to))
                {
                    Ok(revs) => self.pending = Some(revs.into()),
                    Err(e) => {
                        self.pending = Some(VecDeque::new());
                        return Some(Err(e));
                    }
                }
            }
            let info = self.pending.as_mut()?.pop_front()?;
            match self.kb.with_conn(|conn| self.build(conn, &info)) {
                Ok(Some(set)) => return Some(Ok(set)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl EventSource for KnowledgeBase {
    fn change_sets_since(&self, after: Revision) -> Result<Vec<ChangeSet>> {
        EventReader::new(self, Revision(after.0 + 1), self.last_revision().next())
            .with_branch_events()
            .with_commit_events()
            .collect()
    }
}
