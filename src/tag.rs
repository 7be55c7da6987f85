//! Tag interning and the `tagxref` derived table.
//!
//! `tagtype` is 0 for a cancel, 1 for a singleton, 2 for a propagating
//! tag. Propagating tags (and cancels of propagating tags) flow down the
//! primary-parent links of `plink` until a newer assertion stops them.

use rusqlite::{params, OptionalExtension};

use crate::errors::Result;
use crate::repo::Repository;

/// Well-known tags with fixed ids, seeded on first use.
pub const TAG_BGCOLOR: i64 = 1;
pub const TAG_COMMENT: i64 = 2;
pub const TAG_USER: i64 = 3;
pub const TAG_DATE: i64 = 4;
pub const TAG_HIDDEN: i64 = 5;
pub const TAG_PRIVATE: i64 = 6;
pub const TAG_CLUSTER: i64 = 7;
pub const TAG_BRANCH: i64 = 8;
pub const TAG_CLOSED: i64 = 9;

const BUILTIN_TAGS: &[(i64, &str)] = &[
    (TAG_BGCOLOR, "bgcolor"),
    (TAG_COMMENT, "comment"),
    (TAG_USER, "user"),
    (TAG_DATE, "date"),
    (TAG_HIDDEN, "hidden"),
    (TAG_PRIVATE, "private"),
    (TAG_CLUSTER, "cluster"),
    (TAG_BRANCH, "branch"),
    (TAG_CLOSED, "closed"),
];

/// Make sure the fixed-id tags exist. Idempotent; called by rebuild and on
/// the first tag insert.
pub fn seed_builtin_tags(repo: &Repository) -> Result<()> {
    for (id, name) in BUILTIN_TAGS {
        repo.conn.execute(
            "INSERT OR IGNORE INTO tag(tagid, tagname) VALUES(?1, ?2)",
            params![id, name],
        )?;
    }
    Ok(())
}

/// Translate a tag name into its id, optionally creating it.
pub fn tag_findid(repo: &Repository, name: &str, create: bool) -> Result<i64> {
    seed_builtin_tags(repo)?;
    let found: Option<i64> = repo
        .conn
        .query_row(
            "SELECT tagid FROM tag WHERE tagname=?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = found {
        return Ok(id);
    }
    if !create {
        return Ok(0);
    }
    repo.conn
        .execute("INSERT INTO tag(tagname) VALUES(?1)", params![name])?;
    Ok(repo.conn.last_insert_rowid())
}

/// Insert a tagxref row applying tag `name` to artifact `rid`.
///
/// A pre-existing assertion with the same or newer mtime wins and the
/// insert becomes a no-op. Propagating tags and cancels then flow to
/// descendants. Returns the tagid.
pub fn tag_insert(
    repo: &mut Repository,
    name: &str,
    tagtype: i64,
    value: Option<&str>,
    srcid: i64,
    mtime: f64,
    rid: i64,
) -> Result<i64> {
    let tagid = tag_findid(repo, name, true)?;
    let newer: Option<f64> = repo
        .conn
        .query_row(
            "SELECT mtime FROM tagxref WHERE tagid=?1 AND rid=?2",
            params![tagid, rid],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing) = newer {
        if existing >= mtime {
            return Ok(tagid);
        }
    }
    repo.conn.execute(
        "REPLACE INTO tagxref(tagid, tagtype, srcid, origid, value, mtime, rid) \
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![tagid, tagtype, srcid, rid, value, mtime, rid],
    )?;
    // Display-override tags refresh the event row in place.
    let live = tagtype > 0;
    match tagid {
        TAG_BGCOLOR => {
            repo.conn.execute(
                "UPDATE event SET bgcolor=?1 WHERE objid=?2",
                params![if live { value } else { None }, rid],
            )?;
        }
        TAG_DATE if live && value.is_some() => {
            repo.conn.execute(
                "UPDATE event SET mtime=julianday(?1) WHERE objid=?2",
                params![value, rid],
            )?;
        }
        TAG_USER => {
            repo.conn.execute(
                "UPDATE event SET euser=?1 WHERE objid=?2",
                params![if live { value } else { None }, rid],
            )?;
        }
        TAG_COMMENT => {
            repo.conn.execute(
                "UPDATE event SET ecomment=?1 WHERE objid=?2",
                params![if live { value } else { None }, rid],
            )?;
        }
        _ => {}
    }
    if tagtype == 0 || tagtype == 2 {
        tag_propagate(repo, rid, tagid, tagtype, rid, value, mtime)?;
    }
    Ok(tagid)
}

/// Propagate one tag assertion from `pid` down the primary `plink` edges.
/// `tagtype` 2 carries the value forward; 0 erases propagated rows. A row
/// whose mtime is newer, or which is its own origin, stops the walk.
fn tag_propagate(
    repo: &mut Repository,
    pid: i64,
    tagid: i64,
    tagtype: i64,
    origid: i64,
    value: Option<&str>,
    mtime: f64,
) -> Result<()> {
    let mut pending = vec![pid];
    while let Some(p) = pending.pop() {
        let children: Vec<i64> = {
            let mut stmt = repo
                .conn
                .prepare_cached("SELECT cid FROM plink WHERE pid=?1 AND isprim")?;
            let __rows = stmt.query_map(params![p], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        for cid in children {
            let existing: Option<(f64, i64)> = repo
                .conn
                .query_row(
                    "SELECT mtime, origid FROM tagxref WHERE tagid=?1 AND rid=?2",
                    params![tagid, cid],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((child_mtime, child_origid)) = existing {
                // A direct assertion on the child (its own origin) or a
                // newer propagated value blocks this walk.
                if child_origid == cid || child_mtime >= mtime {
                    continue;
                }
            }
            if tagtype == 2 {
                repo.conn.execute(
                    "REPLACE INTO tagxref(tagid, tagtype, srcid, origid, value, mtime, rid) \
                     VALUES(?1, 2, 0, ?2, ?3, ?4, ?5)",
                    params![tagid, origid, value, mtime, cid],
                )?;
            } else {
                repo.conn.execute(
                    "DELETE FROM tagxref WHERE tagid=?1 AND rid=?2 AND origid<>rid",
                    params![tagid, cid],
                )?;
            }
            pending.push(cid);
        }
    }
    Ok(())
}

/// Re-run propagation for every tag asserted on `pid`. Called after new
/// children of `pid` are crosslinked.
pub fn tag_propagate_all(repo: &mut Repository, pid: i64) -> Result<()> {
    let rows: Vec<(i64, i64, Option<String>, f64, i64)> = {
        let mut stmt = repo.conn.prepare_cached(
            "SELECT tagid, tagtype, value, mtime, origid FROM tagxref WHERE rid=?1",
        )?;
        let __rows = stmt.query_map(params![pid], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?
        .collect::<rusqlite::Result<_>>()?;
        __rows
    };
    for (tagid, tagtype, value, mtime, origid) in rows {
        if tagtype == 0 || tagtype == 2 {
            tag_propagate(repo, pid, tagid, tagtype, origid, value.as_deref(), mtime)?;
        }
    }
    Ok(())
}

/// The current value of a tag on an artifact, honoring only live (>0)
/// assertions.
pub fn tag_value(repo: &Repository, rid: i64, tagid: i64) -> Result<Option<String>> {
    Ok(repo
        .conn
        .query_row(
            "SELECT value FROM tagxref WHERE rid=?1 AND tagid=?2 AND tagtype>0",
            params![rid, tagid],
            |row| row.get(0),
        )
        .optional()?
        .flatten())
}

/// The branch name of a check-in, if any.
pub fn branch_of_rid(repo: &Repository, rid: i64) -> Result<Option<String>> {
    tag_value(repo, rid, TAG_BRANCH)
}

/// True if the check-in carries a live `closed` tag.
pub fn leaf_is_closed(repo: &Repository, rid: i64) -> Result<bool> {
    Ok(repo
        .conn
        .query_row(
            "SELECT 1 FROM tagxref WHERE rid=?1 AND tagid=?2 AND tagtype>0",
            params![rid, TAG_CLOSED],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::Repository;
    use rusqlite::params;

    fn link(repo: &Repository, pid: i64, cid: i64, mtime: f64) {
        repo.conn
            .execute(
                "INSERT INTO plink(pid, cid, isprim, mtime) VALUES(?1, ?2, 1, ?3)",
                params![pid, cid, mtime],
            )
            .unwrap();
    }

    fn tagtype_of(repo: &Repository, rid: i64, tagid: i64) -> Option<i64> {
        repo.conn
            .query_row(
                "SELECT tagtype FROM tagxref WHERE rid=?1 AND tagid=?2",
                params![rid, tagid],
                |r| r.get(0),
            )
            .ok()
    }

    /// Propagating tags flow down primary links; cancels stop them.
    #[test]
    fn propagate_and_cancel() {
        let mut repo = Repository::create_in_memory("t").unwrap();
        // chain 1 -> 2 -> 3
        link(&repo, 1, 2, 10.0);
        link(&repo, 2, 3, 11.0);
        let tagid = tag_insert(&mut repo, "branch", 2, Some("feat"), 1, 12.0, 1).unwrap();
        assert_eq!(tagtype_of(&repo, 2, tagid), Some(2));
        assert_eq!(tagtype_of(&repo, 3, tagid), Some(2));
        assert_eq!(tag_value(&repo, 3, tagid).unwrap().as_deref(), Some("feat"));

        // A cancel on 2 erases the propagated rows below it.
        tag_insert(&mut repo, "branch", 0, None, 2, 13.0, 2).unwrap();
        assert_eq!(tagtype_of(&repo, 2, tagid), Some(0));
        assert_eq!(tagtype_of(&repo, 3, tagid), None);
    }

    /// An older assertion never overwrites a newer one.
    #[test]
    fn newer_assertion_wins() {
        let mut repo = Repository::create_in_memory("t").unwrap();
        let tagid = tag_insert(&mut repo, "sym-x", 1, None, 1, 20.0, 5).unwrap();
        tag_insert(&mut repo, "sym-x", 0, None, 1, 10.0, 5).unwrap();
        assert_eq!(tagtype_of(&repo, 5, tagid), Some(1));
    }

    /// A direct assertion on a child blocks propagation over it.
    #[test]
    fn direct_assertion_blocks_propagation() {
        let mut repo = Repository::create_in_memory("t").unwrap();
        link(&repo, 1, 2, 10.0);
        link(&repo, 2, 3, 11.0);
        // Child 2 asserts its own branch first.
        tag_insert(&mut repo, "branch", 2, Some("other"), 2, 5.0, 2).unwrap();
        tag_insert(&mut repo, "branch", 2, Some("feat"), 1, 12.0, 1).unwrap();
        let tagid = tag_findid(&repo, "branch", false).unwrap();
        assert_eq!(
            tag_value(&repo, 2, tagid).unwrap().as_deref(),
            Some("other")
        );
        // And 3 keeps 2's propagated value, not 1's.
        assert_eq!(
            tag_value(&repo, 3, tagid).unwrap().as_deref(),
            Some("other")
        );
    }
}
