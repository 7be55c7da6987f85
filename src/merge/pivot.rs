//! Nearest-common-ancestor search over the `plink` graph.
//!
//! A bidirectional best-first walk: the primary and secondary starting
//! points expand upward through parents in decreasing time order, and the
//! first node reached from both sides is the pivot. Expanding newest-first
//! makes that node the *nearest* common ancestor.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};

use crate::errors::Result;
use crate::repo::Repository;

const FROM_PRIMARY: u8 = 1;
const FROM_SECONDARY: u8 = 2;

fn node_mtime(repo: &Repository, rid: i64) -> Result<f64> {
    let t: Option<f64> = repo
        .conn
        .query_row(
            "SELECT mtime FROM event WHERE objid=?1",
            params![rid],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(t) = t {
        return Ok(t);
    }
    Ok(repo
        .conn
        .query_row(
            "SELECT mtime FROM plink WHERE cid=?1 LIMIT 1",
            params![rid],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0.0))
}

/// Find the nearest common ancestor of `primary` and the `secondaries`.
/// With `ignore_merges` only primary parent links are walked (used for the
/// rename "name pivot"). Returns None when the histories never meet.
pub fn pivot_find(
    repo: &Repository,
    primary: i64,
    secondaries: &[i64],
    ignore_merges: bool,
) -> Result<Option<i64>> {
    // mask of sides that reached each node, plus its pending flag
    let mut mask: HashMap<i64, u8> = HashMap::new();
    let mut pending: HashMap<i64, f64> = HashMap::new();

    mask.insert(primary, FROM_PRIMARY);
    pending.insert(primary, node_mtime(repo, primary)?);
    for &s in secondaries {
        let m = mask.entry(s).or_insert(0);
        *m |= FROM_SECONDARY;
        pending.insert(s, node_mtime(repo, s)?);
    }
    if mask.get(&primary) == Some(&(FROM_PRIMARY | FROM_SECONDARY)) {
        return Ok(Some(primary));
    }

    while !pending.is_empty() {
        // Take the newest pending node.
        let (&rid, _) = pending
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap();
        pending.remove(&rid);
        let m = *mask.get(&rid).unwrap_or(&0);
        if m == FROM_PRIMARY | FROM_SECONDARY {
            return Ok(Some(rid));
        }
        let parents: Vec<i64> = {
            let sql = if ignore_merges {
                "SELECT pid FROM plink WHERE cid=?1 AND isprim"
            } else {
                "SELECT pid FROM plink WHERE cid=?1"
            };
            let mut stmt = repo.conn.prepare_cached(sql)?;
            let __rows = stmt.query_map(params![rid], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        for p in parents {
            if p <= 0 {
                continue;
            }
            let old = mask.get(&p).copied();
            let new = old.unwrap_or(0) | m;
            if old != Some(new) {
                mask.insert(p, new);
                pending.insert(p, node_mtime(repo, p)?);
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(repo: &Repository, pid: i64, cid: i64, mtime: f64, isprim: bool) {
        repo.conn
            .execute(
                "INSERT INTO plink(pid, cid, isprim, mtime) VALUES(?1, ?2, ?3, ?4)",
                params![pid, cid, isprim, mtime],
            )
            .unwrap();
        repo.conn
            .execute(
                "REPLACE INTO event(type, mtime, objid) VALUES('ci', ?1, ?2)",
                params![mtime, cid],
            )
            .unwrap();
    }

    /// Simple fork: 1 -> {2, 3}; pivot of 2 and 3 is 1.
    #[test]
    fn fork_pivot() {
        let repo = Repository::create_in_memory("t").unwrap();
        repo.conn
            .execute("REPLACE INTO event(type, mtime, objid) VALUES('ci', 1.0, 1)", [])
            .unwrap();
        link(&repo, 1, 2, 2.0, true);
        link(&repo, 1, 3, 3.0, true);
        assert_eq!(pivot_find(&repo, 2, &[3], false).unwrap(), Some(1));
    }

    /// The *nearest* ancestor wins over older common ancestors.
    #[test]
    fn nearest_wins() {
        let repo = Repository::create_in_memory("t").unwrap();
        // 1 -> 2 -> {3 -> 5, 4 -> 6}; pivot(5,6)=2
        link(&repo, 1, 2, 2.0, true);
        link(&repo, 2, 3, 3.0, true);
        link(&repo, 2, 4, 4.0, true);
        link(&repo, 3, 5, 5.0, true);
        link(&repo, 4, 6, 6.0, true);
        assert_eq!(pivot_find(&repo, 5, &[6], false).unwrap(), Some(2));
    }

    /// Merge edges count unless ignore_merges is set.
    #[test]
    fn merge_edges_respected() {
        let repo = Repository::create_in_memory("t").unwrap();
        // 1 -> 2 -> 4 (trunk), 1 -> 3 (branch), 4 merges 3.
        link(&repo, 1, 2, 2.0, true);
        link(&repo, 1, 3, 3.0, true);
        link(&repo, 2, 4, 4.0, true);
        link(&repo, 3, 4, 4.0, false);
        // With merges honored, 3 is an ancestor of 4, so pivot(4,3)=3.
        assert_eq!(pivot_find(&repo, 4, &[3], false).unwrap(), Some(3));
        // Ignoring merges the only common point is 1.
        assert_eq!(pivot_find(&repo, 4, &[3], true).unwrap(), Some(1));
    }

    /// Disconnected histories have no pivot.
    #[test]
    fn disjoint_histories() {
        let repo = Repository::create_in_memory("t").unwrap();
        link(&repo, 1, 2, 2.0, true);
        link(&repo, 7, 8, 3.0, true);
        assert_eq!(pivot_find(&repo, 2, &[8], false).unwrap(), None);
    }
}
