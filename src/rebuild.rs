//! Bulk operations over the whole artifact store: regenerate every derived
//! table from the artifacts alone, export the store as a directory tree,
//! rebuild a repository from such a tree, and the storage-efficiency pass
//! that converts full blobs into deltas after the fact.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use rusqlite::{params, OptionalExtension};
use tracing::{debug, info, warn};

use crate::crosslink;
use crate::errors::Result;
use crate::hash::{ArtifactHash, HashKind, HashPolicy};
use crate::manifest::md5_of_cards;
use crate::repo::{schema, Repository};
use crate::store;
use crate::tag;

/// Window of chronological neighbours considered by extra deltification.
const N_NEIGHBOR: usize = 5;

/// Walk every reconstructible artifact exactly once, depth-first through
/// the delta trees so each expansion applies one delta to an
/// already-materialized parent. The callback sees the full content.
///
/// Uses an explicit work stack: constant call-stack depth for chains of
/// any length.
fn artifact_walk(
    repo: &mut Repository,
    f: &mut dyn FnMut(&mut Repository, i64, Vec<u8>) -> Result<()>,
) -> Result<()> {
    let mut done: HashSet<i64> = HashSet::new();

    // Pass 1: roots of delta trees (full artifacts), expanding downward.
    let roots: Vec<(i64, i64)> = {
        let mut stmt = repo.conn.prepare(
            "SELECT rid, size FROM blob \
             WHERE NOT EXISTS(SELECT 1 FROM shun WHERE uuid=blob.uuid) \
               AND NOT EXISTS(SELECT 1 FROM delta WHERE rid=blob.rid)",
        )?;
        let __rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        __rows
    };
    for (rid, size) in roots {
        if size < 0 {
            continue;
        }
        let content = store::get(repo, rid)?;
        walk_tree(repo, rid, content, &mut done, f)?;
    }

    // Pass 2: anything left over (detached deltas, phantoms).
    let rest: Vec<(i64, i64)> = {
        let mut stmt = repo.conn.prepare(
            "SELECT rid, size FROM blob \
             WHERE NOT EXISTS(SELECT 1 FROM shun WHERE uuid=blob.uuid)",
        )?;
        let __rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        __rows
    };
    for (rid, size) in rest {
        if done.contains(&rid) {
            continue;
        }
        if size >= 0 {
            if let Some(content) = store::get_if_available(repo, rid)? {
                walk_tree(repo, rid, content, &mut done, f)?;
            }
        } else {
            repo.conn
                .execute("INSERT OR IGNORE INTO phantom VALUES(?1)", params![rid])?;
            done.insert(rid);
        }
    }
    Ok(())
}

fn walk_tree(
    repo: &mut Repository,
    rid: i64,
    content: Vec<u8>,
    done: &mut HashSet<i64>,
    f: &mut dyn FnMut(&mut Repository, i64, Vec<u8>) -> Result<()>,
) -> Result<()> {
    let mut stack: Vec<(i64, Vec<u8>)> = vec![(rid, content)];
    while let Some((rid, content)) = stack.pop() {
        if !done.insert(rid) {
            continue;
        }
        // Repair a stale size column while we have the bytes in hand.
        let recorded = store::size(repo, rid)?.unwrap_or(-1);
        if recorded != content.len() as i64 {
            repo.conn.execute(
                "UPDATE blob SET size=?1 WHERE rid=?2",
                params![content.len() as i64, rid],
            )?;
        }
        let children: Vec<i64> = {
            let mut stmt = repo
                .conn
                .prepare_cached("SELECT rid FROM delta WHERE srcid=?1")?;
            let __rows = stmt.query_map(params![rid], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        for cid in children {
            if done.contains(&cid) {
                continue;
            }
            let raw: Option<(Vec<u8>, i64)> = repo
                .conn
                .query_row(
                    "SELECT content, size FROM blob WHERE rid=?1",
                    params![cid],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((blob, size)) = raw {
                if size >= 0 {
                    let delta_bytes = store::decompress(&blob)?;
                    let child_content = crate::delta::apply(&content, &delta_bytes)?;
                    stack.push((cid, child_content));
                }
            }
        }
        f(repo, rid, content)?;
    }
    Ok(())
}

/// Regenerate all derived tables from the artifact store. Runs in one
/// transaction; any failure rolls the whole regeneration back.
pub fn rebuild(repo: &mut Repository, do_clustering: bool) -> Result<()> {
    info!("rebuilding derived tables");
    repo.clear_caches();
    repo.begin_transaction()?;
    let r = (|| -> Result<()> {
        for table in schema::DERIVED_TABLES {
            repo.conn
                .execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\""))?;
        }
        repo.conn.execute_batch(schema::SCHEMA)?;
        tag::seed_builtin_tags(repo)?;

        repo.conn.execute_batch(
            "INSERT INTO unclustered \
               SELECT rid FROM blob EXCEPT SELECT rid FROM private;",
        )?;
        repo.conn.execute_batch(
            "DELETE FROM unclustered \
              WHERE rid IN (SELECT rid FROM shun JOIN blob USING(uuid));",
        )?;

        crosslink::crosslink_begin(repo)?;
        let walked = artifact_walk(repo, &mut |repo, rid, content| {
            if crate::utils::looks_like_control_artifact(&content) {
                crosslink::crosslink(repo, rid, content)?;
            }
            Ok(())
        });
        match walked {
            Ok(()) => crosslink::crosslink_end(repo)?,
            Err(e) => {
                crosslink::crosslink_abort(repo)?;
                return Err(e);
            }
        }
        rebuild_tag_trunk(repo)?;
        if do_clustering {
            create_cluster(repo)?;
        }
        Ok(())
    })();
    repo.end_transaction(r.is_err())?;
    repo.clear_caches();
    r
}

/// Attach `sym-trunk` and `branch=trunk` to the root check-in when no
/// trunk tag exists, so freshly reconstructed repositories have a named
/// main line.
fn rebuild_tag_trunk(repo: &mut Repository) -> Result<()> {
    let have: Option<i64> = repo
        .conn
        .query_row(
            "SELECT 1 FROM tag WHERE tagname='sym-trunk'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if have.is_some() {
        return Ok(());
    }
    let root: Option<i64> = repo
        .conn
        .query_row(
            "SELECT pid FROM plink AS x WHERE pid>0 AND NOT EXISTS(\
               SELECT 1 FROM plink WHERE cid=x.pid) LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let Some(root) = root else { return Ok(()) };
    let mtime: f64 = repo
        .conn
        .query_row(
            "SELECT coalesce(mtime, 0) FROM event WHERE objid=?1",
            params![root],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0.0);
    tag::tag_insert(repo, "sym-trunk", 2, None, 0, mtime, root)?;
    tag::tag_insert(repo, "branch", 2, Some("trunk"), 0, mtime, root)?;
    Ok(())
}

/// Gather every unclustered public artifact into a new cluster artifact.
pub fn create_cluster(repo: &mut Repository) -> Result<Option<i64>> {
    let mut uuids: Vec<String> = {
        let mut stmt = repo.conn.prepare(
            "SELECT uuid FROM unclustered JOIN blob USING(rid) \
             WHERE NOT EXISTS(SELECT 1 FROM phantom WHERE rid=unclustered.rid) \
               AND NOT EXISTS(SELECT 1 FROM private WHERE rid=unclustered.rid) \
               AND NOT EXISTS(SELECT 1 FROM shun WHERE uuid=blob.uuid)",
        )?;
        let __rows = stmt.query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        __rows
    };
    if uuids.is_empty() {
        return Ok(None);
    }
    uuids.sort();
    let mut cards = String::new();
    for uuid in &uuids {
        cards.push_str(&format!("M {uuid}\n"));
    }
    let text = format!("{cards}Z {}\n", md5_of_cards(&cards));
    let rid = store::put(repo, text.as_bytes(), false)?;
    crosslink::crosslink(repo, rid, text.into_bytes())?;
    debug!(rid, members = uuids.len(), "created cluster");
    Ok(Some(rid))
}

/// Convert more full blobs into deltas for storage efficiency: check-in
/// manifests delta against their chronological neighbours, and file
/// artifacts against same-named versions in more recent check-ins.
/// Returns the number of new deltas made.
pub fn extra_deltification(repo: &mut Repository) -> Result<usize> {
    let mut n_delta = 0usize;
    repo.begin_transaction()?;
    let r = (|| -> Result<usize> {
        let checkins: Vec<i64> = {
            let mut stmt = repo.conn.prepare(
                "SELECT blob.rid FROM event, blob \
                 WHERE blob.rid=event.objid AND event.type='ci' \
                   AND NOT EXISTS(SELECT 1 FROM delta WHERE rid=blob.rid) \
                 ORDER BY event.mtime DESC",
            )?;
            let __rows = stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        let mut prev: Vec<i64> = Vec::with_capacity(N_NEIGHBOR);
        for rid in checkins {
            if !prev.is_empty() && store::deltify(repo, rid, &prev, false)? {
                n_delta += 1;
            }
            if prev.len() == N_NEIGHBOR {
                prev.remove(0);
            }
            prev.push(rid);
        }

        let files: Vec<(i64, i64)> = {
            let mut stmt = repo.conn.prepare(
                "SELECT DISTINCT blob.rid, mlink.fnid FROM blob, mlink, plink \
                 WHERE NOT EXISTS(SELECT 1 FROM delta WHERE rid=blob.rid) \
                   AND mlink.fid=blob.rid AND mlink.mid=plink.cid \
                 ORDER BY mlink.fnid, plink.mtime DESC",
            )?;
            let __rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        let mut prev_fnid = 0i64;
        prev.clear();
        for (rid, fnid) in files {
            if fnid != prev_fnid {
                prev.clear();
            }
            prev_fnid = fnid;
            if !prev.is_empty() && store::deltify(repo, rid, &prev, false)? {
                n_delta += 1;
            }
            if prev.len() == N_NEIGHBOR {
                prev.remove(0);
            }
            prev.push(rid);
        }
        Ok(n_delta)
    })();
    let ok = r.is_ok();
    repo.end_transaction(!ok)?;
    r
}

/// Explode the artifact store into a directory tree: each non-private,
/// non-phantom artifact is a file at `<dest>/<prefix>/<rest-of-hash>`.
/// The artifact with rid 1 is named in `.rid1`; private hashes optionally
/// land in `.private`.
pub fn deconstruct(
    repo: &mut Repository,
    dest: &Path,
    keep_rid1: bool,
    export_private: bool,
) -> Result<usize> {
    fs::create_dir_all(dest)?;
    let prefix = repo.config.deconstruct_prefix;
    let mut count = 0usize;
    artifact_walk(repo, &mut |repo, rid, content| {
        if store::is_private(repo, rid)? {
            return Ok(());
        }
        let uuid = repo.uuid_for_rid(rid)?;
        let (head, rest) = uuid.split_at(prefix.min(uuid.len()));
        let dir = dest.join(head);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(rest), &content)?;
        count += 1;
        if rid == 1 && keep_rid1 {
            fs::write(
                dest.join(".rid1"),
                format!("# The file holding the artifact with RID=1\n{head}/{rest}\n"),
            )?;
        }
        Ok(())
    })?;
    if export_private {
        let privates: Vec<String> = {
            let mut stmt = repo
                .conn
                .prepare("SELECT uuid FROM blob JOIN private USING(rid)")?;
            let __rows = stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        if !privates.is_empty() {
            let mut body = String::from("# Private artifacts\n");
            for uuid in privates {
                body.push_str(&uuid);
                body.push('\n');
            }
            fs::write(dest.join(".private"), body)?;
        }
    }
    info!(count, dest = %dest.display(), "deconstructed");
    Ok(count)
}

/// Reassemble the hash a deconstructed file stands for: the last path
/// component appended to its parent directory name must be hex of an
/// accepted length.
fn hash_from_path(path: &Path) -> Option<(String, HashKind)> {
    let name = path.file_name()?.to_str()?;
    let dir = path.parent()?.file_name()?.to_str()?;
    let uuid = format!("{dir}{name}");
    let kind = HashKind::from_hex_len(uuid.len())?;
    if !crate::hash::is_hex(&uuid) {
        return None;
    }
    Some((uuid.to_ascii_lowercase(), kind))
}

fn ingest_file(repo: &mut Repository, path: &Path) -> Result<bool> {
    let Some((uuid, kind)) = hash_from_path(path) else {
        return Ok(false);
    };
    let content = fs::read(path)?;
    if ArtifactHash::compute(kind, &content).to_hex() != uuid {
        warn!(path = %path.display(), "content does not match its filename hash");
        return Ok(false);
    }
    if repo.is_shunned(&uuid)? {
        return Ok(false);
    }
    // Let the observed flavour drive the policy so mixed trees keep their
    // identities.
    if kind == HashKind::Sha3 && repo.config.hash_policy != HashPolicy::Sha3 {
        repo.set_hash_policy(HashPolicy::Sha3)?;
    }
    store::put(repo, &content, false)?;
    Ok(true)
}

fn walk_dir(repo: &mut Repository, dir: &Path, count: &mut usize) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            walk_dir(repo, &path, count)?;
        } else if ingest_file(repo, &path)? {
            *count += 1;
        }
    }
    Ok(())
}

/// Rebuild an entire repository from a deconstructed directory tree.
/// `.rid1` names the artifact ingested first (so it claims rid 1);
/// `.private` re-marks private artifacts; then the derived tables are
/// regenerated.
pub fn reconstruct(repo: &mut Repository, src: &Path) -> Result<usize> {
    let mut count = 0usize;
    repo.dephantomize_disabled = true;
    let r = (|| -> Result<()> {
        let rid1 = src.join(".rid1");
        if rid1.is_file() {
            for line in fs::read_to_string(&rid1)?.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if ingest_file(repo, &src.join(line))? {
                    count += 1;
                }
                break;
            }
        }
        walk_dir(repo, src, &mut count)?;
        let private = src.join(".private");
        if private.is_file() {
            for line in fs::read_to_string(&private)?.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some(rid) = repo.rid_for_uuid(line)? {
                    store::mark_private(repo, rid)?;
                }
            }
        }
        Ok(())
    })();
    repo.dephantomize_disabled = false;
    r?;
    rebuild(repo, false)?;
    info!(count, "reconstructed");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::{add_file, commit, update_to};
    use tempfile::TempDir;

    fn setup() -> (Repository, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::create_in_memory("alice").unwrap();
        repo.set_local_root(dir.path());
        (repo, dir)
    }

    fn build_history(repo: &mut Repository, dir: &TempDir) -> Vec<i64> {
        fs::write(dir.path().join("a.txt"), "alpha v1\n").unwrap();
        fs::write(dir.path().join("b.txt"), "beta v1\n").unwrap();
        add_file(repo, "a.txt").unwrap();
        add_file(repo, "b.txt").unwrap();
        let v1 = commit(repo, "one").unwrap();
        fs::write(dir.path().join("a.txt"), "alpha v2\n").unwrap();
        let v2 = commit(repo, "two").unwrap();
        let b = crate::branch::branch_new(repo, "side", v1, None, false).unwrap();
        vec![v1, v2, b]
    }

    fn derived_snapshot(repo: &Repository) -> Vec<String> {
        let mut out = Vec::new();
        for (table, cols) in [
            ("mlink", "mid, pid, fid, fnid, pfnid"),
            ("plink", "pid, cid, isprim"),
            (
                "tagxref",
                "tagid, tagtype, value, rid",
            ),
            ("event", "type, objid, user, comment"),
        ] {
            let sql = format!("SELECT {cols} FROM {table} ORDER BY 1,2,3");
            let mut stmt = repo.conn.prepare(&sql).unwrap();
            let n = stmt.column_count();
            let rows = stmt
                .query_map([], |row| {
                    let mut parts = Vec::new();
                    for i in 0..n {
                        let v: rusqlite::types::Value = row.get(i).unwrap();
                        parts.push(format!("{v:?}"));
                    }
                    Ok(parts.join("|"))
                })
                .unwrap()
                .collect::<rusqlite::Result<Vec<_>>>()
                .unwrap();
            out.push(format!("{table}:{}", rows.join(";")));
        }
        out
    }

    /// Property 6: rebuild regenerates the same derived rows from any
    /// starting state.
    #[test]
    fn rebuild_determinism() {
        let (mut repo, dir) = setup();
        build_history(&mut repo, &dir);
        rebuild(&mut repo, false).unwrap();
        let first = derived_snapshot(&repo);
        // Wreck the derived tables, then rebuild from the damaged state.
        repo.conn.execute("DELETE FROM mlink", []).unwrap();
        repo.conn.execute("DELETE FROM plink", []).unwrap();
        repo.conn.execute("DELETE FROM event", []).unwrap();
        repo.conn.execute("DELETE FROM tagxref", []).unwrap();
        rebuild(&mut repo, false).unwrap();
        assert_eq!(derived_snapshot(&repo), first);
        // Idempotence: a third rebuild changes nothing either.
        rebuild(&mut repo, false).unwrap();
        assert_eq!(derived_snapshot(&repo), first);
    }

    /// Deconstruct then reconstruct reproduces every artifact and the
    /// derived state.
    #[test]
    fn deconstruct_reconstruct_round_trip() {
        let (mut repo, dir) = setup();
        build_history(&mut repo, &dir);
        let uuids: Vec<String> = {
            let mut stmt = repo
                .conn
                .prepare("SELECT uuid FROM blob ORDER BY rid")
                .unwrap();
            stmt.query_map([], |r| r.get(0))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap()
        };
        let rid1_uuid = uuids[0].clone();

        let export = TempDir::new().unwrap();
        let n = deconstruct(&mut repo, export.path(), true, true).unwrap();
        assert_eq!(n, uuids.len());
        assert!(export.path().join(".rid1").is_file());
        // Each artifact is a plain file under its two-character prefix.
        for uuid in &uuids {
            let (head, rest) = uuid.split_at(2);
            assert!(export.path().join(head).join(rest).is_file(), "{uuid}");
        }

        let mut repo2 = Repository::create_in_memory("alice").unwrap();
        let n2 = reconstruct(&mut repo2, export.path()).unwrap();
        assert_eq!(n2, uuids.len());
        // rid 1 is pinned to the same artifact.
        assert_eq!(repo2.uuid_for_rid(1).unwrap(), rid1_uuid);
        // Every artifact carries the same bytes.
        for uuid in &uuids {
            let rid_a = repo.rid_for_uuid(uuid).unwrap().unwrap();
            let rid_b = repo2.rid_for_uuid(uuid).unwrap().unwrap();
            assert_eq!(
                store::get(&mut repo, rid_a).unwrap(),
                store::get(&mut repo2, rid_b).unwrap()
            );
        }
        assert!(store::integrity_check(&mut repo2).unwrap().is_empty());
        // The derived graph regenerated: plink count matches.
        let plinks: i64 = repo
            .conn
            .query_row("SELECT count(*) FROM plink", [], |r| r.get(0))
            .unwrap();
        let plinks2: i64 = repo2
            .conn
            .query_row("SELECT count(*) FROM plink", [], |r| r.get(0))
            .unwrap();
        assert_eq!(plinks, plinks2);
    }

    /// Private artifacts stay out of the export tree but their hashes ride
    /// along in .private.
    #[test]
    fn deconstruct_private_artifacts() {
        let (mut repo, dir) = setup();
        build_history(&mut repo, &dir);
        let secret = store::put(&mut repo, b"private bytes\n", true).unwrap();
        let secret_uuid = repo.uuid_for_rid(secret).unwrap();

        let export = TempDir::new().unwrap();
        deconstruct(&mut repo, export.path(), false, true).unwrap();
        let (head, rest) = secret_uuid.split_at(2);
        assert!(!export.path().join(head).join(rest).exists());
        let listed = fs::read_to_string(export.path().join(".private")).unwrap();
        assert!(listed.contains(&secret_uuid));

        let mut repo2 = Repository::create_in_memory("alice").unwrap();
        reconstruct(&mut repo2, export.path()).unwrap();
        // The private artifact is absent (content never exported).
        assert_eq!(repo2.rid_for_uuid(&secret_uuid).unwrap(), None);
    }

    /// Scenario S3: many near-identical versions compress to a small
    /// fraction of their raw size and stay recoverable.
    #[test]
    fn delta_compression_ratio() {
        let (mut repo, dir) = setup();
        let base: String = "The quick brown fox jumps over the lazy dog. 0123456789abcdef\n"
            .repeat(160); // ~10 kB
        fs::write(dir.path().join("data.txt"), &base).unwrap();
        add_file(&mut repo, "data.txt").unwrap();
        commit(&mut repo, "v0").unwrap();
        let n_versions = 60;
        for i in 1..n_versions {
            let mut v = base.clone();
            v.push_str(&format!("rev {i:05}\n"));
            fs::write(dir.path().join("data.txt"), &v).unwrap();
            commit(&mut repo, &format!("v{i}")).unwrap();
        }
        extra_deltification(&mut repo).unwrap();

        let (stored, logical): (i64, i64) = repo
            .conn
            .query_row(
                "SELECT sum(length(content)), sum(size) FROM blob WHERE size>=0",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!(
            (stored as f64) < (logical as f64) * 0.05,
            "stored {stored} vs logical {logical}"
        );
        assert!(store::integrity_check(&mut repo).unwrap().is_empty());
    }

    /// A cluster built from the unclustered set empties it.
    #[test]
    fn clustering() {
        let (mut repo, dir) = setup();
        build_history(&mut repo, &dir);
        let before: i64 = repo
            .conn
            .query_row("SELECT count(*) FROM unclustered", [], |r| r.get(0))
            .unwrap();
        assert!(before > 0);
        let cluster_rid = create_cluster(&mut repo).unwrap().unwrap();
        let after: i64 = repo
            .conn
            .query_row(
                "SELECT count(*) FROM unclustered WHERE rid<>?1",
                params![cluster_rid],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(after, 0);
    }

    /// Orphaned delta manifests crosslink once their baseline arrives via
    /// rebuild.
    #[test]
    fn rebuild_handles_checkout_history() {
        let (mut repo, dir) = setup();
        let rids = build_history(&mut repo, &dir);
        update_to(&mut repo, rids[2]).unwrap();
        rebuild(&mut repo, true).unwrap();
        // The branch tag survived the rebuild.
        assert_eq!(
            tag::branch_of_rid(&repo, rids[2]).unwrap().as_deref(),
            Some("side")
        );
        assert!(store::integrity_check(&mut repo).unwrap().is_empty());
    }
}
