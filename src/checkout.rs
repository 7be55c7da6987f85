//! Working-copy state: the `vfile` table, checkout switching, edit
//! detection, and commit (manifest synthesis from the working copy).
//!
//! `vfile.chnged` codes: 0 unchanged, 1 edited, 2 merged, 3 merged-add,
//! 4 integrated, 5 integrated-add. `rid=0` marks an added-but-uncommitted
//! file.

use std::fs;
use std::path::PathBuf;

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::crosslink;
use crate::errors::{RepoError, Result};
use crate::manifest::{md5_of_cards, parse_artifact, ArtifactKind};
use crate::repo::Repository;
use crate::store;
use crate::utils::{format_card_date, fossilize};

/// One tracked path in the current checkout.
#[derive(Clone, Debug)]
pub struct VFile {
    pub id: i64,
    pub vid: i64,
    pub chnged: i64,
    pub deleted: bool,
    pub isexe: bool,
    pub islink: bool,
    pub rid: i64,
    pub mrid: i64,
    pub pathname: String,
    pub origname: Option<String>,
    pub mhash: Option<String>,
}

pub const CHNGED_NONE: i64 = 0;
pub const CHNGED_EDITED: i64 = 1;
pub const CHNGED_MERGED: i64 = 2;
pub const CHNGED_MERGED_ADD: i64 = 3;
pub const CHNGED_INTEGRATED: i64 = 4;
pub const CHNGED_INTEGRATED_ADD: i64 = 5;

/// The rid of the currently checked-out version, or 0.
pub fn current_checkout(repo: &Repository) -> Result<i64> {
    Ok(repo
        .conn
        .query_row(
            "SELECT value FROM vvar WHERE name='checkout'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .and_then(|z| z.parse().ok())
        .unwrap_or(0))
}

fn set_checkout_var(repo: &Repository, vid: i64) -> Result<()> {
    repo.conn.execute(
        "REPLACE INTO vvar(name, value) VALUES('checkout', ?1)",
        params![vid.to_string()],
    )?;
    let uuid = if vid > 0 {
        repo.uuid_for_rid(vid)?
    } else {
        String::new()
    };
    repo.conn.execute(
        "REPLACE INTO vvar(name, value) VALUES('checkout-hash', ?1)",
        params![uuid],
    )?;
    Ok(())
}

/// Read all vfile rows for one version.
pub fn vfile_rows(repo: &Repository, vid: i64) -> Result<Vec<VFile>> {
    let mut stmt = repo.conn.prepare_cached(
        "SELECT id, vid, chnged, deleted, isexe, islink, rid, mrid, pathname, origname, mhash \
         FROM vfile WHERE vid=?1 ORDER BY pathname",
    )?;
    let rows = stmt
        .query_map(params![vid], |row| {
            Ok(VFile {
                id: row.get(0)?,
                vid: row.get(1)?,
                chnged: row.get(2)?,
                deleted: row.get(3)?,
                isexe: row.get(4)?,
                islink: row.get(5)?,
                rid: row.get(6)?,
                mrid: row.get(7)?,
                pathname: row.get(8)?,
                origname: row.get(9)?,
                mhash: row.get(10)?,
            })
        })?
        .collect::<rusqlite::Result<_>>()?;
    Ok(rows)
}

/// Populate `vfile` with the file tree of manifest `vid` (no disk I/O).
/// Returns true if any file content is missing (phantom), which callers
/// treat as fatal unless force-missing is in effect.
pub fn load_vfile_from_rid(repo: &mut Repository, vid: i64) -> Result<bool> {
    let already: i64 = repo.conn.query_row(
        "SELECT count(*) FROM vfile WHERE vid=?1",
        params![vid],
        |row| row.get(0),
    )?;
    if already > 0 {
        return Ok(false);
    }
    let m = parse_artifact(repo, vid)?;
    if m.kind() != ArtifactKind::Manifest {
        return Err(RepoError::Checkout(format!("rid {vid} is not a check-in")));
    }
    let mut missing = false;
    let files = m.full_file_list(repo)?;
    for f in files {
        let uuid = f.uuid.as_deref().expect("full list has no deletions");
        let rid = store::uuid_to_rid(repo, uuid, true)?;
        if !store::is_available(repo, rid)? {
            missing = true;
        }
        repo.conn.execute(
            "INSERT INTO vfile(vid, chnged, deleted, isexe, islink, rid, mrid, mtime, pathname) \
             VALUES(?1, 0, 0, ?2, ?3, ?4, ?4, 0, ?5)",
            params![vid, f.is_exe(), f.is_link(), rid, f.name],
        )?;
    }
    Ok(missing)
}

/// Write one vfile row's content to the working directory.
pub fn vfile_to_disk(repo: &mut Repository, id: i64) -> Result<()> {
    let (rid, mrid, pathname, chnged): (i64, i64, String, i64) = repo.conn.query_row(
        "SELECT rid, mrid, pathname, chnged FROM vfile WHERE id=?1",
        params![id],
        |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
            ))
        },
    )?;
    let content_rid = if chnged >= CHNGED_MERGED && mrid > 0 {
        mrid
    } else if rid > 0 {
        rid
    } else {
        mrid
    };
    let content = store::get(repo, content_rid)?;
    let path = abs_path(repo, &pathname)?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(&path, &content)?;
    Ok(())
}

pub(crate) fn abs_path(repo: &Repository, rel: &str) -> Result<PathBuf> {
    Ok(repo.local_root()?.join(rel))
}

/// Compare working files against their stored baselines, upgrading
/// `chnged` from 0 to 1 where the bytes differ. Merge flags (2..5) are
/// preserved.
pub fn vfile_check_signature(repo: &mut Repository, vid: i64) -> Result<()> {
    let rows = vfile_rows(repo, vid)?;
    for row in rows {
        if row.deleted || row.rid == 0 || row.chnged != CHNGED_NONE {
            continue;
        }
        let path = abs_path(repo, &row.pathname)?;
        let changed = match fs::read(&path) {
            Ok(disk) => {
                let stored = store::get(repo, row.rid)?;
                disk != stored
            }
            Err(_) => true,
        };
        if changed {
            repo.conn.execute(
                "UPDATE vfile SET chnged=1 WHERE id=?1",
                params![row.id],
            )?;
        }
    }
    Ok(())
}

/// True if the checkout holds uncommitted work of any kind.
pub fn unsaved_changes(repo: &mut Repository) -> Result<bool> {
    let vid = current_checkout(repo)?;
    if vid == 0 {
        return Ok(false);
    }
    vfile_check_signature(repo, vid)?;
    let n: i64 = repo.conn.query_row(
        "SELECT count(*) FROM vfile WHERE vid=?1 AND (chnged OR deleted OR rid=0 \
           OR (origname IS NOT NULL AND origname<>pathname))",
        params![vid],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Throw away local modifications: restore file content from the baseline
/// and clear change flags. With `paths`, only those files revert.
pub fn revert(repo: &mut Repository, paths: Option<&[String]>) -> Result<()> {
    let vid = current_checkout(repo)?;
    let rows = vfile_rows(repo, vid)?;
    for row in rows {
        if let Some(filter) = paths {
            if !filter.iter().any(|p| p == &row.pathname) {
                continue;
            }
        }
        if row.rid == 0 {
            // Added but never committed: forget the row, keep the file.
            repo.conn
                .execute("DELETE FROM vfile WHERE id=?1", params![row.id])?;
            continue;
        }
        let orig = row.origname.clone().unwrap_or_else(|| row.pathname.clone());
        if orig != row.pathname {
            let new_path = abs_path(repo, &row.pathname)?;
            let _ = fs::remove_file(new_path);
        }
        repo.conn.execute(
            "UPDATE vfile SET chnged=0, deleted=0, mrid=rid, mhash=NULL, \
             pathname=coalesce(origname, pathname), origname=NULL WHERE id=?1",
            params![row.id],
        )?;
        let content = store::get(repo, row.rid)?;
        let path = abs_path(repo, &orig)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, content)?;
    }
    if paths.is_none() {
        repo.conn.execute("DELETE FROM vmerge", [])?;
    }
    Ok(())
}

/// Start tracking a new file (must already exist on disk).
pub fn add_file(repo: &mut Repository, pathname: &str) -> Result<()> {
    let vid = current_checkout(repo)?;
    let path = abs_path(repo, pathname)?;
    if !path.is_file() {
        return Err(RepoError::Checkout(format!("no such file: {pathname}")));
    }
    repo.conn.execute(
        "INSERT INTO vfile(vid, chnged, deleted, isexe, islink, rid, mrid, mtime, pathname) \
         VALUES(?1, 0, 0, 0, 0, 0, 0, 0, ?2)",
        params![vid, pathname],
    )?;
    Ok(())
}

/// Stop tracking a file and remove it from disk.
pub fn rm_file(repo: &mut Repository, pathname: &str) -> Result<()> {
    let vid = current_checkout(repo)?;
    let n = repo.conn.execute(
        "UPDATE vfile SET deleted=1 WHERE vid=?1 AND pathname=?2",
        params![vid, pathname],
    )?;
    if n == 0 {
        return Err(RepoError::Checkout(format!("not tracked: {pathname}")));
    }
    let _ = fs::remove_file(abs_path(repo, pathname)?);
    Ok(())
}

/// Rename a tracked file, moving it on disk.
pub fn mv_file(repo: &mut Repository, from: &str, to: &str) -> Result<()> {
    let vid = current_checkout(repo)?;
    let n = repo.conn.execute(
        "UPDATE vfile SET pathname=?3, origname=coalesce(origname, ?2) \
         WHERE vid=?1 AND pathname=?2",
        params![vid, from, to],
    )?;
    if n == 0 {
        return Err(RepoError::Checkout(format!("not tracked: {from}")));
    }
    let src = abs_path(repo, from)?;
    let dst = abs_path(repo, to)?;
    if let Some(dir) = dst.parent() {
        fs::create_dir_all(dir)?;
    }
    if src.is_file() {
        fs::rename(src, dst)?;
    }
    Ok(())
}

/// Switch the working copy to check-in `vid`, rewriting every file.
/// Refuses if there are unsaved changes.
pub fn update_to(repo: &mut Repository, vid: i64) -> Result<()> {
    if unsaved_changes(repo)? {
        return Err(RepoError::Checkout(
            "there are unsaved changes in the current checkout".into(),
        ));
    }
    let old_vid = current_checkout(repo)?;
    repo.begin_transaction()?;
    let r = (|| -> Result<()> {
        // Remove files tracked by the old version that the new one lacks.
        if old_vid > 0 && old_vid != vid {
            for row in vfile_rows(repo, old_vid)? {
                let keep: i64 = repo.conn.query_row(
                    "SELECT count(*) FROM vfile WHERE vid=?1 AND pathname=?2",
                    params![vid, row.pathname],
                    |x| x.get(0),
                )?;
                if keep == 0 {
                    let _ = fs::remove_file(abs_path(repo, &row.pathname)?);
                }
            }
        }
        repo.conn
            .execute("DELETE FROM vfile WHERE vid<>?1", params![vid])?;
        if load_vfile_from_rid(repo, vid)? {
            return Err(RepoError::MissingContent(vid));
        }
        let ids: Vec<i64> = {
            let mut stmt = repo
                .conn
                .prepare_cached("SELECT id FROM vfile WHERE vid=?1")?;
            let __rows = stmt.query_map(params![vid], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        for id in ids {
            vfile_to_disk(repo, id)?;
        }
        set_checkout_var(repo, vid)?;
        Ok(())
    })();
    repo.end_transaction(r.is_err())?;
    r
}

/// Open a fresh checkout of `vid` into the attached working directory
/// without requiring a prior checkout state.
pub fn open_checkout(repo: &mut Repository, vid: i64) -> Result<()> {
    repo.conn.execute("DELETE FROM vfile", [])?;
    repo.conn.execute("DELETE FROM vmerge", [])?;
    if load_vfile_from_rid(repo, vid)? {
        return Err(RepoError::MissingContent(vid));
    }
    let ids: Vec<i64> = {
        let mut stmt = repo
            .conn
            .prepare_cached("SELECT id FROM vfile WHERE vid=?1")?;
        let __rows = stmt.query_map(params![vid], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        __rows
    };
    for id in ids {
        vfile_to_disk(repo, id)?;
    }
    set_checkout_var(repo, vid)?;
    Ok(())
}

/// MD5 over names and contents of the full file set, the R card value.
fn repo_checksum(files: &[(String, Vec<u8>)]) -> String {
    let mut md5 = md5::Context::new();
    for (name, content) in files {
        md5.consume(name.as_bytes());
        md5.consume(b" ");
        md5.consume(content.len().to_string().as_bytes());
        md5.consume(b"\n");
        md5.consume(content);
    }
    format!("{:x}", md5.compute())
}

/// Commit the working copy: store changed file contents, synthesize the
/// manifest (F/P/Q/R cards), crosslink it, and advance the checkout.
/// Returns the new check-in's rid.
pub fn commit(repo: &mut Repository, comment: &str) -> Result<i64> {
    let vid = current_checkout(repo)?;
    if vid == 0 && !has_any_vfile(repo)? {
        return Err(RepoError::Checkout("nothing to commit".into()));
    }
    if vid > 0 {
        vfile_check_signature(repo, vid)?;
    }
    repo.begin_transaction()?;
    let r = commit_inner(repo, vid, comment);
    repo.end_transaction(r.is_err())?;
    r
}

fn has_any_vfile(repo: &Repository) -> Result<bool> {
    let n: i64 = repo
        .conn
        .query_row("SELECT count(*) FROM vfile", [], |row| row.get(0))?;
    Ok(n > 0)
}

fn commit_inner(repo: &mut Repository, vid: i64, comment: &str) -> Result<i64> {
    let is_private = vid > 0 && store::is_private(repo, vid)?;
    let rows = vfile_rows(repo, vid)?;
    let mut files: Vec<(VFile, String, Vec<u8>)> = Vec::new();
    for row in rows {
        if row.deleted {
            continue;
        }
        let path = abs_path(repo, &row.pathname)?;
        let content = fs::read(&path)
            .map_err(|_| RepoError::Checkout(format!("missing file: {}", row.pathname)))?;
        let uuid = if row.chnged != CHNGED_NONE || row.rid == 0 {
            let rid = store::put(repo, &content, is_private)?;
            repo.uuid_for_rid(rid)?
        } else {
            repo.uuid_for_rid(row.rid)?
        };
        files.push((row, uuid, content));
    }
    files.sort_by(|a, b| a.0.pathname.cmp(&b.0.pathname));

    let merges: Vec<(i64, String)> = {
        let mut stmt = repo
            .conn
            .prepare_cached("SELECT id, mhash FROM vmerge ORDER BY id DESC")?;
        let __rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        __rows
    };

    let mut cards = String::new();
    cards.push_str(&format!("C {}\n", fossilize(comment)));
    cards.push_str(&format!(
        "D {}\n",
        format_card_date(chrono::Utc::now())
    ));
    for (row, uuid, _) in &files {
        let perm = if row.islink {
            " l"
        } else if row.isexe {
            " x"
        } else {
            ""
        };
        match (&row.origname, perm) {
            (Some(orig), _) if orig != &row.pathname => {
                let p = if perm.is_empty() { " w" } else { perm };
                cards.push_str(&format!(
                    "F {} {}{} {}\n",
                    fossilize(&row.pathname),
                    uuid,
                    p,
                    fossilize(orig)
                ));
            }
            _ => {
                cards.push_str(&format!("F {} {}{}\n", fossilize(&row.pathname), uuid, perm));
            }
        }
    }
    if vid > 0 {
        let mut parents = vec![repo.uuid_for_rid(vid)?];
        for (id, mhash) in &merges {
            if *id == 0 || *id == -4 {
                parents.push(mhash.clone());
            }
        }
        cards.push_str(&format!("P {}\n", parents.join(" ")));
        for (id, mhash) in &merges {
            match id {
                -1 => cards.push_str(&format!("Q +{mhash}\n")),
                -2 => cards.push_str(&format!("Q -{mhash}\n")),
                _ => {}
            }
        }
    }
    let named: Vec<(String, Vec<u8>)> = files
        .iter()
        .map(|(row, _, content)| (row.pathname.clone(), content.clone()))
        .collect();
    cards.push_str(&format!("R {}\n", repo_checksum(&named)));
    if vid == 0 {
        // The root of the whole tree starts the trunk.
        cards.push_str("T *branch * trunk\nT *sym-trunk *\n");
    }
    cards.push_str(&format!("U {}\n", fossilize(&repo.user)));
    let manifest_text = format!("{cards}Z {}\n", md5_of_cards(&cards));

    let new_vid = store::put(repo, manifest_text.as_bytes(), is_private)?;
    crosslink::crosslink_begin(repo)?;
    match crosslink::crosslink(repo, new_vid, manifest_text.clone().into_bytes()) {
        Ok(true) => crosslink::crosslink_end(repo)?,
        Ok(false) => {
            crosslink::crosslink_abort(repo)?;
            return Err(RepoError::Integrity(
                "generated manifest failed to crosslink".into(),
            ));
        }
        Err(e) => {
            crosslink::crosslink_abort(repo)?;
            return Err(e);
        }
    }

    // An integrate-merge closes the merged leaf at commit time.
    for (id, mhash) in &merges {
        if *id == -4 {
            close_leaf(repo, mhash)?;
        }
    }

    // Advance the checkout: rewrite vfile against the new version.
    repo.conn
        .execute("DELETE FROM vfile WHERE deleted", [])?;
    for (row, uuid, _) in &files {
        let rid = store::uuid_to_rid(repo, uuid, false)?;
        repo.conn.execute(
            "UPDATE vfile SET vid=?1, rid=?2, mrid=?2, chnged=0, origname=NULL, mhash=NULL \
             WHERE id=?3",
            params![new_vid, rid, row.id],
        )?;
    }
    repo.conn.execute("DELETE FROM vmerge", [])?;
    set_checkout_var(repo, new_vid)?;
    if vid > 0 {
        store::deltify(repo, vid, &[new_vid], false)?;
    }
    debug!(new_vid, "committed");
    Ok(new_vid)
}

/// Apply a `+closed` tag to the check-in named by `mhash` via a control
/// artifact.
fn close_leaf(repo: &mut Repository, mhash: &str) -> Result<()> {
    let cards = format!(
        "D {}\nT +closed {mhash}\nU {}\n",
        format_card_date(chrono::Utc::now()),
        fossilize(&repo.user)
    );
    let text = format!("{cards}Z {}\n", md5_of_cards(&cards));
    let rid = store::put(repo, text.as_bytes(), false)?;
    crosslink::crosslink(repo, rid, text.into_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo_with_workdir() -> (Repository, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::create_in_memory("alice").unwrap();
        repo.set_local_root(dir.path());
        (repo, dir)
    }

    fn write_file(dir: &TempDir, name: &str, content: &str) {
        let path = dir.path().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Commit an added file, then an edit; vfile and events track both.
    #[test]
    fn commit_add_then_edit() {
        let (mut repo, dir) = repo_with_workdir();
        write_file(&dir, "README.md", "hello\n");
        add_file(&mut repo, "README.md").unwrap();
        let v1 = commit(&mut repo, "initial commit").unwrap();
        assert!(v1 > 0);
        assert_eq!(current_checkout(&repo).unwrap(), v1);
        let m = parse_artifact(&mut repo, v1).unwrap();
        assert_eq!(m.kind(), ArtifactKind::Manifest);
        assert_eq!(m.files.len(), 1);
        assert!(m.repo_cksum.is_some());

        write_file(&dir, "README.md", "hello world\n");
        let v2 = commit(&mut repo, "edit").unwrap();
        let m2 = parse_artifact(&mut repo, v2).unwrap();
        assert_eq!(m2.parents, vec![repo.uuid_for_rid(v1).unwrap()]);
        // The old manifest deltifies against the new one.
        let n: i64 = repo
            .conn
            .query_row("SELECT count(*) FROM plink WHERE pid=?1 AND cid=?2",
                params![v1, v2], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    /// Rename: the F card carries the prior name and mlink links the two
    /// filenames.
    #[test]
    fn commit_rename() {
        let (mut repo, dir) = repo_with_workdir();
        write_file(&dir, "a.txt", "content\n");
        add_file(&mut repo, "a.txt").unwrap();
        let _v1 = commit(&mut repo, "add").unwrap();
        mv_file(&mut repo, "a.txt", "b.txt").unwrap();
        let v2 = commit(&mut repo, "rename").unwrap();
        let m2 = parse_artifact(&mut repo, v2).unwrap();
        assert_eq!(m2.files[0].name, "b.txt");
        assert_eq!(m2.files[0].prior.as_deref(), Some("a.txt"));
        assert!(dir.path().join("b.txt").is_file());
        assert!(!dir.path().join("a.txt").exists());
    }

    /// Deleting a file drops it from the next manifest.
    #[test]
    fn commit_delete() {
        let (mut repo, dir) = repo_with_workdir();
        write_file(&dir, "x.c", "int x;\n");
        write_file(&dir, "y.c", "int y;\n");
        add_file(&mut repo, "x.c").unwrap();
        add_file(&mut repo, "y.c").unwrap();
        let _v1 = commit(&mut repo, "add both").unwrap();
        rm_file(&mut repo, "y.c").unwrap();
        let v2 = commit(&mut repo, "drop y").unwrap();
        let m2 = parse_artifact(&mut repo, v2).unwrap();
        assert_eq!(m2.files.len(), 1);
        assert_eq!(m2.files[0].name, "x.c");
        assert!(!dir.path().join("y.c").exists());
    }

    /// update_to rewrites the tree to an older version and back.
    #[test]
    fn update_switches_versions() {
        let (mut repo, dir) = repo_with_workdir();
        write_file(&dir, "f.txt", "v1\n");
        add_file(&mut repo, "f.txt").unwrap();
        let v1 = commit(&mut repo, "one").unwrap();
        write_file(&dir, "f.txt", "v2\n");
        write_file(&dir, "g.txt", "new\n");
        add_file(&mut repo, "g.txt").unwrap();
        let v2 = commit(&mut repo, "two").unwrap();

        update_to(&mut repo, v1).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("f.txt")).unwrap(), "v1\n");
        assert!(!dir.path().join("g.txt").exists());

        update_to(&mut repo, v2).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("f.txt")).unwrap(), "v2\n");
        assert!(dir.path().join("g.txt").is_file());
    }

    /// revert restores baseline content and forgets adds.
    #[test]
    fn revert_restores_baseline() {
        let (mut repo, dir) = repo_with_workdir();
        write_file(&dir, "f.txt", "committed\n");
        add_file(&mut repo, "f.txt").unwrap();
        commit(&mut repo, "base").unwrap();
        write_file(&dir, "f.txt", "scribbled\n");
        write_file(&dir, "new.txt", "untracked add\n");
        add_file(&mut repo, "new.txt").unwrap();
        assert!(unsaved_changes(&mut repo).unwrap());
        revert(&mut repo, None).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "committed\n"
        );
        assert!(!unsaved_changes(&mut repo).unwrap());
    }
}
