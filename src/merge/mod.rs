//! The merge engine: compute the per-file plan for merging one check-in
//! into the current checkout, then execute rename/edit/delete/add actions
//! against the working copy.
//!
//! Notation follows the classic three-way model:
//!
//! - `V` — the current checkout
//! - `M` — the version being merged in
//! - `P` — the pivot, the nearest common ancestor of V and M
//! - `N` — the name pivot, used only for rename detection

pub mod merge3;
pub mod pivot;

use std::collections::HashMap;
use std::fs;

use rusqlite::{params, OptionalExtension};
use tracing::warn;

use crate::checkout::{self, abs_path, CHNGED_MERGED, CHNGED_MERGED_ADD};
use crate::errors::{RepoError, Result};
use crate::repo::Repository;
use crate::store;
use crate::tag;
use crate::utils::looks_like_binary;

/// Caller-selected merge behavior.
#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    /// Pull in only the changes of M itself (pivot = M's primary parent).
    pub cherrypick: bool,
    /// Remove the changes of M (cherrypick in reverse).
    pub backout: bool,
    /// Close M's leaf at the next commit.
    pub integrate: bool,
    /// Plan and report, then roll everything back.
    pub dry_run: bool,
    /// Proceed even when the merge is a no-op or the leaf is closed.
    pub force: bool,
    /// Proceed creating phantoms when content is missing.
    pub force_missing: bool,
    /// Explicit pivot instead of the computed common ancestor.
    pub pivot: Option<i64>,
}

/// What the merge did: conflicts are non-fatal and counted, warnings are
/// accumulated for the caller's diagnostic channel.
#[derive(Debug, Default)]
pub struct MergeStats {
    pub conflicts: u32,
    pub overwrites: u32,
    pub warnings: Vec<String>,
}

/// One row of the merge working set: a unique path across {V, P, M} after
/// rename canonicalization, with per-side ids and names.
#[derive(Clone, Debug, Default)]
struct FvRow {
    /// Filename in V (and the canonical key once the plan is built).
    fn_v: Option<String>,
    /// Filename in the pivot.
    fn_p: Option<String>,
    /// Filename in M.
    fn_m: Option<String>,
    /// Filename in the name pivot.
    fn_n: Option<String>,
    idv: i64,
    idp: i64,
    idm: i64,
    ridv: i64,
    ridp: i64,
    ridm: i64,
    chnged: i64,
    isexe: bool,
    islinkv: bool,
    islinkm: bool,
}

/// Record a merge intent row; duplicates are ignored.
pub(crate) fn vmerge_insert(repo: &Repository, id: i64, rid: i64) -> Result<()> {
    repo.conn.execute(
        "INSERT OR IGNORE INTO vmerge(id, merge, mhash) \
         VALUES(?1, ?2, (SELECT uuid FROM blob WHERE rid=?3))",
        params![id, rid, rid],
    )?;
    Ok(())
}

fn is_a_leaf(repo: &Repository, rid: i64) -> Result<bool> {
    Ok(repo
        .conn
        .query_row(
            "SELECT 1 FROM plink WHERE pid=?1 AND isprim LIMIT 1",
            params![rid],
            |_| Ok(()),
        )
        .optional()?
        .is_none())
}

/// The primary-parent path from descendant `from` up to ancestor `to`,
/// newest first, both endpoints included. None when `to` is not reached.
fn primary_path(repo: &Repository, from: i64, to: i64) -> Result<Option<Vec<i64>>> {
    let mut path = vec![from];
    let mut cur = from;
    while cur != to {
        let parent: Option<i64> = repo
            .conn
            .query_row(
                "SELECT pid FROM plink WHERE cid=?1 AND isprim",
                params![cur],
                |row| row.get(0),
            )
            .optional()?;
        match parent {
            Some(p) if p > 0 => {
                path.push(p);
                cur = p;
            }
            _ => return Ok(None),
        }
    }
    Ok(Some(path))
}

fn filename_of(repo: &Repository, fnid: i64) -> Result<String> {
    Ok(repo.conn.query_row(
        "SELECT name FROM filename WHERE fnid=?1",
        params![fnid],
        |row| row.get(0),
    )?)
}

/// Compute the set of file renames between check-in `nid` (ancestor) and
/// `target`, walking `mlink.pfnid` links along the primary-parent path.
/// Returns (name-in-nid, name-in-target) pairs. With `rev_ok` the reverse
/// direction (target is the ancestor) is also tried, inverted.
fn find_filename_changes(
    repo: &Repository,
    nid: i64,
    target: i64,
    rev_ok: bool,
) -> Result<Vec<(String, String)>> {
    let (path, invert) = match primary_path(repo, target, nid)? {
        Some(p) => (p, false),
        None if rev_ok => match primary_path(repo, nid, target)? {
            Some(p) => (p, true),
            None => return Ok(Vec::new()),
        },
        None => return Ok(Vec::new()),
    };
    // Walk oldest-first; each step's mlink rows rename pfnid -> fnid.
    let mut map: HashMap<i64, i64> = HashMap::new(); // ancestor fnid -> current fnid
    for &step in path.iter().rev().skip(1) {
        let renames: Vec<(i64, i64)> = {
            let mut stmt = repo
                .conn
                .prepare_cached("SELECT pfnid, fnid FROM mlink WHERE mid=?1 AND pfnid>0")?;
            let __rows = stmt.query_map(params![step], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        for (pfnid, fnid) in renames {
            let origin = map
                .iter()
                .find(|(_, v)| **v == pfnid)
                .map(|(k, _)| *k)
                .unwrap_or(pfnid);
            map.insert(origin, fnid);
        }
    }
    let mut out = Vec::new();
    for (anc, cur) in map {
        if anc == cur {
            continue;
        }
        let a = filename_of(repo, anc)?;
        let c = filename_of(repo, cur)?;
        if invert {
            out.push((c, a));
        } else {
            out.push((a, c));
        }
    }
    Ok(out)
}

/// Which fv column an add_renames pass fills in.
#[derive(Clone, Copy, PartialEq)]
enum NameCol {
    V,
    P,
    M,
}

fn col_set(row: &mut FvRow, col: NameCol, value: String) {
    match col {
        NameCol::V => row.fn_v = Some(value),
        NameCol::P => row.fn_p = Some(value),
        NameCol::M => row.fn_m = Some(value),
    }
}

/// Seed fv rows with the renames from the name pivot to one version.
fn add_renames(
    repo: &Repository,
    fv: &mut Vec<FvRow>,
    col: NameCol,
    vid: i64,
    nid: i64,
    rev_ok: bool,
) -> Result<()> {
    for (name_n, name_v) in find_filename_changes(repo, nid, vid, rev_ok)? {
        if let Some(row) = fv.iter_mut().find(|r| r.fn_n.as_deref() == Some(&name_n)) {
            col_set(row, col, name_v);
        } else {
            let mut row = FvRow {
                fn_n: Some(name_n),
                ..Default::default()
            };
            col_set(&mut row, col, name_v);
            fv.push(row);
        }
    }
    Ok(())
}

/// A vfile row as seen by the plan builder.
struct VRow {
    id: i64,
    rid: i64,
    chnged: i64,
    isexe: bool,
    islink: bool,
    pathname: String,
    origname: Option<String>,
}

fn vrows(repo: &Repository, vid: i64) -> Result<Vec<VRow>> {
    let mut stmt = repo.conn.prepare_cached(
        "SELECT id, rid, chnged, isexe, islink, pathname, origname \
         FROM vfile WHERE vid=?1 ORDER BY pathname",
    )?;
    let rows = stmt
        .query_map(params![vid], |row| {
            Ok(VRow {
                id: row.get(0)?,
                rid: row.get(1)?,
                chnged: row.get(2)?,
                isexe: row.get(3)?,
                islink: row.get(4)?,
                pathname: row.get(5)?,
                origname: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<_>>()?;
    Ok(rows)
}

/// Merge check-in `mid` into the current checkout.
pub fn merge(repo: &mut Repository, mid: i64, opts: &MergeOptions) -> Result<MergeStats> {
    let vid = checkout::current_checkout(repo)?;
    if vid == 0 {
        return Err(RepoError::Checkout("nothing is checked out".into()));
    }
    if !opts.force && tag::leaf_is_closed(repo, vid)? {
        return Err(RepoError::Checkout(
            "cannot merge into a closed leaf".into(),
        ));
    }
    let mut mid = mid;
    let mut integrate = opts.integrate;

    // Resolve the content pivot P and the name pivot N.
    let mut pid;
    let mut nid = 0i64;
    if opts.cherrypick || opts.backout {
        pid = repo
            .conn
            .query_row(
                "SELECT pid FROM plink WHERE cid=?1 AND isprim",
                params![mid],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        if pid <= 0 {
            return Err(RepoError::Checkout(format!(
                "cannot find an ancestor for rid {mid}"
            )));
        }
    } else if let Some(p) = opts.pivot {
        pid = p;
    } else {
        let mut secondaries = vec![vid];
        let merges: Vec<i64> = {
            let mut stmt = repo
                .conn
                .prepare_cached("SELECT merge FROM vmerge WHERE id=0")?;
            let __rows = stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        secondaries.extend(merges);
        pid = pivot::pivot_find(repo, mid, &secondaries, false)?.ok_or_else(|| {
            RepoError::Checkout(
                "cannot find a common ancestor between the current checkout and the merge target"
                    .into(),
            )
        })?;
    }
    if !opts.cherrypick && !opts.backout {
        nid = pivot::pivot_find(repo, mid, &[vid], true)?.unwrap_or(0);
        if nid != 0 && nid != pid {
            nid = pivot::pivot_find(repo, nid, &[pid], true)?.unwrap_or(nid);
        }
    }
    if opts.backout {
        std::mem::swap(&mut pid, &mut mid);
    }
    if nid == 0 {
        nid = pid;
    }
    if !opts.force && mid == pid {
        return Ok(MergeStats {
            warnings: vec!["merge skipped because it is a no-op".into()],
            ..Default::default()
        });
    }
    if integrate && !is_a_leaf(repo, mid)? {
        warn!(mid, "ignoring --integrate: not a leaf");
        integrate = false;
    }
    if integrate && store::is_private(repo, mid)? {
        warn!(mid, "ignoring --integrate: private branch");
        integrate = false;
    }

    checkout::vfile_check_signature(repo, vid)?;
    repo.begin_transaction()?;
    let result = merge_inner(repo, vid, pid, nid, mid, integrate, opts);
    let rollback = result.is_err() || opts.dry_run;
    repo.end_transaction(rollback)?;
    result
}

fn merge_inner(
    repo: &mut Repository,
    vid: i64,
    pid: i64,
    nid: i64,
    mid: i64,
    integrate: bool,
    opts: &MergeOptions,
) -> Result<MergeStats> {
    let mut stats = MergeStats::default();
    if checkout::load_vfile_from_rid(repo, mid)? && !opts.force_missing {
        return Err(RepoError::MissingContent(mid));
    }
    if checkout::load_vfile_from_rid(repo, pid)? && !opts.force_missing {
        return Err(RepoError::MissingContent(pid));
    }

    // When an explicit pivot is used, P may not be an ancestor of V; the
    // fill-in of missing V names then goes through the name pivot.
    let v_ancestor_is_p = if opts.pivot.is_some() {
        let mut anc = vid;
        let mut found = false;
        while let Some(p) = repo
            .conn
            .query_row(
                "SELECT pid FROM plink WHERE cid=?1 AND isprim",
                params![anc],
                |row| row.get(0),
            )
            .optional()?
            .filter(|p: &i64| *p > 0)
        {
            if p == pid {
                found = true;
                break;
            }
            anc = p;
        }
        found
    } else {
        true
    };

    // ------------------------------------------------------------- plan: fv
    let mut fv: Vec<FvRow> = Vec::new();
    add_renames(repo, &mut fv, NameCol::V, vid, nid, false)?;
    add_renames(repo, &mut fv, NameCol::P, pid, nid, false)?;
    add_renames(repo, &mut fv, NameCol::M, mid, nid, opts.backout)?;

    let p_rows = vrows(repo, pid)?;
    let v_rows = vrows(repo, vid)?;
    let m_rows = vrows(repo, mid)?;

    if nid != pid {
        // A name change between N and one of the check-ins may not apply
        // to all of them; fill the gaps through the rename graph.
        for row in fv.iter_mut() {
            if row.fn_p.is_none() {
                if let Some(n) = &row.fn_n {
                    if p_rows.iter().any(|r| &r.pathname == n) {
                        row.fn_p = Some(n.clone());
                    }
                }
            }
        }
        for row in fv.iter_mut() {
            if row.fn_v.is_none() {
                let probe = row.fn_p.clone().or_else(|| row.fn_n.clone());
                if let Some(n) = probe {
                    if v_rows.iter().any(|r| r.pathname == n) {
                        row.fn_v = Some(n);
                    }
                }
            }
        }
        for row in fv.iter_mut() {
            if row.fn_m.is_none() {
                let probe = row.fn_p.clone().or_else(|| row.fn_n.clone());
                if let Some(n) = probe {
                    if m_rows.iter().any(|r| r.pathname == n) {
                        row.fn_m = Some(n);
                    }
                }
            }
        }
        for row in fv.iter_mut() {
            if row.fn_p.is_none() {
                let candidates = [row.fn_m.clone(), row.fn_v.clone()];
                for c in candidates.into_iter().flatten() {
                    if p_rows.iter().any(|r| r.pathname == c) {
                        row.fn_p = Some(c);
                        break;
                    }
                }
            }
        }
        for row in fv.iter_mut() {
            if row.fn_v.is_none() {
                if let Some(m) = row.fn_m.clone() {
                    if v_rows.iter().any(|r| r.pathname == m) {
                        row.fn_v = Some(m);
                    }
                }
            }
        }
        for row in fv.iter_mut() {
            if row.fn_m.is_none() {
                if let Some(v) = row.fn_v.clone() {
                    if m_rows.iter().any(|r| r.pathname == v) {
                        row.fn_m = Some(v);
                    }
                }
            }
        }
    }

    // Add files found in V, keyed by their current pathname.
    for row in fv.iter_mut() {
        if row.fn_v.is_none() {
            row.fn_v = if v_ancestor_is_p {
                row.fn_p.clone().or_else(|| row.fn_n.clone())
            } else {
                row.fn_n.clone()
            };
        }
    }
    for v in &v_rows {
        let join_name = v.origname.clone().unwrap_or_else(|| v.pathname.clone());
        let joinable = v.rid > 0 && v.chnged != 3 && v.chnged != 5;
        let idx = if joinable {
            fv.iter()
                .position(|r| r.fn_v.as_deref() == Some(join_name.as_str()))
        } else {
            None
        };
        match idx {
            Some(mut i) => {
                // Drop any placeholder row already keyed by the new name.
                if fv[i].fn_v.as_deref() != Some(v.pathname.as_str()) {
                    if let Some(dup) = fv
                        .iter()
                        .position(|r| r.fn_v.as_deref() == Some(v.pathname.as_str()))
                    {
                        if dup != i {
                            fv.remove(dup);
                            if dup < i {
                                i -= 1;
                            }
                        }
                    }
                }
                let row = &mut fv[i];
                row.fn_v = Some(v.pathname.clone());
                row.idv = v.id;
                row.ridv = v.rid;
                row.islinkv = v.islink;
                row.isexe = v.isexe;
                row.chnged = v.chnged;
            }
            None => {
                fv.push(FvRow {
                    fn_v: Some(v.pathname.clone()),
                    idv: v.id,
                    ridv: v.rid,
                    islinkv: v.islink,
                    isexe: v.isexe,
                    chnged: v.chnged,
                    ..Default::default()
                });
            }
        }
    }

    // Add files found in P.
    for row in fv.iter_mut() {
        if row.fn_p.is_none() {
            row.fn_p = row.fn_n.clone().or_else(|| {
                v_rows
                    .iter()
                    .find(|r| r.id == row.idv)
                    .map(|r| r.origname.clone().unwrap_or_else(|| r.pathname.clone()))
            });
        }
    }
    for p in &p_rows {
        let name = p.origname.clone().unwrap_or_else(|| p.pathname.clone());
        if !fv.iter().any(|r| r.fn_p.as_deref() == Some(name.as_str())) {
            fv.push(FvRow {
                fn_p: Some(name),
                ..Default::default()
            });
        }
    }

    // Add files found in M.
    for row in fv.iter_mut() {
        if row.fn_m.is_none() {
            row.fn_m = row.fn_p.clone();
        }
    }
    for m in &m_rows {
        if !fv
            .iter()
            .any(|r| r.fn_m.as_deref() == Some(m.pathname.as_str()))
        {
            fv.push(FvRow {
                fn_m: Some(m.pathname.clone()),
                ..Default::default()
            });
        }
    }

    // Compute ids for P and M sides.
    if pid == vid {
        for row in fv.iter_mut() {
            if row.ridv > 0 && row.chnged != 3 && row.chnged != 5 {
                row.idp = row.idv;
                row.ridp = row.ridv;
            }
        }
    } else {
        for row in fv.iter_mut() {
            if let Some(fnp) = &row.fn_p {
                if let Some(p) = p_rows.iter().find(|r| &r.pathname == fnp) {
                    row.idp = p.id;
                    row.ridp = p.rid;
                }
            }
        }
    }
    for row in fv.iter_mut() {
        if let Some(fnm) = &row.fn_m {
            if let Some(m) = m_rows.iter().find(|r| &r.pathname == fnm) {
                row.idm = m.id;
                row.ridm = m.rid;
                row.islinkm = m.islink;
                row.isexe = m.isexe;
            }
        }
    }

    // Propagate exe-bit changes that happened on P->M but not P->V.
    for row in &fv {
        if row.idp == 0 || row.idv == 0 {
            continue;
        }
        let p = p_rows.iter().find(|r| r.id == row.idp);
        let v = v_rows.iter().find(|r| r.id == row.idv);
        if let (Some(p), Some(v)) = (p, v) {
            if row.isexe != p.isexe && v.isexe == p.isexe {
                repo.conn.execute(
                    "UPDATE vfile SET isexe=?1 WHERE id=?2",
                    params![row.isexe, row.idv],
                )?;
            }
        }
    }

    // Reject rename cycles longer than a two-swap before touching disk.
    detect_rename_cycles(&fv)?;

    // --------------------------------------------------------- execute plan
    let binary_matcher = repo.config.binary_matcher()?;

    // Update-to-M: changed P->M but untouched P->V.
    for row in &fv {
        if row.idp > 0
            && row.idv > 0
            && row.idm > 0
            && row.ridm != row.ridp
            && row.ridv == row.ridp
            && row.chnged == 0
        {
            let name = row.fn_v.clone().unwrap_or_default();
            if !opts.dry_run {
                let chnged = if integrate { 4 } else { 2 };
                repo.conn.execute(
                    "UPDATE vfile SET mtime=0, mrid=?1, chnged=?2, islink=?3, \
                     mhash=CASE WHEN rid<>?1 \
                       THEN (SELECT uuid FROM blob WHERE blob.rid=?1) END \
                     WHERE id=?4",
                    params![row.ridm, chnged, row.islinkm, row.idv],
                )?;
                checkout::vfile_to_disk(repo, row.idv)?;
            }
            tracing::debug!(file = %name, "UPDATE");
        }
    }

    // Three-way merges: changed on both sides.
    for row in &fv {
        if row.idv > 0
            && row.idm > 0
            && row.ridm != row.ridp
            && (row.ridv != row.ridp || row.chnged != 0)
        {
            let name = row.fn_v.clone().unwrap_or_default();
            if row.islinkv || row.islinkm {
                stats
                    .warnings
                    .push(format!("cannot merge symlink {name}"));
                stats.conflicts += 1;
                vmerge_insert(repo, row.idv, row.ridm)?;
                continue;
            }
            let pivot_content = if row.ridp > 0 {
                match store::get_if_available(repo, row.ridp)? {
                    Some(content) => content,
                    None if opts.force_missing => Vec::new(),
                    None => return Err(RepoError::MissingContent(row.ridp)),
                }
            } else {
                Vec::new()
            };
            let m_content = store::get(repo, row.ridm)?;
            let path = abs_path(repo, &name)?;
            let v_content = fs::read(&path)?;
            let is_binary = binary_matcher.is_match(&name)
                || looks_like_binary(&pivot_content)
                || looks_like_binary(&v_content)
                || looks_like_binary(&m_content);
            if is_binary {
                stats
                    .warnings
                    .push(format!("cannot merge binary file {name}"));
                stats.conflicts += 1;
            } else {
                let (merged, n) = merge3::merge_3way(&pivot_content, &v_content, &m_content);
                if !opts.dry_run {
                    fs::write(&path, &merged)?;
                    repo.conn
                        .execute("UPDATE vfile SET mtime=0 WHERE id=?1", params![row.idv])?;
                }
                if n > 0 {
                    stats
                        .warnings
                        .push(format!("{n} merge conflict(s) in {name}"));
                    stats.conflicts += n;
                }
            }
            vmerge_insert(repo, row.idv, row.ridm)?;
        }
    }

    // Deletions: in P and V but not in M.
    for row in &fv {
        if row.idp > 0 && row.idv > 0 && row.idm == 0 {
            let name = row.fn_v.clone().unwrap_or_default();
            if row.chnged != 0 {
                stats
                    .warnings
                    .push(format!("local edits lost for {name}"));
                stats.conflicts += 1;
            }
            if !opts.dry_run {
                repo.conn
                    .execute("UPDATE vfile SET deleted=1 WHERE id=?1", params![row.idv])?;
                let _ = fs::remove_file(abs_path(repo, &name)?);
            }
        }
    }

    // Renames applied on P->M while P->V kept the name.
    let mut tmprn: HashMap<String, tempfile::NamedTempFile> = HashMap::new();
    for row in &fv {
        if row.idv > 0
            && row.idp > 0
            && row.idm > 0
            && row.fn_p == row.fn_v
            && row.fn_m != row.fn_p
        {
            let old_name = row.fn_p.clone().unwrap_or_default();
            let new_name = row.fn_m.clone().unwrap_or_default();
            if opts.dry_run {
                continue;
            }
            repo.conn.execute(
                "UPDATE vfile SET pathname=NULL, origname=pathname \
                 WHERE vid=?1 AND pathname=?2",
                params![vid, new_name],
            )?;
            repo.conn.execute(
                "UPDATE vfile SET pathname=?1, origname=coalesce(origname, pathname) \
                 WHERE id=?2",
                params![new_name, row.idv],
            )?;
            let old_path = abs_path(repo, &old_name)?;
            let new_path = abs_path(repo, &new_name)?;
            // Another rename may still need the bytes sitting at the
            // destination; park them in a temporary first.
            if new_path.is_file() {
                let tmp = tempfile::NamedTempFile::new()?;
                fs::copy(&new_path, tmp.path())?;
                tmprn.insert(new_name.clone(), tmp);
            }
            if let Some(dir) = new_path.parent() {
                fs::create_dir_all(dir)?;
            }
            let source = tmprn
                .get(&old_name)
                .map(|t| t.path().to_path_buf())
                .unwrap_or(old_path.clone());
            fs::copy(&source, &new_path)?;
            if tmprn.remove(&old_name).is_none() {
                let _ = fs::remove_file(&old_path);
            }
        }
    }
    if !opts.dry_run {
        repo.conn.execute(
            "UPDATE vfile SET pathname=origname || ' (overwritten by rename)' \
             WHERE pathname IS NULL",
            [],
        )?;
    }

    // Additions: in M only.
    for row in &fv {
        if row.idp == 0 && row.idv == 0 && row.idm > 0 {
            let name = row.fn_m.clone().unwrap_or_default();
            if !opts.dry_run {
                let chnged = if integrate { 5 } else { CHNGED_MERGED_ADD };
                repo.conn.execute(
                    "REPLACE INTO vfile(vid, chnged, deleted, rid, mrid, isexe, islink, pathname, mhash) \
                     SELECT ?1, ?2, 0, rid, mrid, isexe, islink, pathname, \
                            CASE WHEN rid<>mrid \
                                 THEN (SELECT uuid FROM blob WHERE blob.rid=vfile.mrid) END \
                       FROM vfile WHERE id=?3",
                    params![vid, chnged, row.idm],
                )?;
                let new_id = repo.conn.last_insert_rowid();
                let path = abs_path(repo, &name)?;
                if path.is_file() {
                    // Back the unmanaged file up before overwriting it.
                    let backup = abs_path(repo, &format!("{name}-original"))?;
                    fs::copy(&path, backup)?;
                    stats.overwrites += 1;
                    stats
                        .warnings
                        .push(format!("{name} overwrites an unmanaged file (backed up)"));
                }
                checkout::vfile_to_disk(repo, new_id)?;
            }
        }
    }

    // Drop the scaffolding rows for P and M and record the merge intent.
    repo.conn
        .execute("DELETE FROM vfile WHERE vid<>?1", params![vid])?;
    if opts.cherrypick {
        vmerge_insert(repo, -1, mid)?;
    } else if opts.backout {
        vmerge_insert(repo, -2, pid)?;
    } else if integrate {
        vmerge_insert(repo, -4, mid)?;
    } else {
        vmerge_insert(repo, 0, mid)?;
    }
    Ok(stats)
}

/// A rename cycle of more than two files cannot be executed with a single
/// temporary per file; reject it, naming the first offending pair.
fn detect_rename_cycles(fv: &[FvRow]) -> Result<()> {
    let renames: Vec<(&str, &str)> = fv
        .iter()
        .filter(|r| {
            r.idv > 0 && r.idp > 0 && r.idm > 0 && r.fn_p == r.fn_v && r.fn_m != r.fn_p
        })
        .filter_map(|r| {
            Some((r.fn_p.as_deref()?, r.fn_m.as_deref()?))
        })
        .collect();
    let by_src: HashMap<&str, &str> = renames.iter().copied().collect();
    for &(start, _) in &renames {
        let mut cur = start;
        let mut len = 0;
        while let Some(&next) = by_src.get(cur) {
            len += 1;
            if len > renames.len() {
                break;
            }
            if next == start {
                if len > 2 {
                    return Err(RepoError::Integrity(format!(
                        "rename cycle involving {start} and {}", by_src[start]
                    )));
                }
                break;
            }
            cur = next;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch;
    use crate::checkout::{add_file, commit, mv_file, update_to};
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (Repository, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::create_in_memory("alice").unwrap();
        repo.set_local_root(dir.path());
        (repo, dir)
    }

    fn write(dir: &TempDir, name: &str, content: &str) {
        let p = dir.path().join(name);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, content).unwrap();
    }

    fn read(dir: &TempDir, name: &str) -> String {
        fs::read_to_string(dir.path().join(name)).unwrap()
    }

    /// Fast-forward a file edited only on the merged-in branch.
    #[test]
    fn update_to_m_path() {
        let (mut repo, dir) = setup();
        write(&dir, "a.txt", "base\n");
        write(&dir, "b.txt", "stable\n");
        add_file(&mut repo, "a.txt").unwrap();
        add_file(&mut repo, "b.txt").unwrap();
        let v1 = commit(&mut repo, "base").unwrap();

        let b1 = branch::branch_new(&mut repo, "feat", v1, None, false).unwrap();
        update_to(&mut repo, b1).unwrap();
        write(&dir, "a.txt", "feature edit\n");
        let b2 = commit(&mut repo, "edit on feat").unwrap();

        update_to(&mut repo, v1).unwrap();
        let stats = merge(&mut repo, b2, &MergeOptions::default()).unwrap();
        assert_eq!(stats.conflicts, 0);
        assert_eq!(read(&dir, "a.txt"), "feature edit\n");
        // vmerge records the normal merge.
        let id: i64 = repo
            .conn
            .query_row("SELECT id FROM vmerge WHERE merge=?1", params![b2], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(id, 0);
        // And the touched row is flagged merged.
        let chnged: i64 = repo
            .conn
            .query_row(
                "SELECT chnged FROM vfile WHERE pathname='a.txt'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(chnged, CHNGED_MERGED);
    }

    /// Scenario S2: rename on one branch, edit on the other; the merged
    /// file lives under the new name with the edited content.
    #[test]
    fn merge_with_rename() {
        let (mut repo, dir) = setup();
        write(&dir, "README.md", "hello\n");
        add_file(&mut repo, "README.md").unwrap();
        let m1 = commit(&mut repo, "initial").unwrap();

        // feat: rename README.md -> docs/readme.md
        let f1 = branch::branch_new(&mut repo, "feat", m1, None, false).unwrap();
        update_to(&mut repo, f1).unwrap();
        mv_file(&mut repo, "README.md", "docs/readme.md").unwrap();
        let f2 = commit(&mut repo, "rename").unwrap();

        // trunk: edit README.md
        update_to(&mut repo, m1).unwrap();
        write(&dir, "README.md", "hi\n");
        let trunk_tip = commit(&mut repo, "edit line 1").unwrap();

        // Merge trunk into feat. The rename happened on P->V this time, so
        // the content flows to the renamed file.
        update_to(&mut repo, f2).unwrap();
        let stats = merge(&mut repo, trunk_tip, &MergeOptions::default()).unwrap();
        assert_eq!(stats.conflicts, 0, "warnings: {:?}", stats.warnings);
        assert_eq!(read(&dir, "docs/readme.md"), "hi\n");
        let n: i64 = repo
            .conn
            .query_row(
                "SELECT count(*) FROM vmerge WHERE id=0 AND merge=?1",
                params![trunk_tip],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }

    /// Conflicting edits produce marker text and a nonzero count.
    #[test]
    fn conflicting_merge() {
        let (mut repo, dir) = setup();
        write(&dir, "f.txt", "line\n");
        add_file(&mut repo, "f.txt").unwrap();
        let v1 = commit(&mut repo, "base").unwrap();
        let b1 = branch::branch_new(&mut repo, "other", v1, None, false).unwrap();
        update_to(&mut repo, b1).unwrap();
        write(&dir, "f.txt", "their line\n");
        let b2 = commit(&mut repo, "theirs").unwrap();
        update_to(&mut repo, v1).unwrap();
        write(&dir, "f.txt", "our line\n");
        let _v2 = commit(&mut repo, "ours").unwrap();

        let stats = merge(&mut repo, b2, &MergeOptions::default()).unwrap();
        assert_eq!(stats.conflicts, 1);
        let merged = read(&dir, "f.txt");
        assert!(merged.contains("our line"));
        assert!(merged.contains("their line"));
        assert!(merged.contains("BEGIN MERGE CONFLICT"));
    }

    /// Files added on the merged branch appear; files deleted there go
    /// away.
    #[test]
    fn add_and_delete_flow() {
        let (mut repo, dir) = setup();
        write(&dir, "keep.txt", "keep\n");
        write(&dir, "gone.txt", "gone\n");
        add_file(&mut repo, "keep.txt").unwrap();
        add_file(&mut repo, "gone.txt").unwrap();
        let v1 = commit(&mut repo, "base").unwrap();
        let b1 = branch::branch_new(&mut repo, "work", v1, None, false).unwrap();
        update_to(&mut repo, b1).unwrap();
        write(&dir, "new.txt", "brand new\n");
        add_file(&mut repo, "new.txt").unwrap();
        checkout::rm_file(&mut repo, "gone.txt").unwrap();
        let b2 = commit(&mut repo, "add+rm").unwrap();

        update_to(&mut repo, v1).unwrap();
        let stats = merge(&mut repo, b2, &MergeOptions::default()).unwrap();
        assert_eq!(stats.conflicts, 0);
        assert_eq!(read(&dir, "new.txt"), "brand new\n");
        assert!(!dir.path().join("gone.txt").exists());
        let chnged: i64 = repo
            .conn
            .query_row(
                "SELECT chnged FROM vfile WHERE pathname='new.txt'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(chnged, CHNGED_MERGED_ADD);
    }

    /// Cherry-pick records (-1, M); backout records (-2, P).
    #[test]
    fn cherrypick_and_backout_intents() {
        let (mut repo, dir) = setup();
        write(&dir, "f.txt", "a\nb\nc\n");
        add_file(&mut repo, "f.txt").unwrap();
        let _v1 = commit(&mut repo, "one").unwrap();
        write(&dir, "f.txt", "a\nb2\nc\n");
        let v2 = commit(&mut repo, "two").unwrap();
        write(&dir, "f.txt", "a\nb2\nc3\n");
        let v3 = commit(&mut repo, "three").unwrap();

        // Back out v2's change from the tip.
        let stats = merge(
            &mut repo,
            v2,
            &MergeOptions {
                backout: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(stats.conflicts, 0, "warnings: {:?}", stats.warnings);
        assert_eq!(read(&dir, "f.txt"), "a\nb\nc3\n");
        let n: i64 = repo
            .conn
            .query_row(
                "SELECT count(*) FROM vmerge WHERE id=-2 AND merge=?1",
                params![v2],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
        checkout::revert(&mut repo, None).unwrap();
        let _ = v3;
    }

    /// Property 7: merging the same change twice is a no-op the second
    /// time, with the vmerge row deduplicated.
    #[test]
    fn merge_idempotence() {
        let (mut repo, dir) = setup();
        write(&dir, "f.txt", "base\n");
        add_file(&mut repo, "f.txt").unwrap();
        let v1 = commit(&mut repo, "base").unwrap();
        let b1 = branch::branch_new(&mut repo, "twice", v1, None, false).unwrap();
        update_to(&mut repo, b1).unwrap();
        write(&dir, "f.txt", "branch edit\n");
        let b2 = commit(&mut repo, "edit").unwrap();
        update_to(&mut repo, v1).unwrap();

        merge(&mut repo, b2, &MergeOptions::default()).unwrap();
        let once = read(&dir, "f.txt");
        merge(
            &mut repo,
            b2,
            &MergeOptions {
                force: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(read(&dir, "f.txt"), once);
        let n: i64 = repo
            .conn
            .query_row(
                "SELECT count(*) FROM vmerge WHERE id=0 AND merge=?1",
                params![b2],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }

    /// Binary files never get textual markers; they count as conflicts.
    #[test]
    fn binary_conflict() {
        let (mut repo, dir) = setup();
        fs::write(dir.path().join("blob.bin"), b"\x00\x01base").unwrap();
        add_file(&mut repo, "blob.bin").unwrap();
        let v1 = commit(&mut repo, "base").unwrap();
        let b1 = branch::branch_new(&mut repo, "bin", v1, None, false).unwrap();
        update_to(&mut repo, b1).unwrap();
        fs::write(dir.path().join("blob.bin"), b"\x00\x01theirs").unwrap();
        let b2 = commit(&mut repo, "theirs").unwrap();
        update_to(&mut repo, v1).unwrap();
        fs::write(dir.path().join("blob.bin"), b"\x00\x01ours").unwrap();
        let _v2 = commit(&mut repo, "ours").unwrap();

        let stats = merge(&mut repo, b2, &MergeOptions::default()).unwrap();
        assert_eq!(stats.conflicts, 1);
        // Local content is left in place.
        assert_eq!(fs::read(dir.path().join("blob.bin")).unwrap(), b"\x00\x01ours");
    }

    /// Dry-run rolls everything back.
    #[test]
    fn dry_run_leaves_no_trace() {
        let (mut repo, dir) = setup();
        write(&dir, "f.txt", "base\n");
        add_file(&mut repo, "f.txt").unwrap();
        let v1 = commit(&mut repo, "base").unwrap();
        let b1 = branch::branch_new(&mut repo, "dry", v1, None, false).unwrap();
        update_to(&mut repo, b1).unwrap();
        write(&dir, "f.txt", "changed\n");
        let b2 = commit(&mut repo, "edit").unwrap();
        update_to(&mut repo, v1).unwrap();

        merge(
            &mut repo,
            b2,
            &MergeOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();
        let n: i64 = repo
            .conn
            .query_row("SELECT count(*) FROM vmerge", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }
}
