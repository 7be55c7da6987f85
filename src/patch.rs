//! Portable patch bundles: a self-contained SQLite database that captures
//! working-copy deltas against a baseline check-in, including deletions,
//! renames and pending-merge intent, and can be transported, inspected,
//! diffed and re-applied in another workspace.
//!
//! Schema (binding wire format):
//!
//! ```text
//! chng(pathname, origname, hash, isexe, islink, delta BLOB)
//! cfg(key, value)
//! patchmerge(type, mhash)     -- only present when merges are pending
//! ```
//!
//! `chng` row meanings: hash NULL + delta = new file; hash NULL + delta
//! NULL = deleted; hash + empty delta = unchanged (rename carrier); hash +
//! delta = edit to apply against the artifact with that hash.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::checkout::{self, abs_path};
use crate::delta;
use crate::errors::{RepoError, Result};
use crate::merge::{self, MergeOptions};
use crate::repo::Repository;
use crate::store;
use crate::utils::{julian_now, unix_to_julian};

/// Build time stamped by the build script, recorded in every bundle's cfg.
const BUILD_EPOCH: &str = env!("CHERT_BUILD_EPOCH");

/// Options for [`patch_apply`].
#[derive(Clone, Debug, Default)]
pub struct PatchApplyOptions {
    /// Revert unsaved changes instead of refusing.
    pub force: bool,
    /// Plan only; leave the checkout untouched.
    pub dry_run: bool,
}

/// How one `chng` row classifies for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchChangeKind {
    New,
    Edit,
    Delete,
    Rename { from: String },
}

/// A patch database, attached read-only. Holds its own connection (and the
/// backing temp file when built from a byte stream).
pub struct PatchFile {
    conn: Connection,
    path: PathBuf,
    _tempfile: Option<tempfile::NamedTempFile>,
}

impl PatchFile {
    /// Open and validate a patch database file. `quick_check` failures and
    /// a missing schema are rejected.
    pub fn open(path: &Path) -> Result<PatchFile> {
        let conn = Connection::open(path)?;
        let patch = PatchFile {
            conn,
            path: path.to_path_buf(),
            _tempfile: None,
        };
        patch.validate()?;
        Ok(patch)
    }

    /// Open a patch arriving as raw bytes (from a pipe or a sync channel);
    /// the bytes land in a temporary file that lives as long as the value.
    pub fn from_bytes(data: &[u8]) -> Result<PatchFile> {
        if data.len() < 512 || !data.starts_with(b"SQLite format 3\0") {
            return Err(RepoError::InvalidPatch("(byte stream)".into()));
        }
        let tmp = tempfile::NamedTempFile::new()?;
        fs::write(tmp.path(), data)?;
        let conn = Connection::open(tmp.path())?;
        let patch = PatchFile {
            conn,
            path: tmp.path().to_path_buf(),
            _tempfile: Some(tmp),
        };
        patch.validate()?;
        Ok(patch)
    }

    fn validate(&self) -> Result<()> {
        let name = self.path.display().to_string();
        let mut stmt = self
            .conn
            .prepare("PRAGMA quick_check")
            .map_err(|_| RepoError::InvalidPatch(name.clone()))?;
        let rows: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(|_| RepoError::InvalidPatch(name.clone()))?
            .collect::<rusqlite::Result<_>>()?;
        if rows.iter().any(|r| r != "ok") {
            return Err(RepoError::InvalidPatch(name));
        }
        for table in ["chng", "cfg"] {
            let present: Option<String> = self
                .conn
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    params![table],
                    |row| row.get(0),
                )
                .optional()?;
            if present.is_none() {
                return Err(RepoError::InvalidPatch(name));
            }
        }
        Ok(())
    }

    /// One cfg value.
    pub fn cfg(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM cfg WHERE key=?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn has_patchmerge(&self) -> Result<bool> {
        let present: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='patchmerge'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(present.is_some())
    }

    /// Pending merges recorded in the patch: (type, hash).
    pub fn merges(&self) -> Result<Vec<(String, String)>> {
        if !self.has_patchmerge()? {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT type, mhash FROM patchmerge \
             WHERE type IN ('merge','cherrypick','backout','integrate') \
               AND mhash NOT GLOB '*[^a-fA-F0-9]*'",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }

    /// Classify every path in the patch for display.
    pub fn view(&self) -> Result<Vec<(String, PatchChangeKind)>> {
        let mut stmt = self.conn.prepare(
            "SELECT pathname, \
                    hash IS NULL AND delta IS NOT NULL, \
                    delta IS NULL, \
                    origname \
             FROM chng ORDER BY 1",
        )?;
        let rows: Vec<(String, bool, bool, Option<String>)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        let mut out = Vec::new();
        for (pathname, is_new, is_del, orig) in rows {
            match orig {
                Some(from) if from != pathname => {
                    out.push((pathname.clone(), PatchChangeKind::Rename { from }));
                    if is_new {
                        out.push((pathname, PatchChangeKind::New));
                    } else if !is_del {
                        out.push((pathname, PatchChangeKind::Edit));
                    }
                }
                _ => {
                    if is_new {
                        out.push((pathname, PatchChangeKind::New));
                    } else if is_del {
                        out.push((pathname, PatchChangeKind::Delete));
                    } else {
                        out.push((pathname, PatchChangeKind::Edit));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Raw chng rows: (pathname, origname, hash, isexe, islink, delta).
    #[allow(clippy::type_complexity)]
    fn chng_rows(
        &self,
    ) -> Result<Vec<(String, Option<String>, Option<String>, bool, bool, Option<Vec<u8>>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT pathname, origname, hash, isexe, islink, delta FROM chng ORDER BY pathname",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }
}

/// Build a patch database capturing the current checkout's changes against
/// its baseline. Writes the database to `out` and also returns its bytes
/// (for pipe transport).
pub fn patch_create(repo: &mut Repository, out: Option<&Path>) -> Result<Vec<u8>> {
    let vid = checkout::current_checkout(repo)?;
    if vid == 0 {
        return Err(RepoError::Checkout("nothing is checked out".into()));
    }
    if let Some(path) = out {
        if path.exists() {
            return Err(RepoError::Checkout(format!(
                "patch file already exists: {}",
                path.display()
            )));
        }
    }
    checkout::vfile_check_signature(repo, vid)?;

    let tmp;
    let db_path: &Path = match out {
        Some(p) => p,
        None => {
            tmp = tempfile::NamedTempFile::new()?;
            // The builder wants to create the file itself.
            fs::remove_file(tmp.path())?;
            tmp.path()
        }
    };

    {
        let patch = Connection::open(db_path)?;
        patch.pragma_update(None, "page_size", 512)?;
        patch.pragma_update(None, "journal_mode", "OFF")?;
        patch.execute_batch(
            "CREATE TABLE chng(\n\
               pathname TEXT,\n\
               origname TEXT,\n\
               hash TEXT,\n\
               isexe BOOL,\n\
               islink BOOL,\n\
               delta BLOB\n\
             );\n\
             CREATE TABLE cfg(\n\
               key TEXT,\n\
               value ANY\n\
             );",
        )?;

        let baseline = repo.uuid_for_rid(vid)?;
        let ckout = repo.local_root()?.display().to_string();
        let mut cfg_stmt = patch.prepare("INSERT INTO cfg(key, value) VALUES(?1, ?2)")?;
        cfg_stmt.execute(params!["baseline", baseline])?;
        cfg_stmt.execute(params!["ckout", ckout])?;
        if let Some(db) = repo.conn.path().filter(|p| !p.is_empty()) {
            cfg_stmt.execute(params!["repo", db])?;
        }
        cfg_stmt.execute(params!["user", repo.user])?;
        cfg_stmt.execute(params!["date", julian_now().to_string()])?;
        for key in ["project-code", "project-name"] {
            if let Some(v) = repo.config_get(key)? {
                cfg_stmt.execute(params![key, v])?;
            }
        }
        let build_jd = unix_to_julian(BUILD_EPOCH.parse::<f64>().unwrap_or(0.0));
        cfg_stmt.execute(params!["fossil-date", build_jd.to_string()])?;
        if let Ok(host) = std::env::var("HOSTNAME") {
            cfg_stmt.execute(params!["hostname", host])?;
        }
        drop(cfg_stmt);

        let rows = checkout::vfile_rows(repo, vid)?;
        let mut ins = patch.prepare(
            "INSERT INTO chng(pathname, origname, hash, isexe, islink, delta) \
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for row in rows {
            if row.rid == 0 {
                // New file: full compressed content, NULL hash.
                let content = fs::read(abs_path(repo, &row.pathname)?)?;
                ins.execute(params![
                    row.pathname,
                    Option::<String>::None,
                    Option::<String>::None,
                    row.isexe,
                    row.islink,
                    store::compress(&content),
                ])?;
            } else if row.deleted {
                ins.execute(params![
                    row.pathname,
                    Option::<String>::None,
                    Option::<String>::None,
                    false,
                    false,
                    Option::<Vec<u8>>::None,
                ])?;
            } else if row.chnged != 0
                || row
                    .origname
                    .as_deref()
                    .is_some_and(|o| o != row.pathname)
            {
                let baseline_content = store::get(repo, row.rid)?;
                let disk = fs::read(abs_path(repo, &row.pathname)?)?;
                let delta_blob: Vec<u8> = if disk == baseline_content {
                    Vec::new()
                } else {
                    store::compress(&delta::create(&baseline_content, &disk))
                };
                let origname = row
                    .origname
                    .clone()
                    .filter(|o| o != &row.pathname);
                ins.execute(params![
                    row.pathname,
                    origname,
                    repo.uuid_for_rid(row.rid)?,
                    row.isexe,
                    row.islink,
                    delta_blob,
                ])?;
            }
        }
        drop(ins);

        let merges: Vec<(i64, String)> = {
            let mut stmt = repo
                .conn
                .prepare_cached("SELECT id, mhash FROM vmerge WHERE id<=0")?;
            let __rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        if !merges.is_empty() {
            patch.execute_batch("CREATE TABLE patchmerge(type TEXT, mhash TEXT);")?;
            let mut ins = patch.prepare("INSERT INTO patchmerge(type, mhash) VALUES(?1, ?2)")?;
            for (id, mhash) in merges {
                let kind = match id {
                    0 => "merge",
                    -1 => "cherrypick",
                    -2 => "backout",
                    -4 => "integrate",
                    _ => continue,
                };
                ins.execute(params![kind, mhash])?;
            }
        }
    }

    let bytes = fs::read(db_path)?;
    debug!(size = bytes.len(), "patch created");
    Ok(bytes)
}

/// Fetch both sides of every edited path so a generic text-diff component
/// can render them: (pathname, baseline bytes, patched bytes).
pub fn patch_diff(
    repo: &mut Repository,
    patch: &PatchFile,
) -> Result<Vec<(String, Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    for (pathname, _orig, hash, _isexe, _islink, delta_blob) in patch.chng_rows()? {
        let baseline = match &hash {
            Some(h) => {
                let rid = repo
                    .rid_for_uuid(h)?
                    .ok_or_else(|| RepoError::MissingArtifact(h.clone()))?;
                store::get(repo, rid)?
            }
            None => Vec::new(),
        };
        let new = match delta_blob {
            None => Vec::new(), // deletion
            Some(blob) if blob.is_empty() => baseline.clone(),
            Some(blob) => {
                let raw = store::decompress(&blob)?;
                if hash.is_some() {
                    delta::apply(&baseline, &raw)?
                } else {
                    raw // new file carries full content
                }
            }
        };
        out.push((pathname, baseline, new));
    }
    Ok(out)
}

/// Apply a patch to the current checkout.
pub fn patch_apply(
    repo: &mut Repository,
    patch: &PatchFile,
    opts: &PatchApplyOptions,
) -> Result<()> {
    if checkout::unsaved_changes(repo)? {
        if !opts.force {
            return Err(RepoError::Checkout(
                "cannot apply patch: there are unsaved changes in the current checkout".into(),
            ));
        }
        if !opts.dry_run {
            checkout::revert(repo, None)?;
        }
    }

    // Move to the patch's baseline first.
    let baseline = patch
        .cfg("baseline")?
        .ok_or_else(|| RepoError::InvalidPatch("missing baseline".into()))?;
    let base_rid = repo
        .rid_for_uuid(&baseline)?
        .ok_or(RepoError::MissingArtifact(baseline.clone()))?;
    if checkout::current_checkout(repo)? != base_rid && !opts.dry_run {
        checkout::update_to(repo, base_rid)?;
    }

    // Replay recorded merges through the regular engine.
    let merges = patch.merges()?;
    for (kind, mhash) in &merges {
        let mrid = repo
            .rid_for_uuid(mhash)?
            .ok_or_else(|| RepoError::MissingArtifact(mhash.clone()))?;
        let mopts = MergeOptions {
            cherrypick: kind == "cherrypick",
            backout: kind == "backout",
            integrate: kind == "integrate",
            dry_run: opts.dry_run,
            ..Default::default()
        };
        merge::merge(repo, mrid, &mopts)?;
    }

    // After merges, revert residual changes the patch does not mention;
    // this clears sync-race residue from the merge replay.
    if !merges.is_empty() && !opts.dry_run {
        let vid = checkout::current_checkout(repo)?;
        checkout::vfile_check_signature(repo, vid)?;
        let stale: Vec<String> = {
            let mut stmt = repo.conn.prepare(
                "SELECT pathname FROM vfile WHERE vid=?1 AND chnged",
            )?;
            let __rows = stmt.query_map(params![vid], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        let mentioned: std::collections::HashSet<String> = patch
            .chng_rows()?
            .into_iter()
            .map(|r| r.0)
            .collect();
        let to_revert: Vec<String> = stale
            .into_iter()
            .filter(|p| !mentioned.contains(p))
            .collect();
        if !to_revert.is_empty() {
            checkout::revert(repo, Some(&to_revert))?;
        }
    }

    if opts.dry_run {
        return Ok(());
    }

    // Deletions, renames, then content.
    for (pathname, orig, _hash, _isexe, _islink, delta_blob) in patch.chng_rows()? {
        if orig.is_none() && delta_blob.is_none() {
            checkout::rm_file(repo, &pathname)?;
        }
    }
    for (pathname, orig, _hash, _isexe, _islink, _delta) in patch.chng_rows()? {
        if let Some(from) = orig {
            if from != pathname {
                checkout::mv_file(repo, &from, &pathname)?;
            }
        }
    }
    for (pathname, _orig, hash, _isexe, _islink, delta_blob) in patch.chng_rows()? {
        let Some(blob) = delta_blob else { continue };
        if blob.is_empty() {
            continue; // rename carrier, no content change
        }
        let raw = store::decompress(&blob)?;
        let content = match &hash {
            Some(h) => {
                let rid = repo
                    .rid_for_uuid(h)?
                    .ok_or_else(|| RepoError::MissingArtifact(h.clone()))?;
                let basis = store::get(repo, rid)?;
                let out_size = delta::output_size(&raw)?;
                if out_size == 0 && !raw.is_empty() {
                    return Err(RepoError::InvalidPatch(pathname.clone()));
                }
                delta::apply(&basis, &raw)?
            }
            None => raw,
        };
        let path = abs_path(repo, &pathname)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, &content)?;
        if hash.is_none() {
            checkout::add_file(repo, &pathname)?;
        }
    }

    // Reflect the new on-disk state in vfile so `chnged` is accurate.
    let vid = checkout::current_checkout(repo)?;
    checkout::vfile_check_signature(repo, vid)?;
    Ok(())
}
