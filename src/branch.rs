//! Branch creation: synthesize a manifest that copies a basis check-in's
//! file tree, reparents onto it, and rewrites the symbolic tags so the new
//! check-in starts its own branch.

use rusqlite::params;

use crate::crosslink;
use crate::errors::{RepoError, Result};
use crate::manifest::{md5_of_cards, parse_artifact, ArtifactKind};
use crate::repo::Repository;
use crate::store;
use crate::tag::{self, TAG_BRANCH};
use crate::utils::{format_card_date, fossilize};

/// True if an open (non-closed) branch with this name exists.
pub fn branch_is_open(repo: &Repository, name: &str) -> Result<bool> {
    let rids: Vec<i64> = {
        let mut stmt = repo.conn.prepare_cached(
            "SELECT rid FROM tagxref WHERE tagid=?1 AND tagtype>0 AND value=?2",
        )?;
        let __rows = stmt.query_map(params![TAG_BRANCH, name], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        __rows
    };
    for rid in rids {
        if !tag::leaf_is_closed(repo, rid)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Create a new branch named `branch` whose first check-in copies the file
/// tree of `basis_rid`. Returns the rid of the branch manifest.
///
/// The manifest cancels every `sym-*` tag inherited from the basis and
/// asserts `branch`/`sym-<name>` as propagating tags, so descendants land
/// on the new branch.
pub fn branch_new(
    repo: &mut Repository,
    branch: &str,
    basis_rid: i64,
    bgcolor: Option<&str>,
    private: bool,
) -> Result<i64> {
    if branch.is_empty() {
        return Err(RepoError::Checkout("branch name cannot be empty".into()));
    }
    if branch_is_open(repo, branch)? {
        return Err(RepoError::Checkout(format!(
            "an open branch named \"{branch}\" already exists"
        )));
    }
    let parent = parse_artifact(repo, basis_rid)?;
    if parent.kind() != ArtifactKind::Manifest {
        return Err(RepoError::Checkout(format!(
            "rid {basis_rid} is not a check-in"
        )));
    }
    let is_private = private || store::is_private(repo, basis_rid)?;

    repo.begin_transaction()?;
    let r = (|| -> Result<i64> {
        let mut cards = String::new();
        if let Some(b) = &parent.baseline {
            cards.push_str(&format!("B {b}\n"));
        }
        let comment = format!("Create new branch named \"{branch}\"");
        cards.push_str(&format!("C {}\n", fossilize(&comment)));
        cards.push_str(&format!("D {}\n", format_card_date(chrono::Utc::now())));

        // Copy the file tree of the basis verbatim.
        for f in &parent.files {
            cards.push_str(&format!("F {}", fossilize(&f.name)));
            if let Some(uuid) = &f.uuid {
                cards.push_str(&format!(" {uuid}"));
                if !f.perm.is_empty() {
                    cards.push_str(&format!(" {}", f.perm));
                }
            }
            cards.push('\n');
        }
        let basis_uuid = repo.uuid_for_rid(basis_rid)?;
        cards.push_str(&format!("P {basis_uuid}\n"));
        if let Some(r_card) = &parent.repo_cksum {
            cards.push_str(&format!("R {r_card}\n"));
        }

        // Tag block, emitted in sorted card order: '*' sorts before '-'.
        if let Some(color) = bgcolor {
            cards.push_str(&format!("T *bgcolor * {}\n", fossilize(color)));
        }
        cards.push_str(&format!("T *branch * {}\n", fossilize(branch)));
        cards.push_str(&format!("T *sym-{} *\n", fossilize(branch)));
        let sym_tags: Vec<String> = {
            let mut stmt = repo.conn.prepare_cached(
                "SELECT tagname FROM tagxref, tag \
                 WHERE tagxref.rid=?1 AND tagxref.tagid=tag.tagid \
                   AND tagtype>0 AND tagname GLOB 'sym-*' ORDER BY tagname",
            )?;
            let __rows = stmt.query_map(params![basis_rid], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            __rows
        };
        for t in sym_tags {
            if t != format!("sym-{branch}") {
                cards.push_str(&format!("T -{} *\n", fossilize(&t)));
            }
        }
        cards.push_str(&format!("U {}\n", fossilize(&repo.user)));
        let text = format!("{cards}Z {}\n", md5_of_cards(&cards));

        let brid = store::put(repo, text.as_bytes(), is_private)?;
        if !crosslink::crosslink(repo, brid, text.into_bytes())? {
            return Err(RepoError::Integrity(
                "branch manifest failed to crosslink".into(),
            ));
        }
        store::deltify(repo, basis_rid, &[brid], false)?;
        Ok(brid)
    })();
    repo.end_transaction(r.is_err())?;
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout;
    use std::fs;
    use tempfile::TempDir;

    /// Scenario S1: branch off the first commit; the branch manifest
    /// copies the file tree, asserts *branch/*sym tags and cancels
    /// sym-trunk.
    #[test]
    fn create_branch_from_trunk() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::create_in_memory("alice").unwrap();
        repo.set_local_root(dir.path());
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        checkout::add_file(&mut repo, "README.md").unwrap();
        let m1 = checkout::commit(&mut repo, "initial").unwrap();

        let m2 = branch_new(&mut repo, "feat", m1, None, false).unwrap();
        let parsed = parse_artifact(&mut repo, m2).unwrap();
        assert_eq!(parsed.kind(), ArtifactKind::Manifest);

        // F list equals M1's.
        let base = parse_artifact(&mut repo, m1).unwrap();
        let names: Vec<_> = parsed.files.iter().map(|f| (&f.name, &f.uuid)).collect();
        let base_names: Vec<_> = base.files.iter().map(|f| (&f.name, &f.uuid)).collect();
        assert_eq!(names, base_names);

        // T *branch * feat present; sym-trunk cancelled.
        assert!(parsed
            .tags
            .iter()
            .any(|t| t.prefix == '*' && t.name == "branch" && t.value.as_deref() == Some("feat")));
        assert!(parsed
            .tags
            .iter()
            .any(|t| t.prefix == '-' && t.name == "sym-trunk"));

        assert_eq!(
            tag::branch_of_rid(&repo, m2).unwrap().as_deref(),
            Some("feat")
        );
        assert!(branch_is_open(&repo, "feat").unwrap());
        // A second branch of the same name is refused.
        assert!(branch_new(&mut repo, "feat", m1, None, false).is_err());
    }

    /// A private basis forces the branch private.
    #[test]
    fn private_basis_forces_private_branch() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::create_in_memory("alice").unwrap();
        repo.set_local_root(dir.path());
        fs::write(dir.path().join("a.txt"), "x\n").unwrap();
        checkout::add_file(&mut repo, "a.txt").unwrap();
        let m1 = checkout::commit(&mut repo, "initial").unwrap();
        store::mark_private(&repo, m1).unwrap();
        let m2 = branch_new(&mut repo, "secret", m1, Some("red"), false).unwrap();
        assert!(store::is_private(&repo, m2).unwrap());
    }
}
