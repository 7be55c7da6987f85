//! The repository context: one SQLite connection, the schema, the caches,
//! and session-wide bookkeeping (receive provenance, transaction nesting).
//!
//! Every core operation hangs off [`Repository`]; the caches live and die
//! with it. A second `Repository` opened in the same process shares
//! nothing.

pub mod schema;

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::RepoConfig;
use crate::errors::{RepoError, Result};
use crate::hash::HashPolicy;
use crate::manifest::ManifestCache;
use crate::store::cache::ContentCache;
use crate::utils::julian_now;

/// A repository handle. Construct with [`Repository::create`] /
/// [`Repository::open`]; use [`Repository::set_local_root`] before any
/// working-copy operation.
pub struct Repository {
    pub(crate) conn: Connection,
    pub config: RepoConfig,
    /// Login recorded on new artifacts and rcvfrom rows.
    pub user: String,
    pub(crate) local_root: Option<PathBuf>,
    pub(crate) content_cache: ContentCache,
    pub(crate) manifest_cache: ManifestCache,
    /// rcvfrom row for this session; 0 until the first write.
    pub(crate) rcvid: i64,
    /// Skip automatic crosslinking on dephantomize (used during clone-like
    /// bulk loads that finish with a rebuild).
    pub(crate) dephantomize_disabled: bool,
    /// Ticket uuids queued between crosslink begin/end.
    pub(crate) pending_tkt: Vec<String>,
    pub(crate) crosslink_busy: bool,
    /// When set, every new artifact is also marked private.
    pub mark_private: bool,
    nested_txn: u32,
    txn_rollback: bool,
}

impl Repository {
    /// Create (or reopen) a repository database at `path` with the given
    /// user as the session login.
    pub fn create(path: &Path, user: &str) -> Result<Repository> {
        let conn = Connection::open(path)?;
        Self::setup(conn, user.to_string())
    }

    /// An in-memory repository, used by tests and by patch inspection.
    pub fn create_in_memory(user: &str) -> Result<Repository> {
        let conn = Connection::open_in_memory()?;
        Self::setup(conn, user.to_string())
    }

    /// Open an existing repository; the session user is read back from the
    /// config table.
    pub fn open(path: &Path) -> Result<Repository> {
        let conn = Connection::open(path)?;
        let mut repo = Self::setup(conn, String::new())?;
        repo.user = repo
            .config_get("user")?
            .unwrap_or_else(|| "anonymous".to_string());
        Ok(repo)
    }

    fn setup(conn: Connection, user: String) -> Result<Repository> {
        conn.execute_batch(schema::SCHEMA)?;
        let mut repo = Repository {
            conn,
            config: RepoConfig::default(),
            user,
            local_root: None,
            content_cache: ContentCache::default(),
            manifest_cache: ManifestCache::default(),
            rcvid: 0,
            dephantomize_disabled: false,
            pending_tkt: Vec::new(),
            crosslink_busy: false,
            mark_private: false,
            nested_txn: 0,
            txn_rollback: false,
        };
        repo.load_config()?;
        if !repo.user.is_empty() {
            repo.config_set("user", &repo.user)?;
        }
        Ok(repo)
    }

    /// Root directory of the working copy for checkout operations.
    pub fn set_local_root(&mut self, root: &Path) {
        self.local_root = Some(root.to_path_buf());
    }

    pub(crate) fn local_root(&self) -> Result<&Path> {
        self.local_root
            .as_deref()
            .ok_or_else(|| RepoError::Checkout("no working copy is attached".into()))
    }

    // ----------------------------------------------------------------- config

    pub fn config_get(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM config WHERE name=?1",
                params![name],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    pub fn config_set(&self, name: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "REPLACE INTO config(name, value, mtime) VALUES(?1, ?2, ?3)",
            params![name, value, julian_now()],
        )?;
        Ok(())
    }

    fn load_config(&mut self) -> Result<()> {
        if let Some(z) = self.config_get("hash-policy")? {
            self.config.hash_policy = z
                .parse()
                .map_err(|e: String| RepoError::Config(e))?;
        }
        self.config.binary_glob = self.config_get("binary-glob")?;
        self.config.omitsign = matches!(self.config_get("omitsign")?.as_deref(), Some("1"));
        self.config.clearsign = matches!(self.config_get("clearsign")?.as_deref(), Some("1"));
        if let Some(z) = self.config_get("deconstruct-prefix")? {
            self.config.deconstruct_prefix = z
                .parse()
                .map_err(|_| RepoError::Config(format!("bad deconstruct-prefix `{z}`")))?;
        }
        Ok(())
    }

    /// Change the hash policy, persisting it. The auto→sha3 upgrade in the
    /// store goes through here so the transition survives reopen.
    pub fn set_hash_policy(&mut self, policy: HashPolicy) -> Result<()> {
        self.config.hash_policy = policy;
        self.config_set("hash-policy", policy.as_str())
    }

    // ----------------------------------------------------------- transactions

    /// Begin a (possibly nested) transaction. Only the outermost level
    /// issues BEGIN.
    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.nested_txn == 0 {
            self.conn.execute_batch("BEGIN")?;
            self.txn_rollback = false;
        }
        self.nested_txn += 1;
        Ok(())
    }

    /// End one nesting level. A `rollback` request at any level forces the
    /// outermost end to roll back, so a failed inner operation can never
    /// leave partial writes visible.
    pub fn end_transaction(&mut self, rollback: bool) -> Result<()> {
        debug_assert!(self.nested_txn > 0);
        if rollback {
            self.txn_rollback = true;
        }
        self.nested_txn -= 1;
        if self.nested_txn == 0 {
            if self.txn_rollback {
                self.conn.execute_batch("ROLLBACK")?;
                self.content_cache.clear();
                self.manifest_cache.clear();
            } else {
                self.conn.execute_batch("COMMIT")?;
            }
            self.txn_rollback = false;
        }
        Ok(())
    }

    /// Run `f` inside a transaction, committing on success and rolling back
    /// on error.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.begin_transaction()?;
        match f(self) {
            Ok(v) => {
                self.end_transaction(false)?;
                Ok(v)
            }
            Err(e) => {
                self.end_transaction(true)?;
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------- identity

    /// Look up the rid carrying hash `uuid`, if any.
    pub fn rid_for_uuid(&self, uuid: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT rid FROM blob WHERE uuid=?1",
                params![uuid],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// The hash of artifact `rid`.
    pub fn uuid_for_rid(&self, rid: i64) -> Result<String> {
        self.conn
            .query_row("SELECT uuid FROM blob WHERE rid=?1", params![rid], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or(RepoError::MissingContent(rid))
    }

    /// True if the hash is on the shun list.
    pub fn is_shunned(&self, uuid: &str) -> Result<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM shun WHERE uuid=?1", params![uuid], |_| {
                Ok(())
            })
            .optional()?
            .is_some())
    }

    /// Add a hash to the shun list. Shunning is permanent at reception
    /// time: a shunned artifact is never stored again.
    pub fn shun(&self, uuid: &str, comment: &str) -> Result<()> {
        self.conn.execute(
            "REPLACE INTO shun(uuid, mtime, scom) VALUES(?1, ?2, ?3)",
            params![uuid, julian_now(), comment],
        )?;
        Ok(())
    }

    /// Make sure this session has an rcvfrom provenance row, creating it on
    /// first use.
    pub(crate) fn rcvid_init(&mut self) -> Result<i64> {
        if self.rcvid == 0 {
            self.conn.execute(
                "INSERT INTO rcvfrom(uid, mtime, nonce, ipaddr) VALUES(?1, ?2, NULL, NULL)",
                params![self.user, julian_now()],
            )?;
            self.rcvid = self.conn.last_insert_rowid();
        }
        Ok(self.rcvid)
    }

    /// Release the caches explicitly. Called at teardown and by rebuild.
    pub fn clear_caches(&mut self) {
        self.content_cache.clear();
        self.manifest_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trip() {
        let repo = Repository::create_in_memory("alice").unwrap();
        repo.config_set("binary-glob", "*.png").unwrap();
        assert_eq!(
            repo.config_get("binary-glob").unwrap().as_deref(),
            Some("*.png")
        );
        assert_eq!(repo.config_get("user").unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn nested_transactions_commit_once() {
        let mut repo = Repository::create_in_memory("alice").unwrap();
        repo.begin_transaction().unwrap();
        repo.begin_transaction().unwrap();
        repo.config_set("k", "v").unwrap();
        repo.end_transaction(false).unwrap();
        repo.end_transaction(false).unwrap();
        assert_eq!(repo.config_get("k").unwrap().as_deref(), Some("v"));
    }

    /// An inner rollback poisons the outermost transaction.
    #[test]
    fn inner_rollback_wins() {
        let mut repo = Repository::create_in_memory("alice").unwrap();
        repo.begin_transaction().unwrap();
        repo.begin_transaction().unwrap();
        repo.config_set("doomed", "1").unwrap();
        repo.end_transaction(true).unwrap();
        repo.end_transaction(false).unwrap();
        assert_eq!(repo.config_get("doomed").unwrap(), None);
    }

    #[test]
    fn shun_list() {
        let repo = Repository::create_in_memory("alice").unwrap();
        assert!(!repo.is_shunned("deadbeef").unwrap());
        repo.shun("deadbeef", "spam").unwrap();
        assert!(repo.is_shunned("deadbeef").unwrap());
    }
}
