//! Settings consumed by the core, persisted in the repository `config`
//! table and surfaced as one deserializable struct.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::errors::{RepoError, Result};
use crate::hash::HashPolicy;

/// Settings the core reads. Anything else in the `config` table is owned
/// by outer layers and passes through rebuilds untouched.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RepoConfig {
    /// Flavour used for hashing new artifacts; `auto` upgrades once a
    /// 64-hex artifact is accepted.
    pub hash_policy: HashPolicy,
    /// Comma-or-newline separated glob patterns naming paths treated as
    /// binary during merges.
    pub binary_glob: Option<String>,
    /// Suppress PGP clear-sign wrapping of new manifests.
    pub omitsign: bool,
    /// Wrap new manifests in a clear-sign envelope (signing is external).
    pub clearsign: bool,
    /// Directory-prefix length used by deconstruct exports.
    pub deconstruct_prefix: usize,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            hash_policy: HashPolicy::Auto,
            binary_glob: None,
            omitsign: false,
            clearsign: false,
            deconstruct_prefix: 2,
        }
    }
}

impl RepoConfig {
    /// Compile `binary-glob` into a matcher. An absent setting matches
    /// nothing.
    pub fn binary_matcher(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        if let Some(raw) = &self.binary_glob {
            for pat in raw.split(|c| c == ',' || c == '\n') {
                let pat = pat.trim();
                if pat.is_empty() {
                    continue;
                }
                let glob = Glob::new(pat)
                    .map_err(|e| RepoError::Config(format!("binary-glob `{pat}`: {e}")))?;
                builder.add(glob);
            }
        }
        builder
            .build()
            .map_err(|e| RepoError::Config(format!("binary-glob: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = RepoConfig::default();
        assert_eq!(cfg.hash_policy, HashPolicy::Auto);
        assert_eq!(cfg.deconstruct_prefix, 2);
        assert!(!cfg.binary_matcher().unwrap().is_match("image.png"));
    }

    #[test]
    fn binary_glob_matches() {
        let cfg = RepoConfig {
            binary_glob: Some("*.png,*.jpg\n*.bin".to_string()),
            ..Default::default()
        };
        let m = cfg.binary_matcher().unwrap();
        assert!(m.is_match("logo.png"));
        assert!(m.is_match("data.bin"));
        assert!(!m.is_match("main.rs"));
    }

    #[test]
    fn bad_glob_is_a_config_error() {
        let cfg = RepoConfig {
            binary_glob: Some("[".to_string()),
            ..Default::default()
        };
        assert!(cfg.binary_matcher().is_err());
    }
}
