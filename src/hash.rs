//! Hash utilities for repository artifacts with selectable algorithms
//! (SHA-1 and SHA3-256).
//!
//! An artifact's identity is the hash of its uncompressed content. Two hash
//! families coexist in one repository: the 40-hex SHA-1 flavour and the
//! 64-hex SHA3-256 flavour. Which flavour is used for *new* artifacts is
//! governed by the repository's [`HashPolicy`]; existing artifacts keep
//! whatever flavour they were stored under.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::Digest;

/// Supported hash algorithms for artifact identities (selector only, no
/// data attached).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
pub enum HashKind {
    #[default]
    Sha1,
    Sha3,
}

impl HashKind {
    /// Byte length of the hash output.
    pub const fn size(&self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha3 => 32,
        }
    }

    /// Hex string length of the hash output.
    pub const fn hex_len(&self) -> usize {
        match self {
            HashKind::Sha1 => 40,
            HashKind::Sha3 => 64,
        }
    }

    /// Lowercase name of the hash algorithm.
    pub const fn as_str(&self) -> &'static str {
        match self {
            HashKind::Sha1 => "sha1",
            HashKind::Sha3 => "sha3",
        }
    }

    /// Map a hex-string length back to the hash kind it must belong to.
    pub const fn from_hex_len(n: usize) -> Option<HashKind> {
        match n {
            40 => Some(HashKind::Sha1),
            64 => Some(HashKind::Sha3),
            _ => None,
        }
    }
}

impl Display for HashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashKind::Sha1),
            "sha3" => Ok(HashKind::Sha3),
            _ => Err("invalid hash kind".to_string()),
        }
    }
}

/// Policy that selects the flavour used when hashing incoming content.
///
/// `Auto` starts at SHA-1 and upgrades permanently to SHA3 the first time a
/// 64-hex artifact is accepted into the repository; `Sha1`/`Sha3` pin the
/// flavour. The upgrade is monotone: a repository never goes back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum HashPolicy {
    #[default]
    Auto,
    Sha1,
    Sha3,
}

impl HashPolicy {
    /// The flavour this policy currently prefers for new artifacts.
    pub const fn current_kind(&self) -> HashKind {
        match self {
            HashPolicy::Sha1 => HashKind::Sha1,
            HashPolicy::Auto => HashKind::Sha1,
            HashPolicy::Sha3 => HashKind::Sha3,
        }
    }

    /// The fallback flavour tried when the preferred one collides.
    pub const fn alternate_kind(&self) -> HashKind {
        match self.current_kind() {
            HashKind::Sha1 => HashKind::Sha3,
            HashKind::Sha3 => HashKind::Sha1,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            HashPolicy::Auto => "auto",
            HashPolicy::Sha1 => "sha1",
            HashPolicy::Sha3 => "sha3",
        }
    }
}

impl FromStr for HashPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(HashPolicy::Auto),
            "sha1" => Ok(HashPolicy::Sha1),
            "sha3" => Ok(HashPolicy::Sha3),
            _ => Err("invalid hash policy".to_string()),
        }
    }
}

/// Concrete artifact identity carrying the digest bytes for the selected
/// algorithm.
///
/// Supports conversion to/from lowercase hex strings and raw byte slices.
/// The `Ord` impl orders by flavour first, then bytes, which keeps mixed
/// repositories deterministic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactHash {
    Sha1([u8; 20]),
    Sha3([u8; 32]),
}

impl Display for ArtifactHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_ref()))
    }
}

impl AsRef<[u8]> for ArtifactHash {
    fn as_ref(&self) -> &[u8] {
        match self {
            ArtifactHash::Sha1(bytes) => bytes.as_slice(),
            ArtifactHash::Sha3(bytes) => bytes.as_slice(),
        }
    }
}

/// Parse hex (40 for SHA-1, 64 for SHA3-256) into an `ArtifactHash`.
impl FromStr for ArtifactHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        match bytes.len() {
            20 => {
                let mut h = [0u8; 20];
                h.copy_from_slice(&bytes);
                Ok(ArtifactHash::Sha1(h))
            }
            32 => {
                let mut h = [0u8; 32];
                h.copy_from_slice(&bytes);
                Ok(ArtifactHash::Sha3(h))
            }
            _ => Err("invalid hash length".to_string()),
        }
    }
}

impl ArtifactHash {
    /// Compute the hash of `data` using the given flavour.
    pub fn compute(kind: HashKind, data: &[u8]) -> ArtifactHash {
        match kind {
            HashKind::Sha1 => {
                let d = sha1::Sha1::digest(data);
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(d.as_ref());
                ArtifactHash::Sha1(bytes)
            }
            HashKind::Sha3 => {
                let d = sha3::Sha3_256::digest(data);
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(d.as_ref());
                ArtifactHash::Sha3(bytes)
            }
        }
    }

    /// Return the hash kind for this value.
    pub fn kind(&self) -> HashKind {
        match self {
            ArtifactHash::Sha1(_) => HashKind::Sha1,
            ArtifactHash::Sha3(_) => HashKind::Sha3,
        }
    }

    /// Lowercase hex form, the canonical textual identity.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_ref())
    }
}

/// True if `z` consists only of lowercase-acceptable hex digits.
///
/// Card grammar hashes must be hex; tag names must *not* look like one.
pub fn is_hex(z: &str) -> bool {
    !z.is_empty() && z.bytes().all(|c| c.is_ascii_hexdigit())
}

/// True if `z` is hex text whose length matches one of the accepted hash
/// families.
pub fn looks_like_hash(z: &str) -> bool {
    HashKind::from_hex_len(z.len()).is_some() && is_hex(z)
}

/// Verify that `content` hashes to the textual identity `uuid` under the
/// flavour implied by the identity's length.
pub fn verify_hash(content: &[u8], uuid: &str) -> bool {
    match HashKind::from_hex_len(uuid.len()) {
        Some(kind) => ArtifactHash::compute(kind, content).to_hex() == uuid,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hashing "Hello, world!" with SHA-1 should match the known value.
    #[test]
    fn test_sha1_compute() {
        let data = "Hello, world!".as_bytes();
        let h = ArtifactHash::compute(HashKind::Sha1, data);
        assert_eq!(h.to_hex(), "943a702d06f34599aee1f8da8ef9f7296031d699");
        assert_eq!(h.kind(), HashKind::Sha1);
    }

    /// Hashing "abc" with SHA3-256 should match the known value.
    #[test]
    fn test_sha3_compute() {
        let h = ArtifactHash::compute(HashKind::Sha3, b"abc");
        assert_eq!(
            h.to_hex(),
            "3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532"
        );
        assert_eq!(h.kind(), HashKind::Sha3);
    }

    /// Hex round-trips for both flavours.
    #[test]
    fn test_from_str_round_trip() {
        let z1 = "943a702d06f34599aee1f8da8ef9f7296031d699";
        assert_eq!(ArtifactHash::from_str(z1).unwrap().to_hex(), z1);
        let z3 = "3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532";
        assert_eq!(ArtifactHash::from_str(z3).unwrap().to_hex(), z3);
        assert!(ArtifactHash::from_str("abcd").is_err());
    }

    /// Auto policy prefers SHA-1 and falls back to SHA3.
    #[test]
    fn test_policy_kinds() {
        assert_eq!(HashPolicy::Auto.current_kind(), HashKind::Sha1);
        assert_eq!(HashPolicy::Auto.alternate_kind(), HashKind::Sha3);
        assert_eq!(HashPolicy::Sha3.current_kind(), HashKind::Sha3);
        assert_eq!(HashPolicy::Sha3.alternate_kind(), HashKind::Sha1);
    }

    #[test]
    fn test_looks_like_hash() {
        assert!(looks_like_hash(
            "943a702d06f34599aee1f8da8ef9f7296031d699"
        ));
        assert!(!looks_like_hash("943a702d"));
        assert!(!looks_like_hash(
            "zzza702d06f34599aee1f8da8ef9f7296031d699"
        ));
    }

    #[test]
    fn test_verify_hash() {
        let content = b"Hello, world!";
        assert!(verify_hash(
            content,
            "943a702d06f34599aee1f8da8ef9f7296031d699"
        ));
        assert!(!verify_hash(
            b"Hello, world?",
            "943a702d06f34599aee1f8da8ef9f7296031d699"
        ));
    }
}
