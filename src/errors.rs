//! Error types for the chert crate.
//!
//! This module defines a unified error enumeration used across artifact
//! storage, control-artifact parsing, crosslinking, merging, patch
//! handling and repository reconstruction. It integrates with `thiserror`
//! to provide rich `Display` implementations and error source chaining
//! where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Fatal variants abort the enclosing transaction; content conflicts are
//!   not errors and are reported through [`crate::merge::MergeStats`].

use thiserror::Error;

use crate::delta::errors::DeltaError;

#[derive(Error, Debug)]
/// Unified error enumeration for the chert library.
///
/// - Used across the blob store, parser, crosslinker, merge engine, patch
///   container and rebuild operations.
/// - Implements `std::error::Error` via `thiserror`.
pub enum RepoError {
    /// Control-artifact text that violates the card grammar.
    #[error("manifest syntax error on line {line}: {detail}")]
    ManifestSyntax { line: usize, detail: String },

    /// A hash string that is not hex of an accepted length.
    #[error("`{0}` is not a valid artifact hash")]
    InvalidHash(String),

    /// A delta chain that loops back on itself.
    #[error("delta loop in repository involving rid {0}")]
    DeltaLoop(i64),

    /// Corrupt delta stream or a delta that does not reproduce its
    /// promised output.
    #[error(transparent)]
    Delta(#[from] DeltaError),

    /// A hash was expected to resolve but no artifact carries it.
    #[error("cannot find artifact {0}")]
    MissingArtifact(String),

    /// Content needed by an operation is phantom and `force-missing` was
    /// not given.
    #[error("missing content for rid {0}")]
    MissingContent(i64),

    /// The artifact is shunned and will not be stored.
    #[error("artifact {0} is shunned")]
    Shunned(String),

    /// A structural invariant of the store failed (public artifact delta'd
    /// against a private one, rename swap of more than two files, ...).
    #[error("integrity error: {0}")]
    Integrity(String),

    /// A patch database that fails `quick_check` or has the wrong shape.
    #[error("`{0}` is not a well-formed patch file")]
    InvalidPatch(String),

    /// The working copy is not in a state the operation can run from.
    #[error("checkout error: {0}")]
    Checkout(String),

    /// Invalid setting value.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error from the working copy or an export directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the underlying database.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Generic custom error for miscellaneous failures.
    #[error("{0}")]
    Custom(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RepoError>;
