//! Error variants for the delta encoder/decoder so callers can surface
//! friendly failures without panicking on corrupt streams.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeltaError {
    /// The stream ended before the instruction it promised.
    #[error("delta stream is truncated")]
    Truncated,

    /// The source buffer does not have the length the header recorded.
    #[error("delta source length mismatch: header says {expected}, got {actual}")]
    SourceSizeMismatch { expected: usize, actual: usize },

    /// An instruction byte that is neither a valid copy nor a literal.
    #[error("invalid delta instruction: {0}")]
    BadInstruction(String),

    /// A copy instruction reaching outside the source buffer.
    #[error("delta copy out of range: offset {offset} len {len} in source of {src_len}")]
    CopyOutOfRange {
        offset: usize,
        len: usize,
        src_len: usize,
    },

    /// The reconstructed stream is not byte-exact to what the header
    /// promised.
    #[error("delta output length mismatch: header says {expected}, produced {actual}")]
    OutputSizeMismatch { expected: usize, actual: usize },
}
