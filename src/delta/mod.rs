//! Binary delta codec for artifact storage.
//!
//! A delta is a byte-level reproduction format: a short header carrying the
//! source and target lengths as varints, followed by a sequence of
//! instructions, each either a *copy* (offset + length from the source) or a
//! *literal* (length + bytes). [`output_size`] reads the header cheaply
//! without decoding the instruction stream; [`decode::apply`] fails unless
//! the reconstructed bytes are exactly the length the header promised.

pub mod decode;
pub mod encode;
pub mod errors;
mod varint;

pub use decode::{apply, output_size};
pub use encode::create;
