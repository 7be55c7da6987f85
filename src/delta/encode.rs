//! Delta encoder: runs a byte-level Myers diff between source and target
//! and emits the copy/literal instruction stream described in the module
//! docs.

use diffs::{myers, Diff};

use super::varint::write_size;

/// Longest literal a single data instruction can carry.
const MAX_LITERAL: usize = 0x7f;
/// Flag bit distinguishing copy instructions from literals.
const COPY_FLAG: u8 = 0x80;
/// A copy size of zero encodes this many bytes on the wire.
const COPY_ZERO_SIZE: usize = 0x10000;
/// Largest span one copy instruction can express (3 size bytes).
const MAX_COPY: usize = 0xff_ffff;

/// One planned instruction: copy `len` bytes from `begin` in the source, or
/// insert `len` bytes from `begin` in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Copy { begin: usize, len: usize },
    Literal { begin: usize, len: usize },
}

/// Collects diff callbacks into an instruction plan.
struct Plan<'a> {
    ops: Vec<Op>,
    target: &'a [u8],
}

impl Diff for Plan<'_> {
    type Error = ();

    fn equal(&mut self, old: usize, _new: usize, len: usize) -> Result<(), ()> {
        if let Some(Op::Copy { begin, len: tail }) = self.ops.last_mut() {
            if *begin + *tail == old {
                *tail += len;
                return Ok(());
            }
        }
        self.ops.push(Op::Copy { begin: old, len });
        Ok(())
    }

    fn insert(&mut self, _old: usize, new: usize, len: usize) -> Result<(), ()> {
        if let Some(Op::Literal { begin, len: tail }) = self.ops.last_mut() {
            if *begin + *tail == new {
                *tail += len;
                return Ok(());
            }
        }
        self.ops.push(Op::Literal { begin: new, len });
        Ok(())
    }
}

/// Compute a delta that carries `src` into `target`.
///
/// The result always applies cleanly via [`super::apply`]; it is up to the
/// caller (the store's `deltify`) to decide whether it is small enough to
/// be worth keeping.
pub fn create(src: &[u8], target: &[u8]) -> Vec<u8> {
    let mut plan = Plan {
        ops: Vec::new(),
        target,
    };
    // The byte diff cannot fail; the callbacks are infallible.
    myers::diff(&mut plan, src, 0, src.len(), target, 0, target.len()).unwrap();

    let mut out = Vec::with_capacity(target.len() / 4 + 16);
    write_size(&mut out, src.len());
    write_size(&mut out, target.len());
    for op in &plan.ops {
        match *op {
            Op::Copy { begin, len } => emit_copy(&mut out, begin, len),
            Op::Literal { begin, len } => emit_literal(&mut out, &target[begin..begin + len]),
        }
    }
    out
}

fn emit_copy(out: &mut Vec<u8>, mut offset: usize, mut len: usize) {
    while len > 0 {
        let chunk = len.min(MAX_COPY);
        let at = out.len();
        out.push(COPY_FLAG);
        let mut instruction = COPY_FLAG;

        let mut o = offset;
        for i in 0..4 {
            let b = (o & 0xff) as u8;
            if b != 0 {
                instruction |= 1 << i;
                out.push(b);
            }
            o >>= 8;
        }
        // A zero size byte pattern means COPY_ZERO_SIZE on the wire; spell
        // the size out unless the chunk is exactly that value.
        let mut s = if chunk == COPY_ZERO_SIZE { 0 } else { chunk };
        for i in 0..3 {
            let b = (s & 0xff) as u8;
            if b != 0 {
                instruction |= 1 << (i + 4);
                out.push(b);
            }
            s >>= 8;
        }
        out[at] = instruction;

        offset += chunk;
        len -= chunk;
    }
}

fn emit_literal(out: &mut Vec<u8>, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let chunk = bytes.len().min(MAX_LITERAL);
        out.push(chunk as u8);
        out.extend_from_slice(&bytes[..chunk]);
        bytes = &bytes[chunk..];
    }
}

#[cfg(test)]
mod tests {
    use super::super::{apply, output_size};
    use super::*;

    /// Identical buffers collapse to a single copy instruction.
    #[test]
    fn identical_input_is_one_copy() {
        let data = b"identical content that is long enough to matter".repeat(4);
        let delta = create(&data, &data);
        // two varints + one copy instruction with offset 0
        assert!(delta.len() < 12);
        assert_eq!(apply(&data, &delta).unwrap(), data);
    }

    /// Literals longer than 127 bytes are split across instructions.
    #[test]
    fn long_literal_is_chunked() {
        let src = b"".to_vec();
        let dst = vec![7u8; 1000];
        let delta = create(&src, &dst);
        assert_eq!(output_size(&delta).unwrap(), 1000);
        assert_eq!(apply(&src, &delta).unwrap(), dst);
    }

    /// Copies spanning exactly COPY_ZERO_SIZE bytes survive the zero-size
    /// wire encoding.
    #[test]
    fn copy_zero_size_encoding() {
        let src: Vec<u8> = (0u8..=255).cycle().take(COPY_ZERO_SIZE).collect();
        let dst = src.clone();
        let delta = create(&src, &dst);
        assert_eq!(apply(&src, &delta).unwrap(), dst);
    }
}
