//! Delta decoder: rebuilds target bytes from a source buffer and the
//! instruction stream produced by [`super::encode`].

use super::errors::DeltaError;
use super::varint::read_size;

const COPY_FLAG: u8 = 0x80;
const COPY_ZERO_SIZE: usize = 0x10000;

/// Read the promised output length from a delta's header without decoding
/// the instruction stream. Cheap; used to record phantom-delta sizes.
pub fn output_size(delta: &[u8]) -> Result<usize, DeltaError> {
    let mut pos = 0;
    let _src_size = read_size(delta, &mut pos)?;
    read_size(delta, &mut pos)
}

/// Apply `delta` to `src`, returning the reconstructed target bytes.
///
/// Fails if the source length does not match the header, an instruction is
/// malformed, a copy reaches outside the source, or the reconstructed
/// stream is not byte-exact to what the header promised.
pub fn apply(src: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0;
    let src_size = read_size(delta, &mut pos)?;
    if src.len() != src_size {
        return Err(DeltaError::SourceSizeMismatch {
            expected: src_size,
            actual: src.len(),
        });
    }
    let out_size = read_size(delta, &mut pos)?;
    let mut out = Vec::with_capacity(out_size);

    while pos < delta.len() {
        let instruction = delta[pos];
        pos += 1;
        if instruction & COPY_FLAG == 0 {
            // Literal: the instruction byte is the byte count; zero-length
            // literals are disallowed so the stream stays canonical.
            let len = instruction as usize;
            if len == 0 {
                return Err(DeltaError::BadInstruction("zero-length literal".into()));
            }
            let end = pos + len;
            let bytes = delta.get(pos..end).ok_or(DeltaError::Truncated)?;
            out.extend_from_slice(bytes);
            pos = end;
        } else {
            let mut offset = 0usize;
            for i in 0..4 {
                if instruction & (1 << i) != 0 {
                    let byte = *delta.get(pos).ok_or(DeltaError::Truncated)?;
                    pos += 1;
                    offset |= (byte as usize) << (i * 8);
                }
            }
            let mut len = 0usize;
            for i in 0..3 {
                if instruction & (1 << (i + 4)) != 0 {
                    let byte = *delta.get(pos).ok_or(DeltaError::Truncated)?;
                    pos += 1;
                    len |= (byte as usize) << (i * 8);
                }
            }
            if len == 0 {
                len = COPY_ZERO_SIZE;
            }
            let bytes = src
                .get(offset..offset + len)
                .ok_or(DeltaError::CopyOutOfRange {
                    offset,
                    len,
                    src_len: src.len(),
                })?;
            out.extend_from_slice(bytes);
        }
    }

    if out.len() != out_size {
        return Err(DeltaError::OutputSizeMismatch {
            expected: out_size,
            actual: out.len(),
        });
    }
    Ok(out)
}
