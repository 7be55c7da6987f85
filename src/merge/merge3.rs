//! Three-way line merge: apply the changes pivot→M to a copy of V.
//!
//! Line diffs come from `similar`; overlapping change regions that differ
//! between the two sides are written out with conflict markers and
//! counted. Identical changes on both sides collapse to one.

use similar::{DiffOp, TextDiff};

/// Markers delimiting an unresolved conflict region.
const MARKER_BEGIN: &[u8] = b"<<<<<<< BEGIN MERGE CONFLICT: local copy shown first <<<<<<<<<<<<<<<\n";
const MARKER_PIVOT: &[u8] = b"||||||| COMMON ANCESTOR content follows |||||||||||||||||||||||||||\n";
const MARKER_MERGED: &[u8] = b"======= MERGED IN content follows ==================================\n";
const MARKER_END: &[u8] = b">>>>>>> END MERGE CONFLICT >>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>\n";

/// One side's edit relative to the pivot: replace pivot lines
/// `[p_lo, p_hi)` with the side's lines `[n_lo, n_hi)`.
#[derive(Debug, Clone, Copy)]
struct Change {
    p_lo: usize,
    p_hi: usize,
    n_lo: usize,
    n_hi: usize,
}

fn changes_against(pivot: &[u8], side: &[u8]) -> Vec<Change> {
    let diff = TextDiff::from_lines(pivot, side);
    let mut out = Vec::new();
    for op in diff.ops() {
        match *op {
            DiffOp::Equal { .. } => {}
            DiffOp::Delete {
                old_index, old_len, new_index, ..
            } => out.push(Change {
                p_lo: old_index,
                p_hi: old_index + old_len,
                n_lo: new_index,
                n_hi: new_index,
            }),
            DiffOp::Insert {
                old_index, new_index, new_len,
            } => out.push(Change {
                p_lo: old_index,
                p_hi: old_index,
                n_lo: new_index,
                n_hi: new_index + new_len,
            }),
            DiffOp::Replace {
                old_index, old_len, new_index, new_len,
            } => out.push(Change {
                p_lo: old_index,
                p_hi: old_index + old_len,
                n_lo: new_index,
                n_hi: new_index + new_len,
            }),
        }
    }
    out
}

/// Split into lines, each keeping its terminator. A final line without a
/// newline is kept as-is.
fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, &b) in data.iter().enumerate() {
        if b == b'\n' {
            out.push(&data[start..=i]);
            start = i + 1;
        }
    }
    if start < data.len() {
        out.push(&data[start..]);
    }
    out
}

/// Replay one side's changes inside the pivot region `[lo, hi)`, yielding
/// the side's text for that region.
fn region_text<'a>(
    p_lines: &[&'a [u8]],
    n_lines: &[&'a [u8]],
    changes: &[Change],
    lo: usize,
    hi: usize,
) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut cursor = lo;
    for c in changes {
        if c.p_hi <= lo || c.p_lo >= hi {
            continue;
        }
        out.extend_from_slice(&p_lines[cursor..c.p_lo]);
        out.extend_from_slice(&n_lines[c.n_lo..c.n_hi]);
        cursor = c.p_hi;
    }
    out.extend_from_slice(&p_lines[cursor..hi]);
    out
}

/// Merge `merged`'s changes relative to `pivot` into `local`. Returns the
/// merged bytes and the number of conflict regions written.
pub fn merge_3way(pivot: &[u8], local: &[u8], merged: &[u8]) -> (Vec<u8>, u32) {
    let p_lines = split_lines(pivot);
    let v_lines = split_lines(local);
    let m_lines = split_lines(merged);
    let cv = changes_against(pivot, local);
    let cm = changes_against(pivot, merged);

    let mut out: Vec<u8> = Vec::with_capacity(local.len().max(merged.len()) + 64);
    let mut conflicts = 0u32;
    let mut cursor = 0usize; // pivot line cursor
    let mut i = 0usize;
    let mut j = 0usize;

    let push_lines = |out: &mut Vec<u8>, lines: &[&[u8]]| {
        for l in lines {
            out.extend_from_slice(l);
        }
    };

    while i < cv.len() || j < cm.len() {
        // Decide which change comes next, or whether the heads collide.
        let take_v = match (cv.get(i), cm.get(j)) {
            (Some(v), Some(m)) => {
                if v.p_hi < m.p_lo || (v.p_hi == m.p_lo && v.p_lo < m.p_lo) {
                    Some(true)
                } else if m.p_hi < v.p_lo || (m.p_hi == v.p_lo && m.p_lo < v.p_lo) {
                    Some(false)
                } else {
                    None // overlap
                }
            }
            (Some(_), None) => Some(true),
            (None, Some(_)) => Some(false),
            (None, None) => break,
        };
        match take_v {
            Some(true) => {
                let v = cv[i];
                push_lines(&mut out, &p_lines[cursor..v.p_lo]);
                push_lines(&mut out, &v_lines[v.n_lo..v.n_hi]);
                cursor = v.p_hi;
                i += 1;
            }
            Some(false) => {
                let m = cm[j];
                push_lines(&mut out, &p_lines[cursor..m.p_lo]);
                push_lines(&mut out, &m_lines[m.n_lo..m.n_hi]);
                cursor = m.p_hi;
                j += 1;
            }
            None => {
                // Grow a combined region until both sides' changes separate.
                let mut lo = cv[i].p_lo.min(cm[j].p_lo);
                let mut hi = cv[i].p_hi.max(cm[j].p_hi);
                let (mut i2, mut j2) = (i, j);
                loop {
                    let mut grew = false;
                    while let Some(c) = cv.get(i2) {
                        if c.p_lo <= hi && c.p_hi >= lo {
                            lo = lo.min(c.p_lo);
                            if c.p_hi > hi {
                                hi = c.p_hi;
                                grew = true;
                            }
                            i2 += 1;
                        } else {
                            break;
                        }
                    }
                    while let Some(c) = cm.get(j2) {
                        if c.p_lo <= hi && c.p_hi >= lo {
                            lo = lo.min(c.p_lo);
                            if c.p_hi > hi {
                                hi = c.p_hi;
                                grew = true;
                            }
                            j2 += 1;
                        } else {
                            break;
                        }
                    }
                    if !grew {
                        break;
                    }
                }
                push_lines(&mut out, &p_lines[cursor..lo]);
                let v_text = region_text(&p_lines, &v_lines, &cv[i..i2], lo, hi);
                let m_text = region_text(&p_lines, &m_lines, &cm[j..j2], lo, hi);
                if v_text == m_text {
                    // Both sides made the same change.
                    push_lines(&mut out, &v_text);
                } else {
                    conflicts += 1;
                    out.extend_from_slice(MARKER_BEGIN);
                    push_lines(&mut out, &v_text);
                    out.extend_from_slice(MARKER_PIVOT);
                    push_lines(&mut out, &p_lines[lo..hi]);
                    out.extend_from_slice(MARKER_MERGED);
                    push_lines(&mut out, &m_text);
                    out.extend_from_slice(MARKER_END);
                }
                cursor = hi;
                i = i2;
                j = j2;
            }
        }
    }
    push_lines(&mut out, &p_lines[cursor..]);
    (out, conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Disjoint edits from both sides both land.
    #[test]
    fn non_overlapping_edits_merge() {
        let pivot = b"one\ntwo\nthree\nfour\nfive\n";
        let local = b"ONE\ntwo\nthree\nfour\nfive\n";
        let merged = b"one\ntwo\nthree\nfour\nFIVE\n";
        let (out, n) = merge_3way(pivot, local, merged);
        assert_eq!(out, b"ONE\ntwo\nthree\nfour\nFIVE\n");
        assert_eq!(n, 0);
    }

    /// An edit only on the M side fast-forwards.
    #[test]
    fn one_sided_edit() {
        let pivot = b"a\nb\nc\n";
        let merged = b"a\nB\nc\n";
        let (out, n) = merge_3way(pivot, pivot, merged);
        assert_eq!(out, merged.to_vec());
        assert_eq!(n, 0);
    }

    /// The same edit on both sides collapses without conflict.
    #[test]
    fn identical_edits_collapse() {
        let pivot = b"a\nb\nc\n";
        let both = b"a\nX\nc\n";
        let (out, n) = merge_3way(pivot, both, both);
        assert_eq!(out, both.to_vec());
        assert_eq!(n, 0);
    }

    /// Colliding different edits produce one marked conflict.
    #[test]
    fn conflicting_edits_marked() {
        let pivot = b"a\nb\nc\n";
        let local = b"a\nLOCAL\nc\n";
        let merged = b"a\nMERGED\nc\n";
        let (out, n) = merge_3way(pivot, local, merged);
        assert_eq!(n, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("LOCAL"));
        assert!(text.contains("MERGED"));
        assert!(text.contains("BEGIN MERGE CONFLICT"));
        assert!(text.starts_with("a\n"));
        assert!(text.ends_with("c\n"));
    }

    /// Deletion on one side with no local change applies cleanly.
    #[test]
    fn deletion_applies() {
        let pivot = b"keep\ndrop\nkeep2\n";
        let merged = b"keep\nkeep2\n";
        let (out, n) = merge_3way(pivot, pivot, merged);
        assert_eq!(out, merged.to_vec());
        assert_eq!(n, 0);
    }

    /// Insertions by both sides at different spots both survive.
    #[test]
    fn insertions_both_sides() {
        let pivot = b"m1\nm2\nm3\n";
        let local = b"v0\nm1\nm2\nm3\n";
        let merged = b"m1\nm2\nm3\nm4\n";
        let (out, n) = merge_3way(pivot, local, merged);
        assert_eq!(out, b"v0\nm1\nm2\nm3\nm4\n");
        assert_eq!(n, 0);
    }
}
