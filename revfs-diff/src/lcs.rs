//! Token-sequence LCS.
//!
//! A linear-space Myers bidirectional search: find a point on a minimal
//! edit path, recurse on both halves, trimming common prefixes and
//! suffixes at every level. Output is the ordered list of common runs;
//! everything between them is changed.

/// A run of identical tokens present in both sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonBlock {
    pub a: usize,
    pub b: usize,
    pub len: usize,
}

/// Compute the common runs between two token-class sequences.
pub fn common_blocks(a: &[u32], b: &[u32]) -> Vec<CommonBlock> {
    let mut out = Vec::new();
    diff_rec(a, b, 0, 0, &mut out);

    // Merge adjacent runs so callers see maximal blocks.
    let mut merged: Vec<CommonBlock> = Vec::with_capacity(out.len());
    for block in out {
        match merged.last_mut() {
            Some(last)
                if last.a + last.len == block.a && last.b + last.len == block.b =>
            {
                last.len += block.len;
            }
            _ => merged.push(block),
        }
    }
    merged
}

fn diff_rec(a: &[u32], b: &[u32], a_off: usize, b_off: usize, out: &mut Vec<CommonBlock>) {
    // Trim the common prefix.
    let mut prefix = 0;
    while prefix < a.len() && prefix < b.len() && a[prefix] == b[prefix] {
        prefix += 1;
    }
    if prefix > 0 {
        out.push(CommonBlock {
            a: a_off,
            b: b_off,
            len: prefix,
        });
    }
    let (a, b) = (&a[prefix..], &b[prefix..]);
    let (a_off, b_off) = (a_off + prefix, b_off + prefix);

    // Trim the common suffix; emitted after the middle is resolved.
    let mut suffix = 0;
    while suffix < a.len()
        && suffix < b.len()
        && a[a.len() - 1 - suffix] == b[b.len() - 1 - suffix]
    {
        suffix += 1;
    }
    let suffix_block = CommonBlock {
        a: a_off + a.len() - suffix,
        b: b_off + b.len() - suffix,
        len: suffix,
    };
    let (a, b) = (&a[..a.len() - suffix], &b[..b.len() - suffix]);

    if !a.is_empty() && !b.is_empty() {
        let (x, y) = split(a, b);
        if (x == 0 && y == 0) || (x == a.len() && y == b.len()) {
            // Degenerate split: report the middle as a plain replacement.
        } else {
            diff_rec(&a[..x], &b[..y], a_off, b_off, out);
            diff_rec(&a[x..], &b[y..], a_off + x, b_off + y, out);
        }
    }

    if suffix_block.len > 0 {
        out.push(suffix_block);
    }
}

/// Find a point (x, y) lying on a minimal edit path between A and B.
/// Both inputs are non-empty and share no common prefix or suffix.
fn split(a: &[u32], b: &[u32]) -> (usize, usize) {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let dmin = -m;
    let dmax = n;
    let fmid = 0isize;
    let bmid = n - m;
    let odd = (n - m) % 2 != 0;
    let shift = m + 1;
    let idx = |d: isize| (d + shift) as usize;

    let mut kvdf = vec![-1isize; (n + m + 3) as usize];
    let mut kvdb = vec![isize::MAX / 2; (n + m + 3) as usize];
    kvdf[idx(fmid)] = 0;
    kvdb[idx(bmid)] = n;

    let (mut fmin, mut fmax) = (fmid, fmid);
    let (mut bmin, mut bmax) = (bmid, bmid);

    loop {
        // Forward sweep.
        if fmin > dmin {
            fmin -= 1;
            kvdf[idx(fmin - 1)] = -1;
        } else {
            fmin += 1;
        }
        if fmax < dmax {
            fmax += 1;
            kvdf[idx(fmax + 1)] = -1;
        } else {
            fmax -= 1;
        }
        let mut d = fmax;
        while d >= fmin {
            let mut x = if kvdf[idx(d - 1)] >= kvdf[idx(d + 1)] {
                kvdf[idx(d - 1)] + 1
            } else {
                kvdf[idx(d + 1)]
            };
            let mut y = x - d;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            kvdf[idx(d)] = x;
            if odd && bmin <= d && d <= bmax && kvdb[idx(d)] <= x {
                return (x as usize, y as usize);
            }
            d -= 2;
        }

        // Backward sweep.
        if bmin > dmin {
            bmin -= 1;
            kvdb[idx(bmin - 1)] = isize::MAX / 2;
        } else {
            bmin += 1;
        }
        if bmax < dmax {
            bmax += 1;
            kvdb[idx(bmax + 1)] = isize::MAX / 2;
        } else {
            bmax -= 1;
        }
        let mut d = bmax;
        while d >= bmin {
            let mut x = if kvdb[idx(d - 1)] < kvdb[idx(d + 1)] {
                kvdb[idx(d - 1)]
            } else {
                kvdb[idx(d + 1)] - 1
            };
            let mut y = x - d;
            while x > 0 && y > 0 && a[(x - 1) as usize] == b[(y - 1) as usize] {
                x -= 1;
                y -= 1;
            }
            kvdb[idx(d)] = x;
            if !odd && fmin <= d && d <= fmax && x <= kvdf[idx(d)] {
                return (x as usize, y as usize);
            }
            d -= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total_common(a: &[u32], b: &[u32]) -> usize {
        let blocks = common_blocks(a, b);
        // Blocks reference equal tokens and advance monotonically.
        let mut last_a = 0;
        let mut last_b = 0;
        for block in &blocks {
            assert!(block.a >= last_a && block.b >= last_b);
            for i in 0..block.len {
                assert_eq!(a[block.a + i], b[block.b + i]);
            }
            last_a = block.a + block.len;
            last_b = block.b + block.len;
        }
        blocks.iter().map(|c| c.len).sum()
    }

    #[test]
    fn test_identical() {
        let a = [1, 2, 3, 4];
        assert_eq!(common_blocks(&a, &a), vec![CommonBlock { a: 0, b: 0, len: 4 }]);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(common_blocks(&[], &[1, 2]).is_empty());
        assert!(common_blocks(&[1, 2], &[]).is_empty());
        assert!(common_blocks(&[], &[]).is_empty());
    }

    #[test]
    fn test_completely_different() {
        assert_eq!(total_common(&[1, 2, 3], &[4, 5, 6]), 0);
    }

    #[test]
    fn test_single_line_change_in_middle() {
        // a b c / a B c
        let blocks = common_blocks(&[1, 2, 3], &[1, 9, 3]);
        assert_eq!(
            blocks,
            vec![
                CommonBlock { a: 0, b: 0, len: 1 },
                CommonBlock { a: 2, b: 2, len: 1 },
            ]
        );
    }

    #[test]
    fn test_insertion() {
        let blocks = common_blocks(&[1, 2, 3], &[1, 2, 9, 9, 3]);
        assert_eq!(total_common(&[1, 2, 3], &[1, 2, 9, 9, 3]), 3);
        assert_eq!(blocks.first().unwrap().a, 0);
    }

    #[test]
    fn test_deletion() {
        assert_eq!(total_common(&[1, 2, 3, 4, 5], &[1, 4, 5]), 3);
    }

    #[test]
    fn test_classic_myers_example() {
        // abcabba vs cbabac: LCS length 4.
        let a = [1, 2, 3, 1, 2, 2, 1];
        let b = [3, 2, 1, 2, 1, 3];
        assert_eq!(total_common(&a, &b), 4);
    }

    #[test]
    fn test_repeated_tokens() {
        let a = [7, 7, 7, 7];
        let b = [7, 7];
        assert_eq!(total_common(&a, &b), 2);
    }

    #[test]
    fn test_interleaved() {
        let a: Vec<u32> = (0..200).collect();
        let b: Vec<u32> = (0..200).filter(|x| x % 3 != 0).collect();
        assert_eq!(total_common(&a, &b) as u32, b.len() as u32);
    }
}
