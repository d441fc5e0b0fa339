//! Diff drivers: tokenise datasources, run the LCS, and assemble typed
//! chunk lists for two-way diffs and three-way merges.

use crate::datasource::{DiffBaton, Token};
use crate::error::Result;
use crate::lcs::{self, CommonBlock};
use crate::options::DiffOptions;
use std::collections::HashMap;
use std::path::Path;

/// A half-open run of lines, 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineRange {
    pub start: u64,
    pub len: u64,
}

impl LineRange {
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// What one chunk of a diff says about the three sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// All sources agree.
    Common,
    /// Only the modified source changed.
    DiffModified,
    /// Only the latest source changed (three-way only).
    DiffLatest,
    /// Modified and latest made the identical change (three-way only).
    DiffCommon,
    /// Modified and latest made different overlapping changes.
    Conflict,
}

/// One chunk of a diff. Two-way diffs only use the original and modified
/// ranges and the Common/DiffModified kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffChunk {
    pub kind: ChunkKind,
    pub original: LineRange,
    pub modified: LineRange,
    pub latest: LineRange,
    /// For conflicts: the diff between the two conflicting sides, used by
    /// the resolved display style.
    pub resolved: Option<Vec<DiffChunk>>,
}

impl DiffChunk {
    fn new(kind: ChunkKind, original: LineRange, modified: LineRange, latest: LineRange) -> Self {
        Self {
            kind,
            original,
            modified,
            latest,
            resolved: None,
        }
    }
}

/// Result of a diff run: an ordered list of chunks covering the inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    pub chunks: Vec<DiffChunk>,
}

impl Diff {
    /// True if anything differs at all.
    pub fn has_diffs(&self) -> bool {
        self.chunks.iter().any(|c| c.kind != ChunkKind::Common)
    }

    /// True if a three-way diff contains conflicts.
    pub fn has_conflicts(&self) -> bool {
        self.chunks.iter().any(|c| c.kind == ChunkKind::Conflict)
    }
}

/// Tokenise each datasource into a sequence of token classes: equal lines
/// (after normalisation) get equal class ids across all sources.
fn tokenize_sources(baton: &mut DiffBaton, count: usize) -> Result<Vec<Vec<u32>>> {
    // Candidate classes bucketed by (normalised length, adler32).
    let mut buckets: HashMap<(u64, u32), Vec<(u32, Token)>> = HashMap::new();
    let mut next_class = 0u32;
    let mut sequences = Vec::with_capacity(count);

    for source in 0..count {
        let mut seq = Vec::new();
        while let Some(token) = baton.next_token(source)? {
            let bucket = buckets
                .entry((token.length, token.hash))
                .or_default();
            let mut class = None;
            for (id, representative) in bucket.iter() {
                if baton.token_compare(representative, &token)? {
                    class = Some(*id);
                    break;
                }
            }
            match class {
                Some(id) => {
                    seq.push(id);
                    baton.discard_token(token);
                }
                None => {
                    let id = next_class;
                    next_class += 1;
                    bucket.push((id, token));
                    seq.push(id);
                }
            }
        }
        sequences.push(seq);
    }
    Ok(sequences)
}

/// Changed region of a two-way diff, in token coordinates.
#[derive(Debug, Clone, Copy)]
struct Edit {
    orig_start: usize,
    orig_end: usize,
    other_start: usize,
    other_end: usize,
}

/// Invert a list of common blocks into the changed regions between them.
fn edits_from_blocks(
    blocks: &[CommonBlock],
    orig_len: usize,
    other_len: usize,
) -> Vec<Edit> {
    let mut edits = Vec::new();
    let mut a = 0;
    let mut b = 0;
    for block in blocks {
        if block.a > a || block.b > b {
            edits.push(Edit {
                orig_start: a,
                orig_end: block.a,
                other_start: b,
                other_end: block.b,
            });
        }
        a = block.a + block.len;
        b = block.b + block.len;
    }
    if a < orig_len || b < other_len {
        edits.push(Edit {
            orig_start: a,
            orig_end: orig_len,
            other_start: b,
            other_end: other_len,
        });
    }
    edits
}

impl Edit {
    /// Net growth of the "other" side relative to the original.
    fn delta(&self) -> i64 {
        (self.other_end - self.other_start) as i64 - (self.orig_end - self.orig_start) as i64
    }
}

/// Shift every chunk (and nested resolved chunks) by the elided prefix.
fn shift_chunks(chunks: &mut [DiffChunk], prefix: u64) {
    for chunk in chunks {
        chunk.original.start += prefix;
        chunk.modified.start += prefix;
        chunk.latest.start += prefix;
        if let Some(resolved) = &mut chunk.resolved {
            shift_chunks(resolved, prefix);
        }
    }
}

/// Wrap token-space chunks with the elided common prefix and suffix.
fn add_elided_common(
    mut chunks: Vec<DiffChunk>,
    prefix: u64,
    suffix: u64,
    ends: [u64; 3],
) -> Vec<DiffChunk> {
    shift_chunks(&mut chunks, prefix);

    let mut out = Vec::with_capacity(chunks.len() + 2);
    if prefix > 0 {
        out.push(DiffChunk::new(
            ChunkKind::Common,
            LineRange::new(0, prefix),
            LineRange::new(0, prefix),
            LineRange::new(0, prefix),
        ));
    }
    out.extend(chunks);
    if suffix > 0 {
        out.push(DiffChunk::new(
            ChunkKind::Common,
            LineRange::new(prefix + ends[0], suffix),
            LineRange::new(prefix + ends[1], suffix),
            LineRange::new(prefix + ends[2], suffix),
        ));
    }

    // Merge adjacent common chunks into maximal runs.
    let mut merged: Vec<DiffChunk> = Vec::with_capacity(out.len());
    for chunk in out {
        match merged.last_mut() {
            Some(last)
                if last.kind == ChunkKind::Common && chunk.kind == ChunkKind::Common =>
            {
                last.original.len += chunk.original.len;
                last.modified.len += chunk.modified.len;
                last.latest.len += chunk.latest.len;
            }
            _ => merged.push(chunk),
        }
    }
    merged
}

/// Two-way diff of two files.
pub fn diff_files(
    original: impl AsRef<Path>,
    modified: impl AsRef<Path>,
    options: &DiffOptions,
) -> Result<Diff> {
    let mut baton = DiffBaton::open(&[original.as_ref(), modified.as_ref()], options)?;
    let sequences = tokenize_sources(&mut baton, 2)?;
    let (a, b) = (&sequences[0], &sequences[1]);

    let blocks = lcs::common_blocks(a, b);
    let mut chunks = Vec::new();
    let mut pa = 0usize;
    let mut pb = 0usize;
    for block in &blocks {
        if block.a > pa || block.b > pb {
            chunks.push(DiffChunk::new(
                ChunkKind::DiffModified,
                LineRange::new(pa as u64, (block.a - pa) as u64),
                LineRange::new(pb as u64, (block.b - pb) as u64),
                LineRange::default(),
            ));
        }
        chunks.push(DiffChunk::new(
            ChunkKind::Common,
            LineRange::new(block.a as u64, block.len as u64),
            LineRange::new(block.b as u64, block.len as u64),
            LineRange::default(),
        ));
        pa = block.a + block.len;
        pb = block.b + block.len;
    }
    if pa < a.len() || pb < b.len() {
        chunks.push(DiffChunk::new(
            ChunkKind::DiffModified,
            LineRange::new(pa as u64, (a.len() - pa) as u64),
            LineRange::new(pb as u64, (b.len() - pb) as u64),
            LineRange::default(),
        ));
    }

    let chunks = add_elided_common(
        chunks,
        baton.prefix_lines(),
        baton.suffix_lines(),
        [a.len() as u64, b.len() as u64, 0],
    );
    Ok(Diff { chunks })
}

/// Build the inner diff between the two sides of a conflict, for the
/// resolved display style. Ranges are absolute modified/latest lines.
fn resolve_conflict(
    modified_tokens: &[u32],
    latest_tokens: &[u32],
    m_range: (usize, usize),
    l_range: (usize, usize),
) -> Vec<DiffChunk> {
    let m = &modified_tokens[m_range.0..m_range.1];
    let l = &latest_tokens[l_range.0..l_range.1];
    let blocks = lcs::common_blocks(m, l);

    let mut chunks = Vec::new();
    let mut pm = 0usize;
    let mut pl = 0usize;
    let push = |chunks: &mut Vec<DiffChunk>, kind, ms: usize, ml: usize, ls: usize, ll: usize| {
        chunks.push(DiffChunk::new(
            kind,
            LineRange::new((m_range.0 + ms) as u64, ml as u64),
            LineRange::new((m_range.0 + ms) as u64, ml as u64),
            LineRange::new((l_range.0 + ls) as u64, ll as u64),
        ));
    };
    for block in &blocks {
        if block.a > pm {
            push(&mut chunks, ChunkKind::DiffModified, pm, block.a - pm, pl, 0);
        }
        if block.b > pl {
            push(&mut chunks, ChunkKind::DiffLatest, pm, 0, pl, block.b - pl);
        }
        push(&mut chunks, ChunkKind::Common, block.a, block.len, block.b, block.len);
        pm = block.a + block.len;
        pl = block.b + block.len;
    }
    if pm < m.len() {
        push(&mut chunks, ChunkKind::DiffModified, pm, m.len() - pm, pl, 0);
    }
    if pl < l.len() {
        push(&mut chunks, ChunkKind::DiffLatest, pm, 0, pl, l.len() - pl);
    }
    chunks
}

/// Three-way diff of original, modified and latest.
pub fn diff3_files(
    original: impl AsRef<Path>,
    modified: impl AsRef<Path>,
    latest: impl AsRef<Path>,
    options: &DiffOptions,
) -> Result<Diff> {
    let mut baton = DiffBaton::open(
        &[original.as_ref(), modified.as_ref(), latest.as_ref()],
        options,
    )?;
    let sequences = tokenize_sources(&mut baton, 3)?;
    let (orig, modified_seq, latest_seq) = (&sequences[0], &sequences[1], &sequences[2]);

    let mod_blocks = lcs::common_blocks(orig, modified_seq);
    let lat_blocks = lcs::common_blocks(orig, latest_seq);
    let mod_edits = edits_from_blocks(&mod_blocks, orig.len(), modified_seq.len());
    let lat_edits = edits_from_blocks(&lat_blocks, orig.len(), latest_seq.len());

    // Running offsets between original and modified/latest coordinates,
    // valid in the common stretch before the current position.
    let mut mod_delta = 0i64;
    let mut lat_delta = 0i64;

    let mut chunks = Vec::new();
    let mut orig_pos = 0usize;
    let (mut i, mut j) = (0usize, 0usize);

    let common_chunk = |orig_lo: usize, orig_hi: usize, mod_delta: i64, lat_delta: i64| {
        let len = (orig_hi - orig_lo) as u64;
        DiffChunk::new(
            ChunkKind::Common,
            LineRange::new(orig_lo as u64, len),
            LineRange::new((orig_lo as i64 + mod_delta) as u64, len),
            LineRange::new((orig_lo as i64 + lat_delta) as u64, len),
        )
    };

    while i < mod_edits.len() || j < lat_edits.len() {
        // Pull the next changed region, expanding over edits from either
        // side that overlap or touch it.
        let (lo, mut hi);
        let (mut used_mod, mut used_lat) = (false, false);
        let mut region_mod_delta = 0i64;
        let mut region_lat_delta = 0i64;
        if j >= lat_edits.len()
            || (i < mod_edits.len() && mod_edits[i].orig_start <= lat_edits[j].orig_start)
        {
            lo = mod_edits[i].orig_start;
            hi = mod_edits[i].orig_end;
            region_mod_delta += mod_edits[i].delta();
            used_mod = true;
            i += 1;
        } else {
            lo = lat_edits[j].orig_start;
            hi = lat_edits[j].orig_end;
            region_lat_delta += lat_edits[j].delta();
            used_lat = true;
            j += 1;
        }
        loop {
            let mut extended = false;
            while i < mod_edits.len() && mod_edits[i].orig_start <= hi {
                hi = hi.max(mod_edits[i].orig_end);
                region_mod_delta += mod_edits[i].delta();
                used_mod = true;
                extended = true;
                i += 1;
            }
            while j < lat_edits.len() && lat_edits[j].orig_start <= hi {
                hi = hi.max(lat_edits[j].orig_end);
                region_lat_delta += lat_edits[j].delta();
                used_lat = true;
                extended = true;
                j += 1;
            }
            if !extended {
                break;
            }
        }

        if lo > orig_pos {
            chunks.push(common_chunk(orig_pos, lo, mod_delta, lat_delta));
        }

        let m_lo = (lo as i64 + mod_delta) as usize;
        let l_lo = (lo as i64 + lat_delta) as usize;
        mod_delta += region_mod_delta;
        lat_delta += region_lat_delta;
        let m_hi = (hi as i64 + mod_delta) as usize;
        let l_hi = (hi as i64 + lat_delta) as usize;

        let kind = match (used_mod, used_lat) {
            (true, false) => ChunkKind::DiffModified,
            (false, true) => ChunkKind::DiffLatest,
            _ => {
                if modified_seq[m_lo..m_hi] == latest_seq[l_lo..l_hi] {
                    ChunkKind::DiffCommon
                } else {
                    ChunkKind::Conflict
                }
            }
        };

        let mut chunk = DiffChunk::new(
            kind,
            LineRange::new(lo as u64, (hi - lo) as u64),
            LineRange::new(m_lo as u64, (m_hi - m_lo) as u64),
            LineRange::new(l_lo as u64, (l_hi - l_lo) as u64),
        );
        if kind == ChunkKind::Conflict {
            chunk.resolved = Some(resolve_conflict(
                modified_seq,
                latest_seq,
                (m_lo, m_hi),
                (l_lo, l_hi),
            ));
        }
        chunks.push(chunk);
        orig_pos = hi;
    }

    if orig_pos < orig.len() {
        chunks.push(common_chunk(orig_pos, orig.len(), mod_delta, lat_delta));
    }

    let chunks = add_elided_common(
        chunks,
        baton.prefix_lines(),
        baton.suffix_lines(),
        [
            orig.len() as u64,
            modified_seq.len() as u64,
            latest_seq.len() as u64,
        ],
    );
    Ok(Diff { chunks })
}
