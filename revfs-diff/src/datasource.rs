//! Chunked file datasources for the diff engine.
//!
//! Files are paged in 128 KiB chunks behind a logical cursor that can move
//! forward and backward across chunk boundaries (chunk `-1` means "before
//! the beginning"). Before tokenisation, all datasources are scanned in
//! lockstep to elide their identical prefix and suffix; the tokeniser then
//! emits one line per token and stops at the suffix boundary.

use crate::error::{DiffError, Result};
use crate::normalize::{normalize_chunk, NormalizeState};
use crate::options::{DiffOptions, IgnoreSpace};
use adler32::RollingAdler32;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const CHUNK_SHIFT: u32 = 17;
/// Files are read in chunks of 128 KiB.
pub const CHUNK_SIZE: u64 = 1 << CHUNK_SHIFT;

/// Extra identical lines kept out of the elided suffix so trailing hunk
/// context never starves.
const SUFFIX_LINES_TO_KEEP: u32 = 50;

/// Token bytes are re-streamed from disk in windows of this size when they
/// are no longer in memory.
const COMPARE_CHUNK_SIZE: usize = 4096;

fn chunk_to_offset(chunk: i64) -> u64 {
    (chunk as u64) << CHUNK_SHIFT
}

fn offset_to_chunk(offset: u64) -> i64 {
    (offset >> CHUNK_SHIFT) as i64
}

fn offset_in_chunk(offset: u64) -> usize {
    (offset & (CHUNK_SIZE - 1)) as usize
}

/// One line, as produced by the tokeniser.
#[derive(Debug, Clone, Default)]
pub struct Token {
    /// Index of the owning datasource.
    pub(crate) source: usize,
    /// Raw byte offset of the line start.
    pub(crate) offset: u64,
    /// Offset of the normalised token (leading ignored bytes skipped).
    pub(crate) norm_offset: u64,
    /// Length before normalisation.
    pub(crate) raw_length: u64,
    /// Length after normalisation.
    pub(crate) length: u64,
    /// adler32 of the normalised bytes.
    pub(crate) hash: u32,
}

/// Paging state of one open datasource.
struct FileInfo {
    path: PathBuf,
    file: File,
    size: u64,
    /// Current chunk number; -1 means before the beginning of the file.
    chunk: i64,
    buffer: Vec<u8>,
    /// Cursor within `buffer`; `curp == buffer.len()` signals EOF on the
    /// last chunk.
    curp: usize,
    normalize_state: NormalizeState,
    /// Start of the identical suffix, when one was found.
    suffix: Option<(i64, usize)>,
}

impl FileInfo {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let mut info = Self {
            path: path.to_path_buf(),
            file,
            size,
            chunk: 0,
            buffer: Vec::new(),
            curp: 0,
            normalize_state: NormalizeState::default(),
            suffix: None,
        };
        info.read_chunk(0)?;
        Ok(info)
    }

    fn last_chunk(&self) -> i64 {
        offset_to_chunk(self.size)
    }

    /// Load CHUNK into the buffer and leave the cursor untouched.
    fn read_chunk(&mut self, chunk: i64) -> Result<()> {
        let length = if chunk == self.last_chunk() {
            offset_in_chunk(self.size)
        } else {
            CHUNK_SIZE as usize
        };
        self.buffer.resize(length, 0);
        self.file.seek(SeekFrom::Start(chunk_to_offset(chunk)))?;
        self.file.read_exact(&mut self.buffer)?;
        self.chunk = chunk;
        Ok(())
    }

    fn at_eof(&self) -> bool {
        self.curp == self.buffer.len()
    }

    fn current_byte(&self) -> u8 {
        self.buffer[self.curp]
    }
}

/// Advance every cursor by one byte, paging the next chunk as needed.
fn increment_pointers(files: &mut [FileInfo]) -> Result<()> {
    for f in files.iter_mut() {
        if f.chunk == -1 {
            // Point at the first byte again.
            f.chunk = 0;
        } else if f.curp + 1 == f.buffer.len() {
            if f.chunk == f.last_chunk() {
                f.curp += 1; // curp == buffer.len() signals EOF
            } else {
                let next = f.chunk + 1;
                f.read_chunk(next)?;
                f.curp = 0;
            }
        } else {
            f.curp += 1;
        }
    }
    Ok(())
}

/// Move every cursor back one byte, paging the previous chunk as needed.
fn decrement_pointers(files: &mut [FileInfo]) -> Result<()> {
    for f in files.iter_mut() {
        if f.curp == 0 {
            if f.chunk == 0 {
                f.chunk = -1;
            } else {
                let prev = f.chunk - 1;
                f.read_chunk(prev)?;
                f.curp = f.buffer.len() - 1;
            }
        } else {
            f.curp -= 1;
        }
    }
    Ok(())
}

fn is_one_at_bof(files: &[FileInfo]) -> bool {
    files.iter().any(|f| f.chunk == -1)
}

fn is_one_at_eof(files: &[FileInfo]) -> bool {
    files.iter().any(FileInfo::at_eof)
}

fn all_match(files: &[FileInfo]) -> bool {
    let b = files[0].current_byte();
    files[1..].iter().all(|f| f.current_byte() == b)
}

/// Scan all files forward while their bytes match, then back up to the
/// last complete line boundary. Returns (reached_one_eof, prefix_lines).
fn find_identical_prefix(files: &mut [FileInfo]) -> Result<(bool, u64)> {
    let mut prefix_lines = 0u64;
    let mut had_cr = false;
    let mut is_match = all_match(files);
    let mut reached_one_eof = false;

    while is_match {
        let b = files[0].current_byte();
        if b == b'\r' {
            prefix_lines += 1;
            had_cr = true;
        } else if b == b'\n' && !had_cr {
            prefix_lines += 1;
            had_cr = false;
        } else {
            had_cr = false;
        }

        increment_pointers(files)?;
        reached_one_eof = is_one_at_eof(files);
        if reached_one_eof {
            break;
        }
        is_match = all_match(files);
    }

    if files.iter().all(FileInfo::at_eof) {
        // Fully identical inputs.
        return Ok((reached_one_eof, prefix_lines));
    }

    if had_cr {
        // The prefix may have ended inside a \r\n for one file but after a
        // bare \r for another; back up the whole line and uncount it.
        let ended_at_nonmatching_newline = files
            .iter()
            .any(|f| !f.at_eof() && f.current_byte() == b'\n');
        if ended_at_nonmatching_newline {
            prefix_lines = prefix_lines.saturating_sub(1);
            decrement_pointers(files)?;
        }
    }

    // Back up one byte to the last identical one, then to the last EOL.
    decrement_pointers(files)?;
    while !is_one_at_bof(files)
        && files[0].current_byte() != b'\n'
        && files[0].current_byte() != b'\r'
    {
        decrement_pointers(files)?;
    }
    // Slide past the EOL sequence onto the first differing line.
    increment_pointers(files)?;

    Ok((false, prefix_lines))
}

/// Scan backward from the file ends until a mismatch (or the prefix), then
/// slide forward past the current line plus SUFFIX_LINES_TO_KEEP more.
/// Records the suffix start in every file.
fn find_identical_suffix(files: &mut [FileInfo]) -> Result<()> {
    let mut sfx = Vec::with_capacity(files.len());
    for f in files.iter() {
        let mut s = FileInfo {
            path: f.path.clone(),
            file: f.file.try_clone()?,
            size: f.size,
            chunk: 0,
            buffer: Vec::new(),
            curp: 0,
            normalize_state: NormalizeState::default(),
            suffix: None,
        };
        // Position at the last byte. A size that is an exact multiple of
        // the chunk size makes the nominal last chunk empty.
        let mut last = s.last_chunk();
        if offset_in_chunk(f.size) == 0 {
            last -= 1;
        }
        s.read_chunk(last)?;
        s.curp = s.buffer.len() - 1;
        sfx.push(s);
    }

    // Where suffix scanning must stop so it never eats into the prefix,
    // in file[0] coordinates, compensating for shorter files.
    let mut suffix_min_chunk0 = files[0].chunk;
    let mut suffix_min_offset0 = files[0].curp;
    let min_file_size = files.iter().map(|f| f.size).min().unwrap();
    if files[0].size > min_file_size {
        let excess = files[0].size - min_file_size;
        suffix_min_chunk0 += (excess / CHUNK_SIZE) as i64;
        suffix_min_offset0 += (excess % CHUNK_SIZE) as usize;
    }

    let mut is_match = all_match(&sfx);
    while is_match {
        decrement_pointers(&mut sfx)?;
        let reached_prefix =
            sfx[0].chunk == suffix_min_chunk0 && sfx[0].curp == suffix_min_offset0;
        if reached_prefix || is_one_at_bof(&sfx) {
            break;
        }
        is_match = all_match(&sfx);
    }

    // First byte of the identical run.
    increment_pointers(&mut sfx)?;

    // Finish the current line, then keep a margin of identical lines out
    // of the suffix.
    let mut lines_to_keep = SUFFIX_LINES_TO_KEEP;
    loop {
        while !is_one_at_eof(&sfx)
            && sfx[0].current_byte() != b'\n'
            && sfx[0].current_byte() != b'\r'
        {
            increment_pointers(&mut sfx)?;
        }
        if !is_one_at_eof(&sfx) && sfx[0].current_byte() == b'\r' {
            increment_pointers(&mut sfx)?;
        }
        if !is_one_at_eof(&sfx) && sfx[0].current_byte() == b'\n' {
            increment_pointers(&mut sfx)?;
        }
        if is_one_at_eof(&sfx) || lines_to_keep == 0 {
            break;
        }
        lines_to_keep -= 1;
    }

    for (f, s) in files.iter_mut().zip(&sfx) {
        f.suffix = Some((s.chunk, s.curp));
    }
    Ok(())
}

/// Number of lines from (CHUNK, CURP) to the end of F.
fn count_lines_from(f: &FileInfo, chunk: i64, curp: usize) -> Result<u64> {
    let mut file = f.file.try_clone()?;
    let start = chunk_to_offset(chunk) + curp as u64;
    file.seek(SeekFrom::Start(start))?;

    let mut lines = 0u64;
    let mut had_cr = false;
    let mut dangling = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            match b {
                b'\r' => {
                    lines += 1;
                    had_cr = true;
                    dangling = false;
                }
                b'\n' => {
                    if !had_cr {
                        lines += 1;
                    }
                    had_cr = false;
                    dangling = false;
                }
                _ => {
                    had_cr = false;
                    dangling = true;
                }
            }
        }
    }
    if dangling {
        lines += 1;
    }
    Ok(lines)
}

/// All datasources of one diff invocation, plus the token free list.
pub struct DiffBaton {
    options: DiffOptions,
    files: Vec<FileInfo>,
    free_tokens: Vec<Token>,
    scratch: Vec<u8>,
    prefix_lines: u64,
    suffix_lines: u64,
}

impl DiffBaton {
    /// Open every path, read the first chunks and elide the identical
    /// prefix and suffix (skipped when any file is empty).
    pub fn open<P: AsRef<Path>>(paths: &[P], options: &DiffOptions) -> Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(FileInfo::open(path.as_ref())?);
        }

        let mut prefix_lines = 0;
        let mut suffix_lines = 0;
        if files.iter().all(|f| f.size > 0) {
            let (reached_one_eof, prefix) = find_identical_prefix(&mut files)?;
            prefix_lines = prefix;
            // If one file was consumed entirely by the prefix there is no
            // identical suffix left to find.
            if !reached_one_eof && !files.iter().any(FileInfo::at_eof) {
                find_identical_suffix(&mut files)?;
                let (chunk, curp) = files[0].suffix.unwrap();
                suffix_lines = count_lines_from(&files[0], chunk, curp)?;
            }
            tracing::debug!(prefix_lines, suffix_lines, "elided identical context");
        }

        Ok(Self {
            options: *options,
            files,
            free_tokens: Vec::new(),
            scratch: Vec::new(),
            prefix_lines,
            suffix_lines,
        })
    }

    /// Lines elided as identical prefix, common to all datasources.
    pub fn prefix_lines(&self) -> u64 {
        self.prefix_lines
    }

    /// Lines elided as identical suffix.
    pub fn suffix_lines(&self) -> u64 {
        self.suffix_lines
    }

    pub fn path(&self, source: usize) -> &Path {
        &self.files[source].path
    }

    /// Return an exhausted token to the free list.
    pub fn discard_token(&mut self, token: Token) {
        self.free_tokens.push(token);
    }

    /// Produce the next line of SOURCE, or None at EOF / suffix boundary.
    pub fn next_token(&mut self, source: usize) -> Result<Option<Token>> {
        let opts = self.options;
        let f = &mut self.files[source];

        if f.at_eof() && f.chunk == f.last_chunk() {
            return Ok(None);
        }
        if let Some((chunk, curp)) = f.suffix {
            if f.chunk == chunk && f.curp == curp {
                return Ok(None);
            }
        }

        let mut token = self.free_tokens.pop().unwrap_or_default();
        token.source = source;
        token.offset = chunk_to_offset(f.chunk) + f.curp as u64;
        token.raw_length = 0;

        self.scratch.clear();
        let mut hash = RollingAdler32::new();
        let mut pending_cr = false;

        let end = loop {
            if pending_cr {
                // The previous chunk ended in \r; a leading \n belongs to
                // the same line ending.
                break usize::from(!f.buffer.is_empty() && f.buffer[0] == b'\n');
            }

            match f.buffer[f.curp..]
                .iter()
                .position(|&b| b == b'\n' || b == b'\r')
            {
                Some(rel) => {
                    let eolp = f.curp + rel;
                    let is_cr = f.buffer[eolp] == b'\r';
                    if !(is_cr && eolp + 1 == f.buffer.len() && f.chunk != f.last_chunk()) {
                        let mut end = eolp + 1;
                        if is_cr && end < f.buffer.len() && f.buffer[end] == b'\n' {
                            end += 1;
                        }
                        break end;
                    }
                    pending_cr = true;
                }
                None => {
                    if f.chunk == f.last_chunk() {
                        break f.buffer.len();
                    }
                }
            }

            // The line continues into the next chunk: bank what we have.
            let part_start = f.curp;
            let part_end = f.buffer.len();
            token.raw_length += (part_end - part_start) as u64;
            let before = self.scratch.len();
            normalize_chunk(
                &f.buffer[part_start..part_end],
                &mut f.normalize_state,
                &opts,
                &mut self.scratch,
            );
            hash.update_buffer(&self.scratch[before..]);

            let next = f.chunk + 1;
            f.read_chunk(next)?;
            f.curp = 0;
        };

        token.raw_length += (end - f.curp) as u64;
        let before = self.scratch.len();
        normalize_chunk(
            &f.buffer[f.curp..end],
            &mut f.normalize_state,
            &opts,
            &mut self.scratch,
        );
        hash.update_buffer(&self.scratch[before..]);
        f.curp = end;

        // A file whose length is an exact multiple of the chunk size would
        // otherwise yield a spurious empty token here.
        if token.raw_length == 0 {
            self.free_tokens.push(token);
            return Ok(None);
        }

        token.norm_offset = token.offset;
        token.length = self.scratch.len() as u64;
        token.hash = hash.hash();
        Ok(Some(token))
    }

    /// Compare two tokens for equality of their normalised contents.
    pub fn token_compare(&mut self, a: &Token, b: &Token) -> Result<bool> {
        // Differing normalised length settles it immediately.
        if a.length != b.length {
            return Ok(false);
        }
        if a.length == 0 {
            return Ok(true);
        }

        // Fast path: raw bytes of both tokens still sit in their current
        // in-memory chunks and no normalisation is in effect.
        let identity = self.options.ignore_space == IgnoreSpace::None
            && !self.options.ignore_eol_style;
        if identity {
            if let (Some(sa), Some(sb)) = (self.in_memory(a), self.in_memory(b)) {
                return Ok(sa == sb);
            }
        }

        let na = self.normalized_bytes(a)?;
        let nb = self.normalized_bytes(b)?;
        Ok(na == nb)
    }

    /// The raw bytes of TOKEN if they are entirely inside its file's
    /// currently loaded chunk.
    fn in_memory(&self, token: &Token) -> Option<&[u8]> {
        let f = &self.files[token.source];
        if offset_to_chunk(token.norm_offset) != f.chunk {
            return None;
        }
        let start = offset_in_chunk(token.norm_offset);
        let end = start + token.raw_length as usize;
        f.buffer.get(start..end)
    }

    /// Re-stream TOKEN from disk in fixed windows, normalising on the fly.
    /// A mismatch against the cached length means the datasource changed
    /// under us.
    fn normalized_bytes(&mut self, token: &Token) -> Result<Vec<u8>> {
        if let Some(slice) = self.in_memory(token) {
            let mut out = Vec::with_capacity(slice.len());
            let mut state = NormalizeState::default();
            normalize_chunk(slice, &mut state, &self.options, &mut out);
            return self.check_token_length(token, out);
        }

        let f = &mut self.files[token.source];
        let mut file = f.file.try_clone()?;
        file.seek(SeekFrom::Start(token.offset))?;

        let mut out = Vec::with_capacity(token.length as usize);
        let mut state = NormalizeState::default();
        let mut remaining = token.raw_length as usize;
        let mut window = [0u8; COMPARE_CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(COMPARE_CHUNK_SIZE);
            let n = file.read(&mut window[..want])?;
            if n == 0 {
                // Shorter than when we tokenised it.
                return Err(DiffError::DatasourceModified(f.path.clone()));
            }
            normalize_chunk(&window[..n], &mut state, &self.options, &mut out);
            remaining -= n;
        }
        self.check_token_length(token, out)
    }

    fn check_token_length(&self, token: &Token, out: Vec<u8>) -> Result<Vec<u8>> {
        if out.len() as u64 != token.length {
            return Err(DiffError::DatasourceModified(
                self.files[token.source].path.clone(),
            ));
        }
        Ok(out)
    }
}
