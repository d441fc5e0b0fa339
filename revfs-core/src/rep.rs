//! Reading and writing stored representations.
//!
//! A representation body sits inside a revision file (or a transaction's
//! prototype rev file) behind a `PLAIN` or `DELTA [...]` header line and is
//! followed by a cosmetic `ENDREP` trailer. Reading a DELTA rep walks the
//! base chain down to a PLAIN rep or a delta-vs-empty terminator, then
//! evaluates svndiff windows chunk by chunk: the output of each deeper
//! window becomes the source view of the one above it.

use crate::error::{FsError, Result};
use crate::hashfile::{self, HashMapOrdered};
use crate::noderev::{RepLocation, Representation};
use crate::paths::Layout;
use crate::svndiff::{self, Window, WINDOW_SIZE};
use md5::{Digest, Md5};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};

const REP_PLAIN: &str = "PLAIN";
const REP_DELTA: &str = "DELTA";
const REP_TRAILER: &str = "ENDREP";

/// Parsed `PLAIN`/`DELTA` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RepHeader {
    Plain,
    DeltaVsEmpty,
    Delta {
        base_revision: u64,
        base_offset: u64,
        base_length: u64,
    },
}

fn read_rep_header<R: BufRead>(reader: &mut R) -> Result<RepHeader> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.ends_with('\n') {
        line.pop();
    }

    if line == REP_PLAIN {
        return Ok(RepHeader::Plain);
    }
    if line == REP_DELTA {
        return Ok(RepHeader::DeltaVsEmpty);
    }

    let corrupt = || FsError::corrupt("malformed representation header");
    let mut fields = line.split_ascii_whitespace();
    if fields.next() != Some(REP_DELTA) {
        return Err(corrupt());
    }
    let base_revision = fields.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
    let base_offset = fields.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
    let base_length = fields.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
    if fields.next().is_some() {
        return Err(corrupt());
    }
    Ok(RepHeader::Delta {
        base_revision,
        base_offset,
        base_length,
    })
}

/// Open the file owning REP and seek to the rep's header line.
fn open_and_seek_representation(layout: &Layout, rep: &Representation) -> Result<BufReader<File>> {
    let path = match &rep.location {
        RepLocation::Revision(rev) => layout.rev(*rev),
        RepLocation::Txn(txn_id) => layout.txn_proto_rev(txn_id),
    };
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(rep.offset))?;
    Ok(reader)
}

/// Decode state for one element of a delta chain.
struct RepState {
    file: BufReader<File>,
    /// First byte of the raw rep body (past the header line).
    start: u64,
    /// Current read position.
    off: u64,
    /// One past the last byte of the body.
    end: u64,
    /// Next window to be read.
    chunk_index: u64,
    /// Absolute target offset covered by windows already consumed.
    tview_offset: u64,
}

impl RepState {
    fn beyond_end(&self) -> bool {
        self.off > self.end
    }
}

/// Build the chain of delta states from FIRST_REP down to a PLAIN source
/// or a delta-vs-empty terminator.
fn build_rep_list(
    layout: &Layout,
    first_rep: &Representation,
) -> Result<(Vec<RepState>, Option<RepState>)> {
    let mut list = Vec::new();
    let mut rep = first_rep.clone();

    loop {
        let mut file = open_and_seek_representation(layout, &rep)?;
        let header = read_rep_header(&mut file)?;
        let start = file.stream_position()?;

        let mut rs = RepState {
            file,
            start,
            off: start,
            end: start + rep.size,
            chunk_index: 0,
            tview_offset: 0,
        };

        match header {
            RepHeader::Plain => return Ok((list, Some(rs))),
            RepHeader::DeltaVsEmpty => {
                svndiff::read_magic(&mut rs.file)?;
                rs.off += 4;
                list.push(rs);
                return Ok((list, None));
            }
            RepHeader::Delta {
                base_revision,
                base_offset,
                base_length,
            } => {
                svndiff::read_magic(&mut rs.file)?;
                rs.off += 4;
                list.push(rs);
                rep = Representation {
                    location: RepLocation::Revision(base_revision),
                    offset: base_offset,
                    size: base_length,
                    expanded_size: 0,
                    md5: [0; 16],
                };
            }
        }
    }
}

/// Streaming reader for a representation's expanded bytes. Verifies the
/// stored MD5 digest once `expanded_size` bytes have been produced.
pub struct RepReader {
    rs_list: Vec<RepState>,
    src_state: Option<RepState>,
    buf: Vec<u8>,
    buf_pos: usize,
    md5: Md5,
    checksum_finalized: bool,
    expected_md5: [u8; 16],
    len: u64,
    off: u64,
}

impl RepReader {
    pub fn new(layout: &Layout, rep: &Representation) -> Result<Self> {
        let (rs_list, src_state) = build_rep_list(layout, rep)?;
        Ok(Self {
            rs_list,
            src_state,
            buf: Vec::new(),
            buf_pos: 0,
            md5: Md5::new(),
            checksum_finalized: false,
            expected_md5: rep.md5,
            len: rep.expanded_size,
            off: 0,
        })
    }

    /// Evaluate the next chunk of the delta chain into `self.buf`.
    /// Returns false when the top rep is exhausted.
    fn fill_next_chunk(&mut self) -> Result<bool> {
        let this_chunk = self.rs_list[0].chunk_index;

        // Collect the windows for this chunk, top down, stopping at the
        // first level that no longer references its source.
        let mut windows: Vec<(Window, u64)> = Vec::new();
        for level in 0..self.rs_list.len() {
            if level == 0 {
                let rs = &mut self.rs_list[0];
                if rs.off == rs.end {
                    return Ok(false);
                }
                let window = Window::read_from(&mut rs.file)?;
                rs.off = rs.file.stream_position()?;
                rs.chunk_index += 1;
                let tview_start = rs.tview_offset;
                rs.tview_offset += window.tview_len;
                if rs.beyond_end() {
                    return Err(FsError::corrupt(
                        "reading one svndiff window read beyond the end of the representation",
                    ));
                }
                windows.push((window, tview_start));
                continue;
            }

            if windows.last().map(|(w, _)| w.src_ops()) == Some(0) {
                break;
            }

            let rs = &mut self.rs_list[level];
            // Skip earlier windows without materialising them.
            while rs.chunk_index < this_chunk {
                let (consumed, tview_len) = Window::skip(&mut rs.file)?;
                rs.off += consumed;
                rs.chunk_index += 1;
                rs.tview_offset += tview_len;
                if rs.off >= rs.end {
                    return Err(FsError::corrupt(
                        "reading one svndiff window read beyond the end of the representation",
                    ));
                }
            }
            let window = Window::read_from(&mut rs.file)?;
            rs.off = rs.file.stream_position()?;
            rs.chunk_index += 1;
            let tview_start = rs.tview_offset;
            rs.tview_offset += window.tview_len;
            if rs.beyond_end() {
                return Err(FsError::corrupt(
                    "reading one svndiff window read beyond the end of the representation",
                ));
            }
            windows.push((window, tview_start));
        }

        // Produce the source bytes for the deepest collected window.
        let deepest_needs_source = windows
            .last()
            .map(|(w, _)| w.src_ops() > 0)
            .unwrap_or(false);
        let (mut src, mut src_start) = if deepest_needs_source {
            let (window, _) = windows.last().expect("collected at least one window");
            let rs = self.src_state.as_mut().ok_or_else(|| {
                FsError::corrupt("svndiff data requested non-existent source")
            })?;
            if rs.start + window.sview_offset + window.sview_len > rs.end {
                return Err(FsError::corrupt(
                    "svndiff requested position beyond end of stream",
                ));
            }
            let target = rs.start + window.sview_offset;
            if rs.off != target {
                rs.file.seek(SeekFrom::Start(target))?;
                rs.off = target;
            }
            let mut sbuf = vec![0u8; window.sview_len as usize];
            rs.file.read_exact(&mut sbuf)?;
            rs.off += window.sview_len;
            (sbuf, window.sview_offset)
        } else {
            (Vec::new(), 0)
        };

        // Apply bottom-up: each window's output is the source stream for
        // the window above it.
        for (window, tview_start) in windows.iter().rev() {
            let slice: &[u8] = if window.src_ops() > 0 {
                let rel = window
                    .sview_offset
                    .checked_sub(src_start)
                    .ok_or_else(|| FsError::corrupt("svndiff source view precedes base chunk"))?
                    as usize;
                let end = rel + window.sview_len as usize;
                if end > src.len() {
                    return Err(FsError::corrupt(
                        "svndiff requested position beyond end of stream",
                    ));
                }
                &src[rel..end]
            } else {
                &[]
            };
            let out = window.apply(slice)?;
            src = out;
            src_start = *tview_start;
        }

        self.buf = src;
        self.buf_pos = 0;
        Ok(true)
    }

    /// Read up to `buf.len()` expanded bytes, updating the running digest.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_raw(buf)?;
        if !self.checksum_finalized {
            self.md5.update(&buf[..n]);
            self.off += n as u64;
            if self.off == self.len {
                self.checksum_finalized = true;
                let digest: [u8; 16] = self.md5.clone().finalize().into();
                if digest != self.expected_md5 {
                    return Err(FsError::ChecksumMismatch {
                        expected: hex::encode(self.expected_md5),
                        actual: hex::encode(digest),
                    });
                }
            }
        }
        Ok(n)
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        // Plain rep with no deltas: stream the file region directly.
        if self.rs_list.is_empty() {
            let rs = match self.src_state.as_mut() {
                Some(rs) => rs,
                None => return Ok(0),
            };
            let remaining = (rs.end - rs.off) as usize;
            let n = buf.len().min(remaining);
            rs.file.read_exact(&mut buf[..n])?;
            rs.off += n as u64;
            return Ok(n);
        }

        let mut written = 0;
        while written < buf.len() {
            if self.buf_pos == self.buf.len() {
                if !self.fill_next_chunk()? {
                    break;
                }
                continue;
            }
            let n = (buf.len() - written).min(self.buf.len() - self.buf_pos);
            buf[written..written + n].copy_from_slice(&self.buf[self.buf_pos..self.buf_pos + n]);
            self.buf_pos += n;
            written += n;
        }
        Ok(written)
    }

    /// Read the remaining expanded bytes into a vector.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len as usize);
        let mut chunk = [0u8; 8192];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Read a representation's complete expanded contents. A missing rep reads
/// as the empty stream.
pub fn read_rep_contents(layout: &Layout, rep: Option<&Representation>) -> Result<Vec<u8>> {
    match rep {
        None => Ok(Vec::new()),
        Some(rep) => RepReader::new(layout, rep)?.read_to_end(),
    }
}

/// Writer that deltifies caller bytes against a base rep and appends the
/// result to a transaction's prototype rev file.
pub struct RepWriter {
    file: File,
    txn_id: String,
    rep_offset: u64,
    delta_start: u64,
    source: Option<RepReader>,
    source_offset: u64,
    source_done: bool,
    pending: Vec<u8>,
    md5: Md5,
    expanded_size: u64,
}

impl RepWriter {
    /// Open the prototype rev file of TXN_ID for appending and emit the
    /// `DELTA` header for BASE_REP (or the vs-empty form).
    pub fn create(layout: &Layout, txn_id: &str, base_rep: Option<&Representation>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(layout.txn_proto_rev(txn_id))?;
        let rep_offset = file.seek(SeekFrom::End(0))?;

        match base_rep {
            Some(base) => {
                let base_rev = base.revision().ok_or_else(|| {
                    FsError::corrupt("delta base must be an immutable representation")
                })?;
                writeln!(file, "{} {} {} {}", REP_DELTA, base_rev, base.offset, base.size)?;
            }
            None => writeln!(file, "{}", REP_DELTA)?,
        }

        let delta_start = file.stream_position()?;
        svndiff::write_magic(&mut file)?;

        let source = base_rep
            .map(|rep| RepReader::new(layout, rep))
            .transpose()?;

        Ok(Self {
            file,
            txn_id: txn_id.to_string(),
            rep_offset,
            delta_start,
            source_done: source.is_none(),
            source,
            source_offset: 0,
            pending: Vec::new(),
            md5: Md5::new(),
            expanded_size: 0,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.md5.update(data);
        self.expanded_size += data.len() as u64;
        self.pending.extend_from_slice(data);
        while self.pending.len() as u64 >= WINDOW_SIZE {
            self.flush_window(WINDOW_SIZE as usize)?;
        }
        Ok(())
    }

    fn next_source_view(&mut self) -> Result<Vec<u8>> {
        if self.source_done {
            return Ok(Vec::new());
        }
        let reader = match self.source.as_mut() {
            Some(reader) => reader,
            None => return Ok(Vec::new()),
        };
        let mut view = vec![0u8; WINDOW_SIZE as usize];
        let mut filled = 0;
        while filled < view.len() {
            let n = reader.read(&mut view[filled..])?;
            if n == 0 {
                self.source_done = true;
                break;
            }
            filled += n;
        }
        view.truncate(filled);
        Ok(view)
    }

    fn flush_window(&mut self, target_len: usize) -> Result<()> {
        let target: Vec<u8> = self.pending.drain(..target_len).collect();
        let sview_offset = self.source_offset;
        let source = self.next_source_view()?;
        self.source_offset += source.len() as u64;

        let window = Window::deltify(sview_offset, &source, &target);
        window.write_to(&mut self.file)?;
        Ok(())
    }

    /// Flush remaining data, append the trailer and return the finished
    /// (still mutable) representation.
    pub fn close(mut self) -> Result<Representation> {
        if !self.pending.is_empty() {
            let len = self.pending.len();
            self.flush_window(len)?;
        }

        let end = self.file.stream_position()?;
        writeln!(self.file, "{}", REP_TRAILER)?;

        let md5: [u8; 16] = self.md5.finalize().into();
        Ok(Representation {
            location: RepLocation::Txn(self.txn_id),
            offset: self.rep_offset,
            size: end - self.delta_start,
            expanded_size: self.expanded_size,
            md5,
        })
    }
}

/// Append HASH to FILE as a PLAIN representation, returning its on-disk
/// size and the digest of the dump.
pub fn write_hash_rep(file: &mut File, hash: &HashMapOrdered) -> Result<(u64, [u8; 16])> {
    writeln!(file, "{}", REP_PLAIN)?;
    let start = file.stream_position()?;

    let mut dump = Vec::new();
    hashfile::write_hash(&mut dump, hash)?;
    let digest: [u8; 16] = Md5::digest(&dump).into();
    file.write_all(&dump)?;

    let end = file.stream_position()?;
    writeln!(file, "{}", REP_TRAILER)?;
    Ok((end - start, digest))
}

/// Read a hash-dump representation (props or directory contents).
pub fn read_hash_rep(layout: &Layout, rep: &Representation) -> Result<HashMapOrdered> {
    let bytes = read_rep_contents(layout, Some(rep))?;
    hashfile::read_hash(&mut std::io::Cursor::new(bytes))
}
