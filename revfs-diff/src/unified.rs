//! Unified (two-way) diff output.

use crate::diff::{ChunkKind, Diff};
use crate::error::Result;
use chrono::{DateTime, Local};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Lines of leading and trailing context around a hunk.
pub const UNIFIED_CONTEXT_SIZE: u64 = 3;

/// Longest C-function annotation kept for `@@` headers.
const EXTRA_CONTEXT_LENGTH: usize = 50;

const NO_NEWLINE_MARKER: &[u8] = b"\n\\ No newline at end of file\n";

/// A file split into lines; each slice keeps its EOL bytes.
struct Lines {
    data: Vec<u8>,
    bounds: Vec<(usize, usize)>,
}

impl Lines {
    fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let bounds = split_lines(&data);
        Ok(Self { data, bounds })
    }

    fn count(&self) -> u64 {
        self.bounds.len() as u64
    }

    fn get(&self, idx: u64) -> Option<&[u8]> {
        self.bounds
            .get(idx as usize)
            .map(|&(s, e)| &self.data[s..e])
    }

    /// True if IDX is the file's final line and it lacks a trailing EOL.
    fn lacks_eol(&self, idx: u64) -> bool {
        idx + 1 == self.count()
            && self
                .get(idx)
                .is_some_and(|l| !l.ends_with(b"\n") && !l.ends_with(b"\r"))
    }
}

/// Split DATA at `\n`, `\r\n` and `\r` boundaries, keeping the EOL bytes.
pub(crate) fn split_lines(data: &[u8]) -> Vec<(usize, usize)> {
    let mut bounds = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\n' => {
                bounds.push((start, i + 1));
                start = i + 1;
            }
            b'\r' => {
                let end = if data.get(i + 1) == Some(&b'\n') {
                    i + 2
                } else {
                    i + 1
                };
                bounds.push((start, end));
                start = end;
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    if start < data.len() {
        bounds.push((start, data.len()));
    }
    bounds
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LineType {
    Skip,
    Context,
    Delete,
    Insert,
}

struct UnifiedWriter<'a, W: Write> {
    out: &'a mut W,
    files: [&'a Lines; 2],
    current_line: [u64; 2],
    hunk: Vec<u8>,
    hunk_start: [u64; 2],
    hunk_length: [u64; 2],
    show_c_function: bool,
    extra_context: Vec<u8>,
    hunk_extra_context: String,
}

impl<'a, W: Write> UnifiedWriter<'a, W> {
    fn output_line(&mut self, line_type: LineType, idx: usize) {
        let line_no = self.current_line[idx];
        self.current_line[idx] += 1;
        let Some(line) = self.files[idx].get(line_no) else {
            // Faked context past EOF.
            return;
        };

        match line_type {
            LineType::Skip => {}
            LineType::Context => {
                self.hunk.push(b' ');
                self.hunk_length[0] += 1;
                self.hunk_length[1] += 1;
            }
            LineType::Delete => {
                self.hunk.push(b'-');
                self.hunk_length[0] += 1;
            }
            LineType::Insert => {
                self.hunk.push(b'+');
                self.hunk_length[1] += 1;
            }
        }

        if self.show_c_function
            && matches!(line_type, LineType::Skip | LineType::Context)
            && is_function_line(line)
        {
            self.extra_context.clear();
            self.extra_context.extend_from_slice(line);
        }

        if line_type != LineType::Skip {
            self.hunk.extend_from_slice(line);
            if self.files[idx].lacks_eol(line_no) {
                self.hunk.extend_from_slice(NO_NEWLINE_MARKER);
            }
        }
    }

    fn flush_hunk(&mut self) -> Result<()> {
        if self.hunk.is_empty() {
            return Ok(());
        }

        // Trailing context.
        let target = self.hunk_start[0] + self.hunk_length[0] + UNIFIED_CONTEXT_SIZE;
        while self.current_line[0] < target {
            self.output_line(LineType::Context, 0);
        }

        // 1-based display for non-empty ranges; `,n` elided when n == 1.
        let mut start = [self.hunk_start[0], self.hunk_start[1]];
        for i in 0..2 {
            if self.hunk_length[i] > 0 {
                start[i] += 1;
            }
        }
        write!(self.out, "@@ -{}", start[0])?;
        if self.hunk_length[0] != 1 {
            write!(self.out, ",{}", self.hunk_length[0])?;
        }
        write!(self.out, " +{}", start[1])?;
        if self.hunk_length[1] != 1 {
            write!(self.out, ",{}", self.hunk_length[1])?;
        }
        if self.hunk_extra_context.is_empty() {
            writeln!(self.out, " @@")?;
        } else {
            writeln!(self.out, " @@ {}", self.hunk_extra_context)?;
        }

        self.out.write_all(&self.hunk)?;

        self.hunk_length = [0, 0];
        self.hunk.clear();
        Ok(())
    }

    fn output_diff_modified(
        &mut self,
        original_start: u64,
        original_length: u64,
        modified_start: u64,
        modified_length: u64,
    ) -> Result<()> {
        let target0 = original_start.saturating_sub(UNIFIED_CONTEXT_SIZE);
        let target1 = modified_start;

        // Start a fresh hunk when the previous one cannot supply
        // overlapping context.
        if self.current_line[0] < target0
            && (self.hunk_start[0] + self.hunk_length[0] + UNIFIED_CONTEXT_SIZE < target0
                || self.hunk_length[0] == 0)
        {
            self.flush_hunk()?;
            self.hunk_start[0] = target0;
            self.hunk_start[1] = target1 + target0 - original_start;

            while self.current_line[0] < target0 {
                self.output_line(LineType::Skip, 0);
            }

            if self.show_c_function {
                self.hunk_extra_context = trim_extra_context(&self.extra_context);
            }
        }

        while self.current_line[1] < target1 {
            self.output_line(LineType::Skip, 1);
        }
        while self.current_line[0] < original_start {
            self.output_line(LineType::Context, 0);
        }

        let end0 = original_start + original_length;
        let end1 = modified_start + modified_length;
        while self.current_line[0] < end0 {
            self.output_line(LineType::Delete, 0);
        }
        while self.current_line[1] < end1 {
            self.output_line(LineType::Insert, 1);
        }
        Ok(())
    }
}

fn is_function_line(line: &[u8]) -> bool {
    let first = match line.first() {
        Some(&b) => b,
        None => return false,
    };
    if !(first.is_ascii_alphabetic() || first == b'$' || first == b'_') {
        return false;
    }
    ![&b"public:"[..], b"private:", b"protected:"]
        .iter()
        .any(|label| line.starts_with(label))
}

fn trim_extra_context(context: &[u8]) -> String {
    let truncated = &context[..context.len().min(EXTRA_CONTEXT_LENGTH)];
    let text = String::from_utf8_lossy(truncated);
    text.trim_end().to_string()
}

/// Default unified header: the path, a tab, and the file's mtime.
fn default_header(path: &Path) -> Result<String> {
    let mtime = fs::metadata(path)?.modified()?;
    let stamp = DateTime::<Local>::from(mtime).format("%a %b %e %H:%M:%S %Y");
    Ok(format!("{}\t{}", path.display(), stamp))
}

/// Write DIFF in unified format with 3 lines of context. Nothing is
/// written when the diff is empty.
#[allow(clippy::too_many_arguments)]
pub fn write_unified<W: Write>(
    out: &mut W,
    diff: &Diff,
    original_path: impl AsRef<Path>,
    modified_path: impl AsRef<Path>,
    original_header: Option<&str>,
    modified_header: Option<&str>,
    show_c_function: bool,
) -> Result<()> {
    if !diff.has_diffs() {
        return Ok(());
    }

    let original = Lines::load(original_path.as_ref())?;
    let modified = Lines::load(modified_path.as_ref())?;

    let original_header = match original_header {
        Some(h) => h.to_string(),
        None => default_header(original_path.as_ref())?,
    };
    let modified_header = match modified_header {
        Some(h) => h.to_string(),
        None => default_header(modified_path.as_ref())?,
    };
    writeln!(out, "--- {}", original_header)?;
    writeln!(out, "+++ {}", modified_header)?;

    let mut writer = UnifiedWriter {
        out,
        files: [&original, &modified],
        current_line: [0, 0],
        hunk: Vec::new(),
        hunk_start: [0, 0],
        hunk_length: [0, 0],
        show_c_function,
        extra_context: Vec::new(),
        hunk_extra_context: String::new(),
    };

    for chunk in &diff.chunks {
        if chunk.kind == ChunkKind::DiffModified {
            writer.output_diff_modified(
                chunk.original.start,
                chunk.original.len,
                chunk.modified.start,
                chunk.modified.len,
            )?;
        }
    }
    writer.flush_hunk()?;
    Ok(())
}
