//! Three-way merge output with conflict markers.
//!
//! Files are memory-mapped (falling back to a plain read) and emitted line
//! by line according to the three-way chunk list. The EOL used for
//! conflict markers follows the modified file's detected line-ending
//! style, defaulting to the platform EOL.

use crate::diff::{ChunkKind, Diff, DiffChunk};
use crate::error::Result;
use crate::unified::split_lines;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// How conflicting regions are displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictStyle {
    /// Modified and latest sides between markers.
    #[default]
    ModifiedLatest,
    /// Like ModifiedLatest, plus the original text.
    ModifiedOriginalLatest,
    /// Only the modified side, no markers.
    Modified,
    /// Only the latest side, no markers.
    Latest,
    /// Interleave the two sides via their own diff; falls back to
    /// ModifiedLatest when no resolution diff exists.
    ResolvedModifiedLatest,
    /// Emit only conflicting hunks with three lines of context.
    OnlyConflicts,
}

/// Lines of context shown around a conflict in OnlyConflicts mode.
const CONTEXT_SIZE: usize = 3;

const ORIGINAL: usize = 0;
const MODIFIED: usize = 1;
const LATEST: usize = 2;

enum FileData {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

impl FileData {
    fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(FileData::Owned(Vec::new()));
        }
        // Published inputs may be large; map them when the OS allows.
        match unsafe { memmap2::Mmap::map(&file) } {
            Ok(map) => Ok(FileData::Mapped(map)),
            Err(_) => Ok(FileData::Owned(std::fs::read(path)?)),
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            FileData::Mapped(map) => map,
            FileData::Owned(vec) => vec,
        }
    }
}

/// Detect the EOL style of DATA from its first line ending.
fn detect_eol(data: &[u8]) -> Option<&'static str> {
    for (i, &b) in data.iter().enumerate() {
        match b {
            b'\n' => return Some("\n"),
            b'\r' => {
                return Some(if data.get(i + 1) == Some(&b'\n') {
                    "\r\n"
                } else {
                    "\r"
                })
            }
            _ => {}
        }
    }
    None
}

#[cfg(windows)]
const PLATFORM_EOL: &str = "\r\n";
#[cfg(not(windows))]
const PLATFORM_EOL: &str = "\n";

/// Where emitted lines currently go in OnlyConflicts mode.
enum Sink {
    /// Straight to the output.
    Direct,
    /// Ring buffer of leading context awaiting the next conflict.
    Saver,
    /// Printing trailing context; switches back to Saver when exhausted.
    Trailing(usize),
}

struct MergeWriter<'a, W: Write> {
    out: &'a mut W,
    sources: [&'a [u8]; 3],
    lines: [Vec<(usize, usize)>; 3],
    markers: [String; 4],
    marker_eol: &'a str,
    style: ConflictStyle,
    sink: Sink,
    saved: VecDeque<(usize, usize, usize)>,
    total_saved: usize,
}

impl<'a, W: Write> MergeWriter<'a, W> {
    /// Emit one line through the current sink.
    fn emit_line(&mut self, source: usize, line: usize) -> Result<()> {
        let (s, e) = self.lines[source][line];
        let mut trailing_done = false;
        match &mut self.sink {
            Sink::Direct => {
                self.out.write_all(&self.sources[source][s..e])?;
            }
            Sink::Saver => {
                if self.saved.len() == CONTEXT_SIZE {
                    self.saved.pop_front();
                }
                self.saved.push_back((source, s, e));
                self.total_saved += 1;
            }
            Sink::Trailing(left) => {
                self.out.write_all(&self.sources[source][s..e])?;
                *left -= 1;
                trailing_done = *left == 0;
            }
        }
        if trailing_done {
            self.sink = Sink::Saver;
            self.saved.clear();
            self.total_saved = 0;
        }
        Ok(())
    }

    fn output_hunk(&mut self, source: usize, start: u64, len: u64) -> Result<()> {
        for line in start..start + len {
            if (line as usize) < self.lines[source].len() {
                self.emit_line(source, line as usize)?;
            }
        }
        Ok(())
    }

    fn write_marker(&mut self, text: &str) -> Result<()> {
        self.out.write_all(text.as_bytes())?;
        self.out.write_all(self.marker_eol.as_bytes())?;
        Ok(())
    }

    /// Default conflict rendering with markers.
    fn output_conflict(&mut self, chunk: &DiffChunk) -> Result<()> {
        let mut style = self.style;
        if style == ConflictStyle::ResolvedModifiedLatest {
            if let Some(resolved) = &chunk.resolved {
                for inner in resolved {
                    match inner.kind {
                        ChunkKind::DiffLatest => {
                            self.output_hunk(LATEST, inner.latest.start, inner.latest.len)?
                        }
                        _ => {
                            self.output_hunk(MODIFIED, inner.modified.start, inner.modified.len)?
                        }
                    }
                }
                return Ok(());
            }
            style = ConflictStyle::ModifiedLatest;
        }

        match style {
            ConflictStyle::ModifiedLatest | ConflictStyle::ModifiedOriginalLatest => {
                let modified_marker = self.markers[0].clone();
                self.write_marker(&modified_marker)?;
                self.output_hunk(MODIFIED, chunk.modified.start, chunk.modified.len)?;

                if style == ConflictStyle::ModifiedOriginalLatest {
                    let original_marker = self.markers[1].clone();
                    self.write_marker(&original_marker)?;
                    self.output_hunk(ORIGINAL, chunk.original.start, chunk.original.len)?;
                }

                let separator = self.markers[2].clone();
                self.write_marker(&separator)?;
                self.output_hunk(LATEST, chunk.latest.start, chunk.latest.len)?;

                let latest_marker = self.markers[3].clone();
                self.write_marker(&latest_marker)?;
            }
            ConflictStyle::Modified => {
                self.output_hunk(MODIFIED, chunk.modified.start, chunk.modified.len)?
            }
            ConflictStyle::Latest => {
                self.output_hunk(LATEST, chunk.latest.start, chunk.latest.len)?
            }
            _ => unreachable!("handled above"),
        }
        Ok(())
    }

    /// OnlyConflicts rendering: flush saved leading context, annotate the
    /// markers with line numbers, then print trailing context.
    fn output_conflict_with_context(&mut self, chunk: &DiffChunk) -> Result<()> {
        if matches!(self.sink, Sink::Saver) {
            if self.total_saved > CONTEXT_SIZE {
                writeln!(self.out, "@@")?;
            }
            let saved: Vec<(usize, usize, usize)> = self.saved.drain(..).collect();
            for (source, s, e) in saved {
                let bytes = &self.sources[source][s..e];
                self.out.write_all(bytes)?;
            }
        }
        self.sink = Sink::Direct;

        let annotate = |marker: &str, range: &crate::diff::LineRange| {
            if range.len == 1 {
                format!("{} ({})", marker, range.start + 1)
            } else {
                format!("{} ({},{})", marker, range.start + 1, range.len)
            }
        };

        let marker = annotate(&self.markers[0], &chunk.modified);
        self.write_marker(&marker)?;
        self.output_hunk(MODIFIED, chunk.modified.start, chunk.modified.len)?;

        let marker = annotate(&self.markers[1], &chunk.original);
        self.write_marker(&marker)?;
        self.output_hunk(ORIGINAL, chunk.original.start, chunk.original.len)?;

        let separator = self.markers[2].clone();
        self.write_marker(&separator)?;
        self.output_hunk(LATEST, chunk.latest.start, chunk.latest.len)?;

        let marker = annotate(&self.markers[3], &chunk.latest);
        self.write_marker(&marker)?;

        self.sink = Sink::Trailing(CONTEXT_SIZE);
        Ok(())
    }
}

/// Write the merged result of a three-way DIFF.
#[allow(clippy::too_many_arguments)]
pub fn write_merge<W: Write>(
    out: &mut W,
    diff: &Diff,
    original_path: impl AsRef<Path>,
    modified_path: impl AsRef<Path>,
    latest_path: impl AsRef<Path>,
    conflict_original: Option<&str>,
    conflict_modified: Option<&str>,
    conflict_latest: Option<&str>,
    conflict_separator: Option<&str>,
    style: ConflictStyle,
) -> Result<()> {
    let original = FileData::load(original_path.as_ref())?;
    let modified = FileData::load(modified_path.as_ref())?;
    let latest = FileData::load(latest_path.as_ref())?;

    let marker_eol = detect_eol(modified.bytes()).unwrap_or(PLATFORM_EOL);

    let markers = [
        conflict_modified
            .map(str::to_string)
            .unwrap_or_else(|| format!("<<<<<<< {}", modified_path.as_ref().display())),
        conflict_original
            .map(str::to_string)
            .unwrap_or_else(|| format!("||||||| {}", original_path.as_ref().display())),
        conflict_separator.unwrap_or("=======").to_string(),
        conflict_latest
            .map(str::to_string)
            .unwrap_or_else(|| format!(">>>>>>> {}", latest_path.as_ref().display())),
    ];

    let sources = [original.bytes(), modified.bytes(), latest.bytes()];
    let lines = [
        split_lines(sources[ORIGINAL]),
        split_lines(sources[MODIFIED]),
        split_lines(sources[LATEST]),
    ];

    let only_conflicts = style == ConflictStyle::OnlyConflicts;
    let mut writer = MergeWriter {
        out,
        sources,
        lines,
        markers,
        marker_eol,
        style,
        sink: if only_conflicts { Sink::Saver } else { Sink::Direct },
        saved: VecDeque::with_capacity(CONTEXT_SIZE),
        total_saved: 0,
    };

    for chunk in &diff.chunks {
        match chunk.kind {
            ChunkKind::Common | ChunkKind::DiffModified | ChunkKind::DiffCommon => {
                writer.output_hunk(MODIFIED, chunk.modified.start, chunk.modified.len)?;
            }
            ChunkKind::DiffLatest => {
                writer.output_hunk(LATEST, chunk.latest.start, chunk.latest.len)?;
            }
            ChunkKind::Conflict => {
                if only_conflicts {
                    writer.output_conflict_with_context(chunk)?;
                } else {
                    writer.output_conflict(chunk)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff3_files;
    use crate::options::DiffOptions;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn merge_with(
        o: &str,
        m: &str,
        l: &str,
        style: ConflictStyle,
    ) -> String {
        let dir = TempDir::new().unwrap();
        let op = write_file(&dir, "o", o);
        let mp = write_file(&dir, "m", m);
        let lp = write_file(&dir, "l", l);
        let diff = diff3_files(&op, &mp, &lp, &DiffOptions::default()).unwrap();
        let mut out = Vec::new();
        write_merge(
            &mut out,
            &diff,
            &op,
            &mp,
            &lp,
            Some("||||||| orig"),
            Some("<<<<<<< mine"),
            Some(">>>>>>> theirs"),
            None,
            style,
        )
        .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_merge_without_conflicts_applies_both_sides() {
        let merged = merge_with(
            "a\nb\nc\nd\ne\nf\ng\nh\n",
            "A\nb\nc\nd\ne\nf\ng\nh\n",
            "a\nb\nc\nd\ne\nf\ng\nH\n",
            ConflictStyle::ModifiedLatest,
        );
        assert_eq!(merged, "A\nb\nc\nd\ne\nf\ng\nH\n");
    }

    #[test]
    fn test_merge_modified_equals_original_yields_latest() {
        let merged = merge_with(
            "one\ntwo\n",
            "one\ntwo\n",
            "one\nTWO\n",
            ConflictStyle::ModifiedLatest,
        );
        assert_eq!(merged, "one\nTWO\n");
    }

    #[test]
    fn test_merge_latest_equals_original_yields_modified() {
        let merged = merge_with(
            "one\ntwo\n",
            "one\nTWO\n",
            "one\ntwo\n",
            ConflictStyle::ModifiedLatest,
        );
        assert_eq!(merged, "one\nTWO\n");
    }

    #[test]
    fn test_conflict_markers() {
        let merged = merge_with("x\n", "y\n", "z\n", ConflictStyle::ModifiedLatest);
        assert_eq!(
            merged,
            "<<<<<<< mine\ny\n=======\nz\n>>>>>>> theirs\n"
        );
    }

    #[test]
    fn test_conflict_with_original_text() {
        let merged = merge_with("x\n", "y\n", "z\n", ConflictStyle::ModifiedOriginalLatest);
        assert_eq!(
            merged,
            "<<<<<<< mine\ny\n||||||| orig\nx\n=======\nz\n>>>>>>> theirs\n"
        );
    }

    #[test]
    fn test_conflict_modified_only_style() {
        let merged = merge_with("x\n", "y\n", "z\n", ConflictStyle::Modified);
        assert_eq!(merged, "y\n");
        let merged = merge_with("x\n", "y\n", "z\n", ConflictStyle::Latest);
        assert_eq!(merged, "z\n");
    }

    #[test]
    fn test_merge_with_insertions_on_both_sides() {
        let merged = merge_with(
            "a\nb\nc\nd\ne\nf\ng\nh\n",
            "a\nM\nb\nc\nd\ne\nf\ng\nh\n",
            "a\nb\nc\nd\ne\nf\ng\nL\nh\n",
            ConflictStyle::ModifiedLatest,
        );
        assert_eq!(merged, "a\nM\nb\nc\nd\ne\nf\ng\nL\nh\n");
    }

    #[test]
    fn test_marker_eol_follows_modified_file() {
        let merged = merge_with("x\r\n", "y\r\n", "z\r\n", ConflictStyle::ModifiedLatest);
        assert_eq!(
            merged,
            "<<<<<<< mine\r\ny\r\n=======\r\nz\r\n>>>>>>> theirs\r\n"
        );
    }

    #[test]
    fn test_default_markers_use_paths() {
        let dir = TempDir::new().unwrap();
        let op = write_file(&dir, "o", "x\n");
        let mp = write_file(&dir, "m", "y\n");
        let lp = write_file(&dir, "l", "z\n");
        let diff = diff3_files(&op, &mp, &lp, &DiffOptions::default()).unwrap();
        let mut out = Vec::new();
        write_merge(
            &mut out,
            &diff,
            &op,
            &mp,
            &lp,
            None,
            None,
            None,
            None,
            ConflictStyle::ModifiedLatest,
        )
        .unwrap();
        let merged = String::from_utf8(out).unwrap();
        assert!(merged.contains(&format!("<<<<<<< {}", mp.display())));
        assert!(merged.contains(&format!(">>>>>>> {}", lp.display())));
    }

    #[test]
    fn test_only_conflicts_shows_context_and_line_numbers() {
        let merged = merge_with(
            "1\n2\n3\n4\n5\n6\n7\nx\n9\n10\n11\n12\n",
            "1\n2\n3\n4\n5\n6\n7\ny\n9\n10\n11\n12\n",
            "1\n2\n3\n4\n5\n6\n7\nz\n9\n10\n11\n12\n",
            ConflictStyle::OnlyConflicts,
        );
        // Separator for the skipped leading region, 3 lines of context on
        // both sides, annotated markers.
        assert!(merged.starts_with("@@\n5\n6\n7\n"), "got: {}", merged);
        assert!(merged.contains("<<<<<<< mine (8)\ny\n"));
        assert!(merged.contains("||||||| orig (8)\nx\n"));
        assert!(merged.contains(">>>>>>> theirs (8)\n"));
        assert!(merged.ends_with(">>>>>>> theirs (8)\n9\n10\n11\n"), "got: {}", merged);
    }

    #[test]
    fn test_resolved_style_interleaves() {
        let merged = merge_with(
            "base\n",
            "shared\nmine\n",
            "shared\ntheirs\n",
            ConflictStyle::ResolvedModifiedLatest,
        );
        // The common "shared" line appears once; each side's unique line
        // follows without conflict markers.
        assert_eq!(merged, "shared\nmine\ntheirs\n");
    }

    #[test]
    fn test_detect_eol() {
        assert_eq!(detect_eol(b"a\nb"), Some("\n"));
        assert_eq!(detect_eol(b"a\r\nb"), Some("\r\n"));
        assert_eq!(detect_eol(b"a\rb"), Some("\r"));
        assert_eq!(detect_eol(b"no endings"), None);
    }
}
