//! Line normalisation for whitespace and EOL-insensitive comparison.
//!
//! Normalisation runs as a small state machine so that a token can be
//! normalised piecewise across chunk boundaries. The machine never grows
//! its input, which allows compacting a buffer in place.

use crate::options::{DiffOptions, IgnoreSpace};

/// Carry-over state between normalised pieces of the same stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormalizeState {
    #[default]
    Normal,
    /// The previous byte was a `\r` that was already emitted as `\n`;
    /// a following `\n` is swallowed.
    Cr,
    /// Inside a run of blanks that has not been emitted yet.
    Whitespace,
}

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t' || b == b'\x0c'
}

/// Normalise INPUT into OUT according to OPTS, continuing from STATE.
///
/// - with `ignore_eol_style`, any of `\r`, `\n`, `\r\n` becomes `\n`;
/// - with `IgnoreSpace::Change`, a run of blanks becomes a single space
///   (dropped entirely before a line ending);
/// - with `IgnoreSpace::All`, blanks disappear.
pub fn normalize_chunk(
    input: &[u8],
    state: &mut NormalizeState,
    opts: &DiffOptions,
    out: &mut Vec<u8>,
) {
    for &b in input {
        if *state == NormalizeState::Cr {
            *state = NormalizeState::Normal;
            if b == b'\n' {
                continue;
            }
        }

        if is_blank(b) {
            match opts.ignore_space {
                IgnoreSpace::None => out.push(b),
                IgnoreSpace::Change => *state = NormalizeState::Whitespace,
                IgnoreSpace::All => {}
            }
            continue;
        }

        // A pending blank run materialises as one space, except before a
        // line ending where it is dropped.
        if *state == NormalizeState::Whitespace {
            *state = NormalizeState::Normal;
            if b != b'\n' && b != b'\r' {
                out.push(b' ');
            }
        }

        match b {
            b'\r' if opts.ignore_eol_style => {
                out.push(b'\n');
                *state = NormalizeState::Cr;
            }
            _ => out.push(b),
        }
    }
}

/// Normalise a standalone byte string (fresh state, state discarded).
pub fn normalize(input: &[u8], opts: &DiffOptions) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut state = NormalizeState::default();
    normalize_chunk(input, &mut state, opts, &mut out);
    out
}
