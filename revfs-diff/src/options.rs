//! Diff option flags and their GNU-style argument parser.

use crate::error::{DiffError, Result};

/// How whitespace inside lines is treated during comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnoreSpace {
    /// Whitespace is significant.
    #[default]
    None,
    /// Runs of whitespace compare equal to a single space.
    Change,
    /// Whitespace is ignored entirely.
    All,
}

/// Options accepted by the file diff engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    pub ignore_space: IgnoreSpace,
    /// Treat `\r`, `\n` and `\r\n` line endings as identical.
    pub ignore_eol_style: bool,
    /// Annotate unified hunk headers with the enclosing C function.
    pub show_c_function: bool,
}

impl DiffOptions {
    /// Parse GNU-diff style argument strings. `-u` is accepted and
    /// ignored for compatibility; anything unrecognised is rejected.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let mut options = Self::default();
        for arg in args {
            match arg.as_ref() {
                "-b" | "--ignore-space-change" => {
                    // -w takes precedence over -b.
                    if options.ignore_space == IgnoreSpace::None {
                        options.ignore_space = IgnoreSpace::Change;
                    }
                }
                "-w" | "--ignore-all-space" => options.ignore_space = IgnoreSpace::All,
                "--ignore-eol-style" => options.ignore_eol_style = true,
                "-p" | "--show-c-function" => options.show_c_function = true,
                "-u" | "--unified" => {}
                other => return Err(DiffError::InvalidOption(other.to_string())),
            }
        }
        Ok(options)
    }
}
