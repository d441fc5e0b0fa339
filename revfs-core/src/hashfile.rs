//! Length-prefixed key/value hash serialisation.
//!
//! The dump format is shared by node properties, revision properties and
//! directory contents:
//!
//! ```text
//! K <key length>\n<key>\nV <value length>\n<value>\n ... END\n
//! ```
//!
//! Mutable directories additionally append incremental entries after the
//! base dump: `K`/`V` pairs overwrite an entry, `D <length>\n<name>\n`
//! removes one. Incremental streams have no terminator; they run to EOF.

use crate::error::{FsError, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};

/// Ordered key/value map used for props and directory contents.
pub type HashMapOrdered = BTreeMap<String, String>;

const TERMINATOR: &str = "END";

/// Read one `\n`-terminated line without the newline. Returns None at EOF.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        return Err(FsError::corrupt("hash file line missing newline"));
    }
    line.pop();
    Ok(Some(line))
}

/// Read exactly LEN bytes followed by a newline.
fn read_sized<R: BufRead>(reader: &mut R, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len + 1];
    reader.read_exact(&mut buf)?;
    if buf.pop() != Some(b'\n') {
        return Err(FsError::corrupt("hash file entry missing newline"));
    }
    String::from_utf8(buf).map_err(|_| FsError::corrupt("hash file entry is not valid UTF-8"))
}

fn parse_len(line: &str, prefix: char) -> Result<usize> {
    let rest = line
        .strip_prefix(prefix)
        .and_then(|r| r.strip_prefix(' '))
        .ok_or_else(|| FsError::corrupt(format!("malformed hash file line '{}'", line)))?;
    rest.parse()
        .map_err(|_| FsError::corrupt(format!("malformed hash file length '{}'", line)))
}

/// Read a terminated hash dump into a fresh map.
pub fn read_hash<R: BufRead>(reader: &mut R) -> Result<HashMapOrdered> {
    let mut hash = HashMapOrdered::new();
    loop {
        let line = match read_line(reader)? {
            Some(line) => line,
            None => return Err(FsError::corrupt("hash file ended before terminator")),
        };
        if line == TERMINATOR {
            return Ok(hash);
        }
        let klen = parse_len(&line, 'K')?;
        let key = read_sized(reader, klen)?;

        let vline = read_line(reader)?
            .ok_or_else(|| FsError::corrupt("hash file ended inside an entry"))?;
        let vlen = parse_len(&vline, 'V')?;
        let value = read_sized(reader, vlen)?;

        hash.insert(key, value);
    }
}

/// Replay incremental entries onto HASH until EOF.
pub fn read_incremental<R: BufRead>(reader: &mut R, hash: &mut HashMapOrdered) -> Result<()> {
    loop {
        let line = match read_line(reader)? {
            Some(line) => line,
            None => return Ok(()),
        };
        if line.is_empty() {
            continue;
        }
        match line.as_bytes()[0] {
            b'K' => {
                let klen = parse_len(&line, 'K')?;
                let key = read_sized(reader, klen)?;
                let vline = read_line(reader)?
                    .ok_or_else(|| FsError::corrupt("incremental entry missing value"))?;
                let vlen = parse_len(&vline, 'V')?;
                let value = read_sized(reader, vlen)?;
                hash.insert(key, value);
            }
            b'D' => {
                let klen = parse_len(&line, 'D')?;
                let key = read_sized(reader, klen)?;
                hash.remove(&key);
            }
            _ => {
                return Err(FsError::corrupt(format!(
                    "malformed incremental hash line '{}'",
                    line
                )))
            }
        }
    }
}

/// Write HASH as a terminated dump.
pub fn write_hash<W: Write>(writer: &mut W, hash: &HashMapOrdered) -> Result<()> {
    for (key, value) in hash {
        write_entry(writer, key, value)?;
    }
    writer.write_all(TERMINATOR.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Write one `K`/`V` pair (also the incremental "set" form).
pub fn write_entry<W: Write>(writer: &mut W, key: &str, value: &str) -> Result<()> {
    write!(writer, "K {}\n{}\nV {}\n{}\n", key.len(), key, value.len(), value)?;
    Ok(())
}

/// Write one incremental delete entry.
pub fn write_delete<W: Write>(writer: &mut W, key: &str) -> Result<()> {
    write!(writer, "D {}\n{}\n", key.len(), key)?;
    Ok(())
}
