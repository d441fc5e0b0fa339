//! svndiff binary delta streams.
//!
//! A delta stream is the 4-byte magic `SVN\0` followed by a sequence of
//! windows. Each window declares a source view (absolute offset and length
//! into the base stream) and a target view length, then carries an
//! instruction stream (source-copy, target-copy, new-data insert) plus the
//! literal new data. Integers are encoded base-128, most significant group
//! first, with the high bit marking continuation.

use crate::error::{FsError, Result};
use std::io::{Read, Write};

/// Stream magic for svndiff version 0.
pub const SVNDIFF_MAGIC: [u8; 4] = *b"SVN\0";

/// Bytes of target view produced per window.
pub const WINDOW_SIZE: u64 = 102_400;

/// One delta instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Copy LEN bytes from OFFSET in the source view.
    CopySource { offset: u64, len: u64 },
    /// Copy LEN bytes from OFFSET in the target view built so far
    /// (ranges may overlap forward).
    CopyTarget { offset: u64, len: u64 },
    /// Insert the next LEN bytes of the window's new data.
    New { len: u64 },
}

/// One decoded delta window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub sview_offset: u64,
    pub sview_len: u64,
    pub tview_len: u64,
    pub instructions: Vec<Instruction>,
    pub new_data: Vec<u8>,
}

impl Window {
    /// Number of instructions referencing the source view. A window with
    /// zero source ops cuts the delta chain for its chunk.
    pub fn src_ops(&self) -> usize {
        self.instructions
            .iter()
            .filter(|i| matches!(i, Instruction::CopySource { .. }))
            .count()
    }

    /// Apply the window against SOURCE (the bytes of its source view),
    /// producing exactly `tview_len` bytes.
    pub fn apply(&self, source: &[u8]) -> Result<Vec<u8>> {
        let mut out: Vec<u8> = Vec::with_capacity(self.tview_len as usize);
        let mut new_pos = 0usize;

        for instr in &self.instructions {
            match *instr {
                Instruction::CopySource { offset, len } => {
                    let start = offset as usize;
                    let end = start
                        .checked_add(len as usize)
                        .ok_or_else(|| FsError::corrupt("svndiff source copy overflows"))?;
                    if end > source.len() {
                        return Err(FsError::corrupt(
                            "svndiff requested position beyond end of stream",
                        ));
                    }
                    out.extend_from_slice(&source[start..end]);
                }
                Instruction::CopyTarget { offset, len } => {
                    let start = offset as usize;
                    if start >= out.len() {
                        return Err(FsError::corrupt("svndiff target copy before any output"));
                    }
                    // Overlapping forward copy: extend one byte at a time.
                    for i in 0..len as usize {
                        let b = out[start + i];
                        out.push(b);
                    }
                }
                Instruction::New { len } => {
                    let end = new_pos + len as usize;
                    if end > self.new_data.len() {
                        return Err(FsError::corrupt("svndiff new data exhausted"));
                    }
                    out.extend_from_slice(&self.new_data[new_pos..end]);
                    new_pos = end;
                }
            }
        }

        if out.len() as u64 != self.tview_len {
            return Err(FsError::corrupt("svndiff window length is corrupt"));
        }
        Ok(out)
    }

    /// Read one window from the reader. The stream magic must already have
    /// been consumed.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let sview_offset = read_varint(reader)?;
        let sview_len = read_varint(reader)?;
        let tview_len = read_varint(reader)?;
        let ins_len = read_varint(reader)? as usize;
        let new_len = read_varint(reader)? as usize;

        let mut ins_bytes = vec![0u8; ins_len];
        reader.read_exact(&mut ins_bytes)?;
        let mut new_data = vec![0u8; new_len];
        reader.read_exact(&mut new_data)?;

        let instructions = decode_instructions(&ins_bytes)?;

        Ok(Self {
            sview_offset,
            sview_len,
            tview_len,
            instructions,
            new_data,
        })
    }

    /// Read past one window without materialising it. Returns the number of
    /// bytes consumed and the window's target view length.
    pub fn skip<R: Read>(reader: &mut R) -> Result<(u64, u64)> {
        let mut consumed = 0u64;
        let (_, n) = read_varint_counted(reader)?;
        consumed += n;
        let (_, n) = read_varint_counted(reader)?;
        consumed += n;
        let (tview_len, n) = read_varint_counted(reader)?;
        consumed += n;
        let (ins_len, n) = read_varint_counted(reader)?;
        consumed += n;
        let (new_len, n) = read_varint_counted(reader)?;
        consumed += n;

        let body = ins_len + new_len;
        std::io::copy(&mut reader.take(body), &mut std::io::sink())?;
        consumed += body;
        Ok((consumed, tview_len))
    }

    /// Serialise the window.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut ins_bytes = Vec::new();
        for instr in &self.instructions {
            encode_instruction(&mut ins_bytes, instr);
        }

        write_varint(writer, self.sview_offset)?;
        write_varint(writer, self.sview_len)?;
        write_varint(writer, self.tview_len)?;
        write_varint(writer, ins_bytes.len() as u64)?;
        write_varint(writer, self.new_data.len() as u64)?;
        writer.write_all(&ins_bytes)?;
        writer.write_all(&self.new_data)?;
        Ok(())
    }

    /// Build a window deltifying TARGET against SOURCE (the bytes of the
    /// source view starting at SVIEW_OFFSET in the base stream). Identical
    /// leading and trailing runs become source copies; the remainder is
    /// inserted literally.
    pub fn deltify(sview_offset: u64, source: &[u8], target: &[u8]) -> Self {
        let mut instructions = Vec::new();
        let mut new_data = Vec::new();

        let prefix = source
            .iter()
            .zip(target.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let suffix = source[prefix..]
            .iter()
            .rev()
            .zip(target[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        if prefix > 0 {
            instructions.push(Instruction::CopySource {
                offset: 0,
                len: prefix as u64,
            });
        }
        let middle = &target[prefix..target.len() - suffix];
        if !middle.is_empty() {
            instructions.push(Instruction::New {
                len: middle.len() as u64,
            });
            new_data.extend_from_slice(middle);
        }
        if suffix > 0 {
            instructions.push(Instruction::CopySource {
                offset: (source.len() - suffix) as u64,
                len: suffix as u64,
            });
        }

        Self {
            sview_offset,
            sview_len: source.len() as u64,
            tview_len: target.len() as u64,
            instructions,
            new_data,
        }
    }
}

/// Read and verify the 4-byte stream magic.
pub fn read_magic<R: Read>(reader: &mut R) -> Result<()> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    if buf[..3] != SVNDIFF_MAGIC[..3] {
        return Err(FsError::corrupt("malformed svndiff data in representation"));
    }
    if buf[3] != 0 {
        return Err(FsError::corrupt(format!(
            "unsupported svndiff version {}",
            buf[3]
        )));
    }
    Ok(())
}

pub fn write_magic<W: Write>(writer: &mut W) -> Result<()> {
    writer.write_all(&SVNDIFF_MAGIC)?;
    Ok(())
}

fn read_varint<R: Read>(reader: &mut R) -> Result<u64> {
    Ok(read_varint_counted(reader)?.0)
}

fn read_varint_counted<R: Read>(reader: &mut R) -> Result<(u64, u64)> {
    let mut value = 0u64;
    let mut count = 0u64;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        count += 1;
        if count > 10 {
            return Err(FsError::corrupt("svndiff integer too long"));
        }
        value = (value << 7) | (byte[0] & 0x7f) as u64;
        if byte[0] & 0x80 == 0 {
            return Ok((value, count));
        }
    }
}

fn write_varint<W: Write>(writer: &mut W, mut value: u64) -> Result<()> {
    let mut buf = [0u8; 10];
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    let last = buf.len() - 1;
    for b in &mut buf[pos..last] {
        *b |= 0x80;
    }
    writer.write_all(&buf[pos..])?;
    Ok(())
}

const OP_SOURCE: u8 = 0;
const OP_TARGET: u8 = 1;
const OP_NEW: u8 = 2;

fn encode_instruction(out: &mut Vec<u8>, instr: &Instruction) {
    let (op, len, offset) = match *instr {
        Instruction::CopySource { offset, len } => (OP_SOURCE, len, Some(offset)),
        Instruction::CopyTarget { offset, len } => (OP_TARGET, len, Some(offset)),
        Instruction::New { len } => (OP_NEW, len, None),
    };
    if len > 0 && len < 64 {
        out.push((op << 6) | len as u8);
    } else {
        out.push(op << 6);
        write_varint(out, len).expect("writing to Vec cannot fail");
    }
    if let Some(offset) = offset {
        write_varint(out, offset).expect("writing to Vec cannot fail");
    }
}

fn decode_instructions(mut bytes: &[u8]) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    while !bytes.is_empty() {
        let selector = bytes[0];
        bytes = &bytes[1..];
        let op = selector >> 6;
        let mut len = (selector & 0x3f) as u64;
        if len == 0 {
            len = read_varint(&mut bytes)?;
        }
        let instr = match op {
            OP_SOURCE => Instruction::CopySource {
                offset: read_varint(&mut bytes)?,
                len,
            },
            OP_TARGET => Instruction::CopyTarget {
                offset: read_varint(&mut bytes)?,
                len,
            },
            OP_NEW => Instruction::New { len },
            _ => return Err(FsError::corrupt("invalid svndiff instruction opcode")),
        };
        instructions.push(instr);
    }
    Ok(instructions)
}
