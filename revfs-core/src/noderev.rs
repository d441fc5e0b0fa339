//! Node-revision header blocks and representation pointers.
//!
//! A node-revision is stored as a block of `name: value` lines terminated
//! by a blank line. Representation values are
//! `<rev> <offset> <size> <expanded> <md5hex>` with the literal `-1` in the
//! revision slot for mutable reps; property and directory reps of mutable
//! node-revisions are truncated to just `-1` (the data lives in the
//! transaction staging area instead).

use crate::error::{FsError, Result};
use crate::id::NodeRevId;
use std::collections::HashMap;
use std::io::{BufRead, Write};

const HEADER_ID: &str = "id";
const HEADER_TYPE: &str = "type";
const HEADER_COUNT: &str = "count";
const HEADER_PROPS: &str = "props";
const HEADER_TEXT: &str = "text";
const HEADER_CPATH: &str = "cpath";
const HEADER_PRED: &str = "pred";
const HEADER_COPYFROM: &str = "copyfrom";
const HEADER_COPYROOT: &str = "copyroot";

const KIND_FILE: &str = "file";
const KIND_DIR: &str = "dir";

/// Kind of a node-revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => KIND_FILE,
            NodeKind::Dir => KIND_DIR,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            KIND_FILE => Ok(NodeKind::File),
            KIND_DIR => Ok(NodeKind::Dir),
            _ => Err(FsError::corrupt(format!("unknown node kind '{}'", s))),
        }
    }
}

/// Where a representation's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepLocation {
    /// In a published revision file.
    Revision(u64),
    /// In the prototype rev file (or staging files) of a transaction.
    Txn(String),
}

/// Pointer to a byte sequence stored in a revision or transaction file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    pub location: RepLocation,
    pub offset: u64,
    /// On-disk size of the rep body (svndiff or plain bytes).
    pub size: u64,
    /// Size of the fully expanded byte stream.
    pub expanded_size: u64,
    /// MD5 digest of the expanded bytes.
    pub md5: [u8; 16],
}

impl Representation {
    /// A fresh mutable rep belonging to TXN_ID with no data recorded yet.
    pub fn new_mutable(txn_id: impl Into<String>) -> Self {
        Self {
            location: RepLocation::Txn(txn_id.into()),
            offset: 0,
            size: 0,
            expanded_size: 0,
            md5: [0; 16],
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self.location, RepLocation::Txn(_))
    }

    pub fn txn_id(&self) -> Option<&str> {
        match &self.location {
            RepLocation::Txn(t) => Some(t),
            RepLocation::Revision(_) => None,
        }
    }

    pub fn revision(&self) -> Option<u64> {
        match self.location {
            RepLocation::Revision(rev) => Some(rev),
            RepLocation::Txn(_) => None,
        }
    }

    /// Two reps point at the same stored bytes if revision and offset agree.
    pub fn same_key(a: Option<&Representation>, b: Option<&Representation>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => a.offset == b.offset && a.location == b.location,
            _ => false,
        }
    }

    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }

    /// Parse a rep offsets value. TXN_ID supplies the owning transaction
    /// when the revision slot holds `-1`; MUTABLE_TRUNCATED marks prop and
    /// directory reps that carry no further fields in that case.
    pub fn parse(value: &str, txn_id: Option<&str>, mutable_truncated: bool) -> Result<Self> {
        let corrupt = || FsError::corrupt(format!("malformed rep offsets line '{}'", value));
        let mut fields = value.split_ascii_whitespace();

        let rev_str = fields.next().ok_or_else(corrupt)?;
        let location = if rev_str == "-1" {
            let txn_id = txn_id.ok_or_else(corrupt)?;
            let loc = RepLocation::Txn(txn_id.to_string());
            if mutable_truncated {
                return Ok(Self {
                    location: loc,
                    offset: 0,
                    size: 0,
                    expanded_size: 0,
                    md5: [0; 16],
                });
            }
            loc
        } else {
            RepLocation::Revision(rev_str.parse().map_err(|_| corrupt())?)
        };

        let offset = fields.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
        let size = fields.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;
        let expanded_size = fields.next().ok_or_else(corrupt)?.parse().map_err(|_| corrupt())?;

        let md5_str = fields.next().ok_or_else(corrupt)?;
        let md5_vec = hex::decode(md5_str).map_err(|_| corrupt())?;
        let md5: [u8; 16] = md5_vec.try_into().map_err(|_| corrupt())?;

        if fields.next().is_some() {
            return Err(corrupt());
        }

        Ok(Self {
            location,
            offset,
            size,
            expanded_size,
            md5,
        })
    }

    /// Render the rep offsets value for a node-rev header.
    pub fn unparse(&self, mutable_truncated: bool) -> String {
        match &self.location {
            RepLocation::Txn(_) if mutable_truncated => "-1".to_string(),
            RepLocation::Txn(_) => format!(
                "-1 {} {} {} {}",
                self.offset,
                self.size,
                self.expanded_size,
                self.md5_hex()
            ),
            RepLocation::Revision(rev) => format!(
                "{} {} {} {} {}",
                rev,
                self.offset,
                self.size,
                self.expanded_size,
                self.md5_hex()
            ),
        }
    }
}

/// One file or directory at one point in history.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRevision {
    pub id: NodeRevId,
    pub kind: NodeKind,
    pub predecessor_id: Option<NodeRevId>,
    pub predecessor_count: u64,
    pub data_rep: Option<Representation>,
    pub prop_rep: Option<Representation>,
    /// Canonical tree path at which this node-revision was created.
    pub created_path: String,
    /// Source of a cross-history copy, if any.
    pub copyfrom: Option<(u64, String)>,
    /// Nearest ancestor that originated a copy. None means "this revision",
    /// resolved when the node-rev is committed.
    pub copyroot_rev: Option<u64>,
    pub copyroot_path: String,
}

impl NodeRevision {
    /// True if the directory's contents live in the transaction staging
    /// area rather than in a published representation.
    pub fn has_mutable_dir_contents(&self) -> bool {
        self.kind == NodeKind::Dir
            && self.data_rep.as_ref().is_some_and(Representation::is_mutable)
    }

    /// Read the header block that starts at the reader's current position.
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        let headers = read_header_block(reader)?;

        let id_str = headers
            .get(HEADER_ID)
            .ok_or_else(|| FsError::corrupt("missing id in node-rev"))?;
        let id = NodeRevId::parse(id_str)?;
        let txn_id = id.txn_id().map(str::to_string);

        let kind = NodeKind::parse(
            headers
                .get(HEADER_TYPE)
                .ok_or_else(|| FsError::corrupt("missing kind field in node-rev"))?,
        )?;

        let predecessor_count = match headers.get(HEADER_COUNT) {
            Some(v) => v
                .parse()
                .map_err(|_| FsError::corrupt("malformed count in node-rev"))?,
            None => 0,
        };

        let prop_rep = headers
            .get(HEADER_PROPS)
            .map(|v| Representation::parse(v, txn_id.as_deref(), true))
            .transpose()?;

        let data_rep = headers
            .get(HEADER_TEXT)
            .map(|v| Representation::parse(v, txn_id.as_deref(), kind == NodeKind::Dir))
            .transpose()?;

        let created_path = headers
            .get(HEADER_CPATH)
            .ok_or_else(|| FsError::corrupt("missing cpath in node-rev"))?
            .clone();

        let predecessor_id = headers
            .get(HEADER_PRED)
            .map(|v| NodeRevId::parse(v))
            .transpose()?;

        let (copyroot_rev, copyroot_path) = match headers.get(HEADER_COPYROOT) {
            None => (id.rev(), created_path.clone()),
            Some(v) => {
                let (rev, path) = v
                    .split_once(' ')
                    .ok_or_else(|| FsError::corrupt("malformed copyroot line in node-rev"))?;
                let rev = rev
                    .parse()
                    .map_err(|_| FsError::corrupt("malformed copyroot line in node-rev"))?;
                (Some(rev), path.to_string())
            }
        };

        let copyfrom = match headers.get(HEADER_COPYFROM) {
            None => None,
            Some(v) => {
                let (rev, path) = v
                    .split_once(' ')
                    .ok_or_else(|| FsError::corrupt("malformed copyfrom line in node-rev"))?;
                let rev = rev
                    .parse()
                    .map_err(|_| FsError::corrupt("malformed copyfrom line in node-rev"))?;
                Some((rev, path.to_string()))
            }
        };

        Ok(Self {
            id,
            kind,
            predecessor_id,
            predecessor_count,
            data_rep,
            prop_rep,
            created_path,
            copyfrom,
            copyroot_rev,
            copyroot_path,
        })
    }

    /// Write the header block, including the trailing blank line.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writeln!(writer, "{}: {}", HEADER_ID, self.id)?;
        writeln!(writer, "{}: {}", HEADER_TYPE, self.kind.as_str())?;

        if let Some(pred) = &self.predecessor_id {
            writeln!(writer, "{}: {}", HEADER_PRED, pred)?;
        }

        writeln!(writer, "{}: {}", HEADER_COUNT, self.predecessor_count)?;

        if let Some(rep) = &self.data_rep {
            writeln!(
                writer,
                "{}: {}",
                HEADER_TEXT,
                rep.unparse(self.kind == NodeKind::Dir)
            )?;
        }

        if let Some(rep) = &self.prop_rep {
            writeln!(writer, "{}: {}", HEADER_PROPS, rep.unparse(true))?;
        }

        writeln!(writer, "{}: {}", HEADER_CPATH, self.created_path)?;

        if let Some((rev, path)) = &self.copyfrom {
            writeln!(writer, "{}: {} {}", HEADER_COPYFROM, rev, path)?;
        }

        // Copyroot defaulting to self is left implicit on disk.
        if self.copyroot_rev != self.id.rev() || self.copyroot_path != self.created_path {
            let rev = self.copyroot_rev.unwrap_or(0);
            writeln!(writer, "{}: {} {}", HEADER_COPYROOT, rev, self.copyroot_path)?;
        }

        writeln!(writer)?;
        Ok(())
    }
}

/// Read `name: value` lines up to (and consuming) the blank terminator.
pub fn read_header_block<R: BufRead>(reader: &mut R) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Err(FsError::corrupt("unexpected EOF in node-rev header block"));
        }
        if line.ends_with('\n') {
            line.pop();
        }
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(": ")
            .ok_or_else(|| FsError::corrupt("found malformed header in revision file"))?;
        headers.insert(name.to_string(), value.to_string());
    }
}
