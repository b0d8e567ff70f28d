use crate::error::Fault;
use crate::resolver::Target;
use serde::Deserialize;
use std::fs::{self, Metadata};
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Kind of a virtual node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// Size reported for an executable before its output is known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizePolicy {
    /// The backing executable's own size.
    #[default]
    Backing,
    /// Zero.
    Zero,
}

/// Attributes of a virtual node, recomputed on every query.
///
/// For executables the size is an estimate: the placeholder chosen by
/// [`SizePolicy`], or the current output length when an open handle is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSnapshot {
    pub kind: NodeKind,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl AttributeSnapshot {
    /// Snapshot for a resolved target.
    ///
    /// `output_len` is the length of an open session's output, if the query
    /// came with a handle. The backing file is re-read here, so a target that
    /// vanished since resolution yields [`Fault::NotFound`].
    pub fn of(
        target: &Target,
        size_policy: SizePolicy,
        output_len: Option<u64>,
    ) -> Result<Self, Fault> {
        let metadata = fs::metadata(target.backing())?;
        let mode = metadata.mode();

        let (kind, perm, size) = match target {
            Target::Directory(_) => (NodeKind::Directory, mode & 0o7777, metadata.size()),
            Target::Executable(_) => {
                let size = output_len.unwrap_or(match size_policy {
                    SizePolicy::Backing => metadata.size(),
                    SizePolicy::Zero => 0,
                });
                (NodeKind::File, executable_perm(mode), size)
            }
            Target::Plain(_) => (NodeKind::File, plain_perm(mode), metadata.size()),
        };

        Ok(Self::from_metadata(&metadata, kind, perm as u16, size))
    }

    fn from_metadata(metadata: &Metadata, kind: NodeKind, perm: u16, size: u64) -> Self {
        Self {
            kind,
            size,
            perm,
            nlink: metadata.nlink() as u32,
            uid: metadata.uid(),
            gid: metadata.gid(),
            atime: timestamp(metadata.atime(), metadata.atime_nsec()),
            mtime: timestamp(metadata.mtime(), metadata.mtime_nsec()),
            ctime: timestamp(metadata.ctime(), metadata.ctime_nsec()),
        }
    }
}

/// Permissions of an exec-on-open file: not executable, always readable.
pub fn executable_perm(mode: u32) -> u32 {
    (mode & 0o666) | 0o444
}

/// Permissions of a non-executable file: neither readable nor executable.
pub fn plain_perm(mode: u32) -> u32 {
    mode & 0o222
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}
