use fuser::FUSE_ROOT_ID;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Inode number reported by readdir for entries the kernel has not looked up.
pub(crate) const UNKNOWN_INO: u64 = 0xffff_ffff;

#[derive(Debug)]
struct Node {
    path: PathBuf,
    /// Lookups the kernel still holds; the node is dropped when it reaches 0.
    lookups: u64,
}

/// Inode numbers for virtual paths.
///
/// Paths are relative to the mount root and keep their invocation suffix,
/// so `report` and `report?daily` are distinct inodes. Only paths that were
/// successfully looked up get an inode, and each one lives until the kernel
/// forgets every lookup of it.
#[derive(Debug)]
pub(crate) struct InodeTable {
    nodes: HashMap<u64, Node>,
    inodes: HashMap<PathBuf, u64>,
    next: u64,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        let mut table = Self {
            nodes: HashMap::new(),
            inodes: HashMap::new(),
            next: FUSE_ROOT_ID + 1,
        };
        table.nodes.insert(
            FUSE_ROOT_ID,
            Node {
                path: PathBuf::new(),
                lookups: 1,
            },
        );
        table.inodes.insert(PathBuf::new(), FUSE_ROOT_ID);
        table
    }

    pub(crate) fn path(&self, ino: u64) -> Option<&Path> {
        self.nodes.get(&ino).map(|node| node.path.as_path())
    }

    /// Path of `name` inside directory `parent`. Allocates nothing.
    pub(crate) fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        Some(self.path(parent)?.join(name))
    }

    /// Inode already assigned to `path`, if any.
    pub(crate) fn existing(&self, path: &Path) -> Option<u64> {
        self.inodes.get(path).copied()
    }

    /// Record one kernel lookup of `path`, assigning an inode on the first.
    pub(crate) fn remember(&mut self, path: PathBuf) -> u64 {
        if let Some(&ino) = self.inodes.get(&path) {
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.lookups += 1;
            }
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.inodes.insert(path.clone(), ino);
        self.nodes.insert(ino, Node { path, lookups: 1 });
        ino
    }

    /// Drop `nlookup` lookups of `ino`, freeing it once none remain.
    pub(crate) fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let Some(node) = self.nodes.get_mut(&ino) else {
            return;
        };
        node.lookups = node.lookups.saturating_sub(nlookup);
        if node.lookups == 0 {
            if let Some(node) = self.nodes.remove(&ino) {
                self.inodes.remove(&node.path);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}
