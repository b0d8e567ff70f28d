use crate::resolver::VirtualPath;
use execfs_runtime::ExecSession;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// File handle issued on open.
pub type Handle = u64;

/// An open exec-on-open file.
#[derive(Debug)]
pub struct OpenFile {
    pub session: Arc<ExecSession>,
    pub path: VirtualPath,
    /// Opened with write access.
    pub writable: bool,
}

/// Handle to open-file mapping shared by all dispatcher threads.
///
/// Callers receive `Arc` clones for the duration of one operation; once
/// [`HandleTable::remove`] returns, the table holds no reference and no new
/// lookups can reach the session.
#[derive(Debug)]
pub struct HandleTable {
    next: AtomicU64,
    files: RwLock<HashMap<Handle, Arc<OpenFile>>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            // 0 is never issued
            next: AtomicU64::new(1),
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Store `file` under a fresh handle.
    pub fn register(&self, file: OpenFile) -> Handle {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, Arc::new(file));
        handle
    }

    pub fn lookup(&self, handle: Handle) -> Option<Arc<OpenFile>> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
    }

    /// Remove `handle`. Only the first of several concurrent removals wins.
    pub fn remove(&self, handle: Handle) -> Option<Arc<OpenFile>> {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
    }

    /// Remove every entry, returning them for cleanup.
    pub fn take_all(&self) -> Vec<(Handle, Arc<OpenFile>)> {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
