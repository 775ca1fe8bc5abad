//! Client-side open-file state.

use std::sync::Mutex;

use bitflags::bitflags;

bitflags! {
    /// Open flags tracked per descriptor. A deliberately small subset of
    /// the kernel's: what the operation layer actually consults.
    pub struct OpenFlags: u32 {
        const APPEND  = 1 << 0;
        const CREAT   = 1 << 1;
        const TRUNC   = 1 << 2;
        const RDONLY  = 1 << 3;
        const WRONLY  = 1 << 4;
        const RDWR    = 1 << 5;
        const CLOEXEC = 1 << 6;
        const EXCL    = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// State behind one descriptor index. Owned by the open-file map; the
/// rest of the client refers to it by index only. Position and flags get
/// their own locks because a descriptor duplicated with `dup` is shared
/// between threads.
#[derive(Debug)]
pub struct OpenFile {
    path: String,
    kind: FileKind,
    flags: Mutex<OpenFlags>,
    pos: Mutex<u64>,
    // directory snapshot captured at opendir time; empty for files
    entries: Vec<DirEntry>,
}

impl OpenFile {
    pub fn new(path: &str, flags: OpenFlags) -> Self {
        OpenFile {
            path: path.to_string(),
            kind: FileKind::Regular,
            flags: Mutex::new(flags),
            pos: Mutex::new(0),
            entries: Vec::new(),
        }
    }

    pub fn new_dir(path: &str, entries: Vec<DirEntry>) -> Self {
        OpenFile {
            path: path.to_string(),
            kind: FileKind::Directory,
            flags: Mutex::new(OpenFlags::RDONLY),
            pos: Mutex::new(0),
            entries,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn pos(&self) -> u64 {
        *self.pos.lock().unwrap()
    }

    pub fn set_pos(&self, pos: u64) {
        *self.pos.lock().unwrap() = pos;
    }

    pub fn flag(&self, flag: OpenFlags) -> bool {
        self.flags.lock().unwrap().contains(flag)
    }

    pub fn set_flag(&self, flag: OpenFlags, value: bool) {
        self.flags.lock().unwrap().set(flag, value);
    }

    /// Snapshot entry at `index`, for readdir cursors.
    pub fn entry_at(&self, index: usize) -> Option<&DirEntry> {
        self.entries.get(index)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}
