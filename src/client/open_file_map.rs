//! The process-wide table of open descriptors.
//!
//! Descriptor indices start at a high constant to keep out of the way of
//! descriptors the kernel hands out for files this library does not
//! intercept; kernel descriptors are small and reused, ours only grow.
//! `dup` family calls share the underlying open-file state by refcount.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::client::open_file::{FileKind, OpenFile};
use crate::config;
use crate::error::{FsError, FsResult};

pub struct OpenFileMap {
    files: Mutex<HashMap<i32, Arc<OpenFile>>>,
    fd_idx: Mutex<i32>,
}

impl Default for OpenFileMap {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileMap {
    pub fn new() -> Self {
        OpenFileMap {
            files: Mutex::new(HashMap::new()),
            fd_idx: Mutex::new(config::client::FD_START),
        }
    }

    pub fn get(&self, fd: i32) -> Option<Arc<OpenFile>> {
        self.files.lock().unwrap().get(&fd).cloned()
    }

    pub fn get_dir(&self, fd: i32) -> Option<Arc<OpenFile>> {
        self.get(fd).filter(|f| f.kind() == FileKind::Directory)
    }

    pub fn exist(&self, fd: i32) -> bool {
        self.files.lock().unwrap().contains_key(&fd)
    }

    /// Register open-file state and hand out its descriptor index.
    pub fn add(&self, file: OpenFile) -> i32 {
        let file = Arc::new(file);
        let mut files = self.files.lock().unwrap();
        loop {
            let fd = self.generate_fd_idx();
            if files.contains_key(&fd) {
                continue; // index survived a wraparound, skip it
            }
            files.insert(fd, Arc::clone(&file));
            return fd;
        }
    }

    /// Drop a descriptor. The state itself lives until the last duplicate
    /// goes away.
    pub fn remove(&self, fd: i32) -> bool {
        self.files.lock().unwrap().remove(&fd).is_some()
    }

    pub fn dup(&self, oldfd: i32) -> FsResult<i32> {
        let file = self.get(oldfd).ok_or(FsError::BadDescriptor)?;
        let mut files = self.files.lock().unwrap();
        loop {
            let fd = self.generate_fd_idx();
            if files.contains_key(&fd) {
                continue;
            }
            files.insert(fd, Arc::clone(&file));
            return Ok(fd);
        }
    }

    pub fn dup2(&self, oldfd: i32, newfd: i32) -> FsResult<i32> {
        let file = self.get(oldfd).ok_or(FsError::BadDescriptor)?;
        if oldfd == newfd {
            return Ok(newfd);
        }
        // an open descriptor at newfd is implicitly closed
        self.files.lock().unwrap().insert(newfd, file);
        Ok(newfd)
    }

    fn generate_fd_idx(&self) -> i32 {
        let mut idx = self.fd_idx.lock().unwrap();
        if *idx == i32::MAX {
            *idx = config::client::FD_START;
        }
        let fd = *idx;
        *idx += 1;
        fd
    }
}
