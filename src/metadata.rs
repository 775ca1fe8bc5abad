//! The per-path metadata record.
//!
//! One record exists per path; it is the value stored in the metadata KV
//! engine and travels over the wire in serialized form. The encoding is a
//! `|`-delimited ASCII string with a fixed field order, so the KV merge
//! operator can patch the size field after parsing only a prefix. Optional
//! fields are present exactly when the corresponding build toggle in
//! [`crate::config::metadata`] is enabled; both sides of the wire share
//! those toggles.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::config;
use crate::error::{FsError, FsResult};

/// Field separator of the serialized record.
const MSP: char = '|';

/// Mode bits of a symbolic link record.
pub const LINK_MODE: u32 = libc::S_IFLNK | 0o777;

fn epoch_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    atime: i64,
    mtime: i64,
    ctime: i64,
    mode: u32,
    link_count: u64,
    size: u64,
    blocks: u64,
    // non-empty iff mode encodes a symbolic link; stored verbatim
    target_path: String,
}

impl Metadata {
    /// Default record for a fresh regular file or directory.
    pub fn new(mode: u32) -> Self {
        Metadata {
            atime: 0,
            mtime: 0,
            ctime: 0,
            mode,
            link_count: 1,
            size: 0,
            blocks: 0,
            target_path: String::new(),
        }
    }

    /// Record for a symbolic link pointing at `target_path`.
    pub fn new_symlink(target_path: &str) -> Self {
        let mut md = Metadata::new(LINK_MODE);
        md.target_path = target_path.to_string();
        md
    }

    pub fn deserialize(serialized: &str) -> FsResult<Self> {
        let malformed =
            |what: &str| FsError::InvalidArgument(format!("malformed metadata ({})", what));

        let mut fields = serialized.split(MSP);
        let mut next = |what: &'static str| fields.next().ok_or_else(|| malformed(what));

        let mode = next("mode")?.parse::<u32>().map_err(|_| malformed("mode"))?;
        let size = next("size")?.parse::<u64>().map_err(|_| malformed("size"))?;

        let mut md = Metadata::new(mode);
        md.size = size;

        if config::metadata::USE_ATIME {
            md.atime = next("atime")?.parse().map_err(|_| malformed("atime"))?;
        }
        if config::metadata::USE_MTIME {
            md.mtime = next("mtime")?.parse().map_err(|_| malformed("mtime"))?;
        }
        if config::metadata::USE_CTIME {
            md.ctime = next("ctime")?.parse().map_err(|_| malformed("ctime"))?;
        }
        if config::metadata::USE_LINK_CNT {
            md.link_count = next("link count")?
                .parse()
                .map_err(|_| malformed("link count"))?;
        }
        if config::metadata::USE_BLOCKS {
            md.blocks = next("blocks")?.parse().map_err(|_| malformed("blocks"))?;
        }

        md.target_path = next("target path")?.to_string();
        if fields.next().is_some() {
            return Err(malformed("trailing fields"));
        }
        Ok(md)
    }

    /// Serialize into the delimited wire/KV form. The field order is part
    /// of the stored format; don't change it.
    pub fn serialize(&self) -> String {
        let mut s = String::with_capacity(32 + self.target_path.len());
        s.push_str(&self.mode.to_string());
        s.push(MSP);
        s.push_str(&self.size.to_string());
        if config::metadata::USE_ATIME {
            s.push(MSP);
            s.push_str(&self.atime.to_string());
        }
        if config::metadata::USE_MTIME {
            s.push(MSP);
            s.push_str(&self.mtime.to_string());
        }
        if config::metadata::USE_CTIME {
            s.push(MSP);
            s.push_str(&self.ctime.to_string());
        }
        if config::metadata::USE_LINK_CNT {
            s.push(MSP);
            s.push_str(&self.link_count.to_string());
        }
        if config::metadata::USE_BLOCKS {
            s.push(MSP);
            s.push_str(&self.blocks.to_string());
        }
        s.push(MSP);
        s.push_str(&self.target_path);
        s
    }

    /// Set every tracked timestamp to the current time.
    pub fn init_times(&mut self) {
        let now = epoch_now();
        self.atime = now;
        self.mtime = now;
        self.ctime = now;
    }

    /// Refresh the selected timestamps.
    pub fn update_times(&mut self, atime: bool, ctime: bool, mtime: bool) {
        let now = epoch_now();
        if atime {
            self.atime = now;
        }
        if ctime {
            self.ctime = now;
        }
        if mtime {
            self.mtime = now;
        }
    }

    pub fn atime(&self) -> i64 {
        self.atime
    }

    pub fn set_atime(&mut self, atime: i64) {
        self.atime = atime;
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn set_mtime(&mut self, mtime: i64) {
        self.mtime = mtime;
    }

    pub fn ctime(&self) -> i64 {
        self.ctime
    }

    pub fn set_ctime(&mut self, ctime: i64) {
        self.ctime = ctime;
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.mode = mode;
    }

    pub fn link_count(&self) -> u64 {
        self.link_count
    }

    pub fn set_link_count(&mut self, link_count: u64) {
        self.link_count = link_count;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn set_blocks(&mut self, blocks: u64) {
        self.blocks = blocks;
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn set_target_path(&mut self, target_path: &str) {
        self.target_path = target_path.to_string();
    }

    pub fn is_link(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_regular_file() {
        let mut md = Metadata::new(libc::S_IFREG | 0o644);
        md.set_size(123456);
        let again = Metadata::deserialize(&md.serialize()).unwrap();
        assert_eq!(md, again);
    }

    #[test]
    fn roundtrip_directory() {
        let md = Metadata::new(libc::S_IFDIR | 0o755);
        let again = Metadata::deserialize(&md.serialize()).unwrap();
        assert_eq!(md, again);
        assert!(again.is_dir());
    }

    #[test]
    fn roundtrip_symlink() {
        let md = Metadata::new_symlink("/somewhere/else");
        let again = Metadata::deserialize(&md.serialize()).unwrap();
        assert_eq!(again.target_path(), "/somewhere/else");
        assert!(again.is_link());
        assert_eq!(md, again);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Metadata::deserialize("").is_err());
        assert!(Metadata::deserialize("notanumber|0|").is_err());
        assert!(Metadata::deserialize("493").is_err());
    }

    #[test]
    fn size_is_second_field() {
        // the merge operator relies on mode and size forming the prefix
        let mut md = Metadata::new(libc::S_IFREG | 0o600);
        md.set_size(42);
        let s = md.serialize();
        let mut fields = s.split('|');
        fields.next().unwrap();
        assert_eq!(fields.next().unwrap(), "42");
    }
}
