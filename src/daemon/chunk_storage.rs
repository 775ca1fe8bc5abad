//! On-disk chunk storage.
//!
//! Every file owns a directory under the daemon's data root, named by the
//! file's absolute path with slashes escaped into a single component; the
//! directory holds one regular file per chunk this daemon stores, named by
//! the decimal chunk id. Chunk files are created lazily on first write and
//! may be sparse; an absent chunk reads as zeroes.
//!
//! The layer performs no locking of its own: per-chunk-file I/O is
//! serialized by the underlying filesystem, and concurrent writers to the
//! same byte range get last-writer-wins semantics.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::{FsError, FsResult};
use crate::rpc::{ChunkId, ChunkStat};

/// Escape everything that would break a single path component.
const COMPONENT_ESCAPE: &AsciiSet = &CONTROLS.add(b'/').add(b'%');

pub struct ChunkStorage {
    root: PathBuf,
    chunk_size: u64,
}

impl ChunkStorage {
    pub fn new<P: AsRef<Path>>(root: P, chunk_size: u64) -> FsResult<Self> {
        assert!(chunk_size.is_power_of_two(), "chunk size must be a power of two");
        std::fs::create_dir_all(root.as_ref())?;
        Ok(ChunkStorage {
            root: root.as_ref().to_path_buf(),
            chunk_size,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn chunks_dir(&self, file_path: &str) -> PathBuf {
        let escaped = utf8_percent_encode(file_path, COMPONENT_ESCAPE).to_string();
        self.root.join(escaped)
    }

    fn chunk_path(&self, file_path: &str, chunk_id: ChunkId) -> PathBuf {
        self.chunks_dir(file_path).join(chunk_id.to_string())
    }

    /// Write `buf` into chunk `chunk_id` at `offset` bytes into the chunk.
    /// The caller guarantees `offset + buf.len() <= chunk_size`. Creates
    /// the chunk directory and file as needed. Returns bytes written.
    pub fn write_chunk(
        &self,
        file_path: &str,
        chunk_id: ChunkId,
        buf: &[u8],
        offset: u64,
    ) -> FsResult<u64> {
        debug_assert!(offset + buf.len() as u64 <= self.chunk_size);

        std::fs::create_dir_all(self.chunks_dir(file_path))?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.chunk_path(file_path, chunk_id))?;
        file.write_all_at(buf, offset)?;
        Ok(buf.len() as u64)
    }

    /// Read up to `buf.len()` bytes from chunk `chunk_id` starting at
    /// `offset` bytes into the chunk. Short reads at end-of-chunk are
    /// legal; a missing chunk file is a hole and reads zero bytes.
    pub fn read_chunk(
        &self,
        file_path: &str,
        chunk_id: ChunkId,
        buf: &mut [u8],
        offset: u64,
    ) -> FsResult<u64> {
        debug_assert!(offset + buf.len() as u64 <= self.chunk_size);

        let file = match File::open(self.chunk_path(file_path, chunk_id)) {
            Ok(file) => file,
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut read = 0usize;
        while read < buf.len() {
            match file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(read as u64)
    }

    /// Truncate chunk `chunk_id` to `length` bytes (`length <= chunk
    /// size`). A missing chunk file is a hole and stays one.
    pub fn truncate_chunk_file(
        &self,
        file_path: &str,
        chunk_id: ChunkId,
        length: u64,
    ) -> FsResult<()> {
        if length > self.chunk_size {
            return Err(FsError::InvalidArgument(format!(
                "chunk truncation beyond chunk size ({} > {})",
                length, self.chunk_size
            )));
        }
        let file = match OpenOptions::new()
            .write(true)
            .open(self.chunk_path(file_path, chunk_id))
        {
            Ok(file) => file,
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        file.set_len(length)?;
        Ok(())
    }

    /// Remove every chunk file with id `>= chunk_start`. Keeps going past
    /// individual failures and reports the first one.
    pub fn trim_chunk_space(&self, file_path: &str, chunk_start: ChunkId) -> FsResult<()> {
        let dir = self.chunks_dir(file_path);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut first_err = None;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    first_err.get_or_insert_with(|| FsError::from(err));
                    continue;
                }
            };
            let chunk_id = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<ChunkId>().ok());
            match chunk_id {
                Some(id) if id >= chunk_start => {
                    if let Err(err) = std::fs::remove_file(entry.path()) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            log::warn!("failed to trim chunk {:?}: {}", entry.path(), err);
                            first_err.get_or_insert_with(|| FsError::from(err));
                        }
                    }
                }
                _ => {}
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Remove the chunk directory and everything in it. Idempotent.
    pub fn destroy_chunk_space(&self, file_path: &str) -> FsResult<()> {
        match std::fs::remove_dir_all(self.chunks_dir(file_path)) {
            Ok(()) => Ok(()),
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Chunk capacity of the backing filesystem, derived from `statfs` of
    /// the data root divided by the chunk size.
    pub fn chunk_stat(&self) -> FsResult<ChunkStat> {
        let mut stat: libc::statfs64 = unsafe { std::mem::zeroed() };

        use nix::NixPath;
        let res = self
            .root
            .with_nix_path(|cstr| unsafe { libc::statfs64(cstr.as_ptr(), &mut stat) })?;
        nix::errno::Errno::result(res)?;

        let bytes_total = stat.f_blocks as u64 * stat.f_bsize as u64;
        let bytes_free = stat.f_bavail as u64 * stat.f_bsize as u64;

        Ok(ChunkStat {
            chunk_size: self.chunk_size,
            chunk_total: bytes_total / self.chunk_size,
            chunk_free: bytes_free / self.chunk_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(chunk_size: u64) -> (tempfile::TempDir, ChunkStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = ChunkStorage::new(dir.path().join("chunks"), chunk_size).unwrap();
        (dir, storage)
    }

    #[test]
    fn write_then_read_partial_chunk() {
        let (_dir, cs) = storage(64);
        let written = cs.write_chunk("/f", 0, b"hello world", 5).unwrap();
        assert_eq!(written, 11);

        let mut buf = vec![0u8; 11];
        let read = cs.read_chunk("/f", 0, &mut buf, 5).unwrap();
        assert_eq!(read, 11);
        assert_eq!(&buf, b"hello world");

        // the leading gap is a hole and reads as zeroes
        let mut head = vec![0xffu8; 5];
        let read = cs.read_chunk("/f", 0, &mut head, 0).unwrap();
        assert_eq!(read, 5);
        assert_eq!(head, vec![0u8; 5]);
    }

    #[test]
    fn missing_chunk_reads_zero_bytes() {
        let (_dir, cs) = storage(64);
        let mut buf = vec![0u8; 16];
        assert_eq!(cs.read_chunk("/f", 3, &mut buf, 0).unwrap(), 0);
    }

    #[test]
    fn paths_with_slashes_stay_one_component() {
        let (_dir, cs) = storage(64);
        cs.write_chunk("/deep/nested/file", 0, b"x", 0).unwrap();
        cs.write_chunk("/deep/nested/file", 1, b"y", 0).unwrap();
        let dir = cs.chunks_dir("/deep/nested/file");
        assert!(dir.is_dir());
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 2);
    }

    #[test]
    fn truncate_and_trim() {
        let (_dir, cs) = storage(64);
        for id in 0..4 {
            cs.write_chunk("/f", id, &[7u8; 64], 0).unwrap();
        }
        cs.truncate_chunk_file("/f", 1, 10).unwrap();
        assert_eq!(
            std::fs::metadata(cs.chunk_path("/f", 1)).unwrap().len(),
            10
        );

        cs.trim_chunk_space("/f", 2).unwrap();
        assert!(cs.chunk_path("/f", 0).exists());
        assert!(cs.chunk_path("/f", 1).exists());
        assert!(!cs.chunk_path("/f", 2).exists());
        assert!(!cs.chunk_path("/f", 3).exists());

        // truncating a hole is a no-op
        cs.truncate_chunk_file("/f", 9, 1).unwrap();
    }

    #[test]
    fn destroy_is_idempotent() {
        let (_dir, cs) = storage(64);
        cs.write_chunk("/f", 0, b"abc", 0).unwrap();
        cs.destroy_chunk_space("/f").unwrap();
        assert!(!cs.chunks_dir("/f").exists());
        cs.destroy_chunk_space("/f").unwrap();
    }

    #[test]
    fn chunk_stat_reports_capacity() {
        let (_dir, cs) = storage(1024);
        let stat = cs.chunk_stat().unwrap();
        assert_eq!(stat.chunk_size, 1024);
        assert!(stat.chunk_total > 0);
        assert!(stat.chunk_free <= stat.chunk_total);
    }
}
