use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

pub type ChunkId = u64;

/// Which record fields an `UpdateMetadentry` request overwrites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadentryUpdateFlags {
    pub mode: bool,
    pub size: bool,
    pub atime: bool,
    pub mtime: bool,
    pub ctime: bool,
    pub link_count: bool,
    pub blocks: bool,
}

/// Request header, one variant per daemon operation.
///
/// Data requests (`Read`/`Write`) describe the whole chunk range of the
/// client operation; each daemon re-derives which of those chunks it owns
/// and walks its bulk cursor over owned chunks only. `offset` is the
/// offset *within* the first chunk of the range, `total_size` the bytes
/// this particular daemon is responsible for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    GetFsConfig,
    Create {
        path: String,
        mode: u32,
    },
    Stat {
        path: String,
    },
    Remove {
        path: String,
        /// True only for the one daemon owning the metadata record; the
        /// broadcast to everyone else destroys chunks only.
        remove_metadentry: bool,
    },
    DecrSize {
        path: String,
        length: u64,
    },
    UpdateMetadentry {
        path: String,
        metadata: String,
        flags: MetadentryUpdateFlags,
    },
    GetMetadentrySize {
        path: String,
    },
    UpdateMetadentrySize {
        path: String,
        size: u64,
        offset: u64,
        append: bool,
    },
    GetDirents {
        path: String,
    },
    MkSymlink {
        path: String,
        target_path: String,
    },
    Read {
        path: String,
        offset: u64,
        chunk_start: ChunkId,
        chunk_end: ChunkId,
        total_size: u64,
    },
    Write {
        path: String,
        offset: u64,
        chunk_start: ChunkId,
        chunk_end: ChunkId,
        total_size: u64,
    },
    Truncate {
        path: String,
        new_size: u64,
    },
    ChunkStat,
}

/// Aggregate chunk statistics of one daemon's backing filesystem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkStat {
    pub chunk_size: u64,
    pub chunk_total: u64,
    pub chunk_free: u64,
}

/// Filesystem configuration advertised in the mount handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub mountdir: String,
    pub rootdir: String,
    pub chunk_size: u64,
    pub atime_state: bool,
    pub mtime_state: bool,
    pub ctime_state: bool,
    pub link_cnt_state: bool,
    pub blocks_state: bool,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "res", rename_all = "snake_case")]
pub enum ResponseBody {
    Empty,
    Stat { metadata: String },
    Size { size: u64 },
    /// Bytes moved by a data operation. Meaningful even alongside a
    /// non-zero status: partial success reports what did transfer.
    Io { io_size: u64 },
    /// Entry count; the packed entries ride in the bulk payload.
    Dirents { count: u32 },
    ChunkStat(ChunkStat),
    FsConfig(FsConfig),
}

/// Response header: errno-style status (0 = OK) plus the typed body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub err: i32,
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(body: ResponseBody) -> Self {
        Response { err: 0, body }
    }

    pub fn error(err: &FsError) -> Self {
        Response {
            err: err.errno(),
            body: ResponseBody::Empty,
        }
    }
}

/// Pack directory entries into the bulk wire form: for each entry a
/// little-endian `u32` name length, one `is_dir` byte, then the name
/// bytes. Packing stops at `limit` bytes; returns the packed payload, the
/// number of entries that fit and whether the listing was truncated.
pub fn pack_dirents(entries: &[(String, bool)], limit: usize) -> (Bytes, usize, bool) {
    let mut buf = BytesMut::new();
    for (packed, (name, is_dir)) in entries.iter().enumerate() {
        let need = 4 + 1 + name.len();
        if buf.len() + need > limit {
            return (buf.freeze(), packed, true);
        }
        buf.put_u32_le(name.len() as u32);
        buf.put_u8(*is_dir as u8);
        buf.put_slice(name.as_bytes());
    }
    (buf.freeze(), entries.len(), false)
}

/// Inverse of [`pack_dirents`].
pub fn unpack_dirents(mut bulk: Bytes) -> FsResult<Vec<(String, bool)>> {
    use bytes::Buf;

    let malformed = || FsError::InvalidArgument("malformed dirent payload".into());

    let mut entries = Vec::new();
    while bulk.has_remaining() {
        if bulk.remaining() < 5 {
            return Err(malformed());
        }
        let name_len = bulk.get_u32_le() as usize;
        let is_dir = bulk.get_u8() != 0;
        if bulk.remaining() < name_len {
            return Err(malformed());
        }
        let name = String::from_utf8(bulk.split_to(name_len).to_vec())
            .map_err(|_| malformed())?;
        entries.push((name, is_dir));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirents_roundtrip() {
        let entries = vec![
            ("a".to_string(), false),
            ("subdir".to_string(), true),
            ("z-file".to_string(), false),
        ];
        let (bulk, count, truncated) = pack_dirents(&entries, 1024);
        assert!(!truncated);
        assert_eq!(count, 3);
        assert_eq!(unpack_dirents(bulk).unwrap(), entries);
    }

    #[test]
    fn dirents_truncate_at_limit() {
        let entries = vec![
            ("aaaa".to_string(), false),
            ("bbbb".to_string(), false),
            ("cccc".to_string(), false),
        ];
        // room for exactly two packed entries of 9 bytes each
        let (bulk, count, truncated) = pack_dirents(&entries, 20);
        assert!(truncated);
        assert_eq!(count, 2);
        let got = unpack_dirents(bulk).unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn rejects_torn_payload() {
        let (bulk, _, _) = pack_dirents(&[("abc".to_string(), false)], 64);
        let torn = bulk.slice(0..bulk.len() - 1);
        assert!(unpack_dirents(torn).is_err());
    }
}
