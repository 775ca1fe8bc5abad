//! Build-fixed configuration shared by daemon and client.
//!
//! Values here are constants on purpose: both sides of the wire must agree
//! on the metadata field layout, and the daemon advertises the relevant
//! toggles in the mount handshake so a mismatched client can bail out
//! early.

/// Environment variable prefix of the client library.
pub const CLIENT_ENV_PREFIX: &str = "LIBSCRATCHFS_";
/// Environment variable prefix of the daemon.
pub const DAEMON_ENV_PREFIX: &str = "SCRATCHFSD_";

/// Default hosts file location, relative to the working directory.
pub const DEFAULT_HOSTS_FILE: &str = "./scratchfs_hosts.txt";

pub mod io {
    /// Zero read buffers before issuing disk reads. Required for sparse
    /// files: an unallocated chunk (or the tail of a short chunk file)
    /// must read as zeroes, not as stale buffer content.
    pub const ZERO_BUFFER_BEFORE_READ: bool = true;
}

pub mod metadata {
    // Which record fields are kept besides mode and size. These determine
    // the serialized layout, so they are compile-time for the whole build.
    pub const USE_ATIME: bool = false;
    pub const USE_MTIME: bool = false;
    pub const USE_CTIME: bool = false;
    pub const USE_LINK_CNT: bool = false;
    pub const USE_BLOCKS: bool = false;
}

pub mod rpc {
    use std::time::Duration;

    /// Default chunk size in bytes (512 KiB). Must be a power of two; the
    /// running value is configured at daemon start and advertised to
    /// clients in the mount handshake.
    pub const CHUNK_SIZE: u64 = 524288;

    /// Cap for one packed dirents response (8 MiB). Listings beyond this
    /// are truncated and flagged with `ENOBUFS`.
    pub const DIRENTS_BUF_SIZE: usize = 8 * 1024 * 1024;

    /// Upper bound for a single RPC frame: header plus the bulk bytes of
    /// the largest chunk batch one daemon is sent in one operation.
    pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

    /// Worker threads dedicated to chunk I/O on the daemon.
    pub const DAEMON_IO_STREAMS: usize = 8;
    /// Worker threads serving RPC handlers on the daemon.
    pub const DAEMON_HANDLER_STREAMS: usize = 8;

    /// Per-attempt client RPC time budget.
    pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);
    /// Attempts per RPC before a transport fault is surfaced.
    pub const RPC_TRIES: u32 = 3;
}

pub mod client {
    /// First descriptor index handed out by the open-file map. Starts high
    /// to avoid clashing with descriptors the kernel hands to the process
    /// for files this library does not intercept.
    pub const FD_START: i32 = 100_000;

    /// Bound on symlink resolution while opening/statting a path.
    pub const MAX_SYMLINK_DEPTH: usize = 8;
}

/// Look up `<prefix><name>` in the process environment.
pub fn env_var(prefix: &str, name: &str) -> Option<String> {
    std::env::var(format!("{}{}", prefix, name)).ok()
}
