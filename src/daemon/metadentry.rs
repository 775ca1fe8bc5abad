//! Daemon-side metadata operations, tying the KV engine to chunk storage.

use crate::config;
use crate::daemon::DaemonContext;
use crate::error::{FsError, FsResult};
use crate::metadata::Metadata;

/// Create the metadentry for `path`. Timestamps are stamped before
/// serialization when the build tracks them; creation itself goes through
/// the merge pipeline, so an existing record stays untouched.
pub fn create(ctx: &DaemonContext, path: &str, mut md: Metadata) -> FsResult<()> {
    if config::metadata::USE_ATIME || config::metadata::USE_MTIME || config::metadata::USE_CTIME {
        md.init_times();
    }
    ctx.mdb().create(path, &md.serialize())
}

pub fn get(ctx: &DaemonContext, path: &str) -> FsResult<Metadata> {
    Metadata::deserialize(&get_str(ctx, path)?)
}

/// The serialized record only, as stored.
pub fn get_str(ctx: &DaemonContext, path: &str) -> FsResult<String> {
    ctx.mdb().get(path)
}

pub fn get_size(ctx: &DaemonContext, path: &str) -> FsResult<u64> {
    Ok(get(ctx, path)?.size())
}

pub fn get_dirents(ctx: &DaemonContext, dir: &str) -> FsResult<Vec<(String, bool)>> {
    ctx.mdb().get_dirents(dir)
}

/// Overwrite selected fields of an existing record.
pub fn update(
    ctx: &DaemonContext,
    path: &str,
    md: &Metadata,
    flags: &crate::rpc::MetadentryUpdateFlags,
) -> FsResult<()> {
    ctx.mdb().patch(path, md, flags)
}

/// Merge a size increase and return the resulting logical size. For an
/// append the merge adds `io_size`; otherwise `offset + io_size` is the
/// requested end-of-file and the merge keeps the larger of current and
/// requested.
pub fn update_size(
    ctx: &DaemonContext,
    path: &str,
    io_size: u64,
    offset: u64,
    append: bool,
) -> FsResult<u64> {
    let requested = if append { io_size } else { offset + io_size };
    match ctx.mdb().increase_size(path, requested, append)? {
        Some(size) => Ok(size),
        None => Err(FsError::NotFound),
    }
}

pub fn decrease_size(ctx: &DaemonContext, path: &str, length: u64) -> FsResult<()> {
    ctx.mdb().decrease_size(path, length)
}

/// Remove `path` from this daemon. Chunk destruction always happens
/// (removes are broadcast, and any daemon may hold chunks); the KV record
/// is only removed on the daemon that owns it, as coordinated by the
/// caller.
pub fn remove(ctx: &DaemonContext, path: &str, remove_metadentry: bool) -> FsResult<()> {
    if remove_metadentry {
        ctx.mdb().remove(path)?;
    }
    ctx.storage().destroy_chunk_space(path)
}
