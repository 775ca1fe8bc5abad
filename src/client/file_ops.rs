//! The POSIX-like operation layer.
//!
//! This is what a syscall-interception shim calls after it has decided a
//! path belongs to the mount. Paths are absolute and canonicalized by the
//! shim; descriptors are indices into the context's open-file map.

use crate::client::forward_data;
use crate::client::forward_metadata;
use crate::client::open_file::{DirEntry, OpenFile, OpenFlags};
use crate::client::ClientContext;
use crate::config;
use crate::error::{FsError, FsResult};
use crate::metadata::Metadata;
use crate::rpc::{ChunkStat, MetadentryUpdateFlags};

fn check_path(path: &str) -> FsResult<()> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(FsError::InvalidArgument(format!(
            "path must be absolute: '{}'",
            path
        )));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(FsError::InvalidArgument(format!(
            "trailing slash in '{}'",
            path
        )));
    }
    Ok(())
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

/// Create the metadentry for `path` after verifying its parent exists and
/// is a directory - every ancestor of an existing entry must have a
/// record.
async fn create_entry(ctx: &ClientContext, path: &str, mode: u32) -> FsResult<()> {
    let parent = parent_of(path);
    if parent != "/" {
        let md = forward_metadata::forward_stat(ctx, parent).await?;
        if !md.is_dir() {
            return Err(FsError::from_errno(libc::ENOTDIR));
        }
    }
    forward_metadata::forward_create(ctx, path, mode).await
}

/// Resolve `path` to its record, following symlinks up to a fixed depth.
/// Returns the final path alongside the record, since open must bind the
/// target.
async fn stat_resolved(ctx: &ClientContext, path: &str) -> FsResult<(String, Metadata)> {
    let mut current = path.to_string();
    let mut md = forward_metadata::forward_stat(ctx, &current).await?;
    let mut depth = 0;
    while md.is_link() {
        depth += 1;
        if depth > config::client::MAX_SYMLINK_DEPTH {
            return Err(FsError::from_errno(libc::ELOOP));
        }
        current = md.target_path().to_string();
        md = forward_metadata::forward_stat(ctx, &current).await?;
    }
    Ok((current, md))
}

/// Create a regular file.
pub async fn create(ctx: &ClientContext, path: &str, perms: u32) -> FsResult<()> {
    check_path(path)?;
    create_entry(ctx, path, libc::S_IFREG | (perms & !libc::S_IFMT)).await
}

/// Create a directory.
pub async fn mkdir(ctx: &ClientContext, path: &str, perms: u32) -> FsResult<()> {
    check_path(path)?;
    if path == "/" {
        return Err(FsError::AlreadyExists);
    }
    create_entry(ctx, path, libc::S_IFDIR | (perms & !libc::S_IFMT)).await
}

/// Open (and possibly create) `path`, returning a descriptor index.
/// Symlinks are followed; opening a directory degrades to `opendir`.
pub async fn open(ctx: &ClientContext, path: &str, perms: u32, flags: OpenFlags) -> FsResult<i32> {
    check_path(path)?;

    match forward_metadata::forward_stat(ctx, path).await {
        Err(FsError::NotFound) => {
            if !flags.contains(OpenFlags::CREAT) {
                return Err(FsError::NotFound);
            }
            create(ctx, path, perms).await?;
            Ok(ctx.ofm().add(OpenFile::new(path, flags)))
        }
        Err(err) => Err(err),
        Ok(md) => {
            if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
                return Err(FsError::AlreadyExists);
            }
            let (target, md) = if md.is_link() {
                stat_resolved(ctx, path).await?
            } else {
                (path.to_string(), md)
            };
            if md.is_dir() {
                return opendir(ctx, &target).await;
            }
            if flags.contains(OpenFlags::TRUNC) && md.size() > 0 {
                truncate_sized(ctx, &target, md.size(), 0).await?;
            }
            Ok(ctx.ofm().add(OpenFile::new(&target, flags)))
        }
    }
}

pub fn close(ctx: &ClientContext, fd: i32) -> FsResult<()> {
    if ctx.ofm().remove(fd) {
        Ok(())
    } else {
        Err(FsError::BadDescriptor)
    }
}

pub fn dup(ctx: &ClientContext, oldfd: i32) -> FsResult<i32> {
    ctx.ofm().dup(oldfd)
}

pub fn dup2(ctx: &ClientContext, oldfd: i32, newfd: i32) -> FsResult<i32> {
    ctx.ofm().dup2(oldfd, newfd)
}

/// Record for `path`, following symlinks unless told otherwise.
pub async fn stat(ctx: &ClientContext, path: &str, follow_links: bool) -> FsResult<Metadata> {
    check_path(path)?;
    if follow_links {
        Ok(stat_resolved(ctx, path).await?.1)
    } else {
        forward_metadata::forward_stat(ctx, path).await
    }
}

/// Existence check. Permission enforcement is out of scope, so any mask
/// passes once the path resolves.
pub async fn access(ctx: &ClientContext, path: &str, _mask: u32) -> FsResult<()> {
    stat(ctx, path, true).await.map(|_| ())
}

/// Overwrite the stored mode bits.
pub async fn chmod(ctx: &ClientContext, path: &str, perms: u32) -> FsResult<()> {
    check_path(path)?;
    let (target, md) = stat_resolved(ctx, path).await?;
    let mut update = md.clone();
    update.set_mode((md.mode() & libc::S_IFMT) | (perms & !libc::S_IFMT));
    let flags = MetadentryUpdateFlags {
        mode: true,
        ..Default::default()
    };
    forward_metadata::forward_update_metadentry(ctx, &target, &update, &flags).await
}

async fn pwrite_internal(
    ctx: &ClientContext,
    file: &OpenFile,
    buf: &[u8],
    offset: u64,
) -> FsResult<(u64, u64)> {
    let count = buf.len() as u64;
    if count == 0 {
        return Ok((0, offset));
    }
    let path = file.path();

    if file.flag(OpenFlags::APPEND) {
        // the size merge hands back the new end-of-file; the bytes of
        // this append start right before it
        let new_size =
            forward_metadata::forward_update_metadentry_size(ctx, path, count, 0, true).await?;
        let write_offset = new_size - count;
        let (written, err) = forward_data::forward_write(ctx, path, buf, write_offset).await;
        match err {
            Some(err) if written == 0 => Err(err),
            _ => Ok((written, write_offset)),
        }
    } else {
        let (written, err) = forward_data::forward_write(ctx, path, buf, offset).await;
        if written > 0 {
            forward_metadata::forward_update_metadentry_size(ctx, path, written, offset, false)
                .await?;
        }
        match err {
            Some(err) if written == 0 => Err(err),
            _ => Ok((written, offset)),
        }
    }
}

pub async fn pwrite(ctx: &ClientContext, fd: i32, buf: &[u8], offset: u64) -> FsResult<u64> {
    let file = ctx.ofm().get(fd).ok_or(FsError::BadDescriptor)?;
    let (written, _) = pwrite_internal(ctx, &file, buf, offset).await?;
    Ok(written)
}

/// Positional write at the descriptor offset.
pub async fn write(ctx: &ClientContext, fd: i32, buf: &[u8]) -> FsResult<u64> {
    let file = ctx.ofm().get(fd).ok_or(FsError::BadDescriptor)?;
    let pos = file.pos();
    let (written, at) = pwrite_internal(ctx, &file, buf, pos).await?;
    file.set_pos(at + written);
    Ok(written)
}

pub async fn pread(ctx: &ClientContext, fd: i32, buf: &mut [u8], offset: u64) -> FsResult<u64> {
    let file = ctx.ofm().get(fd).ok_or(FsError::BadDescriptor)?;
    let (read, err) = forward_data::forward_read(ctx, file.path(), buf, offset).await;
    match err {
        Some(err) if read == 0 => Err(err),
        _ => Ok(read),
    }
}

/// Positional read at the descriptor offset.
pub async fn read(ctx: &ClientContext, fd: i32, buf: &mut [u8]) -> FsResult<u64> {
    let file = ctx.ofm().get(fd).ok_or(FsError::BadDescriptor)?;
    let pos = file.pos();
    let (read, err) = forward_data::forward_read(ctx, file.path(), buf, pos).await;
    match err {
        Some(err) if read == 0 => Err(err),
        _ => {
            file.set_pos(pos + read);
            Ok(read)
        }
    }
}

pub async fn lseek(ctx: &ClientContext, fd: i32, offset: i64, whence: i32) -> FsResult<u64> {
    let file = ctx.ofm().get(fd).ok_or(FsError::BadDescriptor)?;

    let base = match whence {
        libc::SEEK_SET => 0i64,
        libc::SEEK_CUR => file.pos() as i64,
        libc::SEEK_END => {
            forward_metadata::forward_get_metadentry_size(ctx, file.path()).await? as i64
        }
        _ => {
            return Err(FsError::InvalidArgument(format!(
                "unsupported whence {}",
                whence
            )))
        }
    };
    let target = base + offset;
    if target < 0 {
        return Err(FsError::InvalidArgument("seek before start of file".into()));
    }
    file.set_pos(target as u64);
    Ok(target as u64)
}

/// Remove a file (not a directory). Chunk destruction is broadcast when
/// the record says data may exist.
pub async fn unlink(ctx: &ClientContext, path: &str) -> FsResult<()> {
    check_path(path)?;
    let md = forward_metadata::forward_stat(ctx, path).await?;
    if md.is_dir() {
        return Err(FsError::from_errno(libc::EISDIR));
    }
    let has_data = !md.is_link() && md.size() > 0 && ctx.hosts_count() > 1;
    forward_metadata::forward_remove(ctx, path, has_data).await
}

pub async fn rmdir(ctx: &ClientContext, path: &str) -> FsResult<()> {
    check_path(path)?;
    if path == "/" {
        return Err(FsError::InvalidArgument("cannot remove the root".into()));
    }
    let md = forward_metadata::forward_stat(ctx, path).await?;
    if !md.is_dir() {
        return Err(FsError::from_errno(libc::ENOTDIR));
    }
    let entries = forward_metadata::forward_get_dirents(ctx, path).await?;
    if !entries.is_empty() {
        return Err(FsError::NotEmpty);
    }
    forward_metadata::forward_remove(ctx, path, false).await
}

async fn truncate_sized(
    ctx: &ClientContext,
    path: &str,
    current_size: u64,
    new_size: u64,
) -> FsResult<()> {
    forward_metadata::forward_decr_size(ctx, path, new_size).await?;
    forward_data::forward_truncate(ctx, path, current_size, new_size).await
}

/// Shrink `path` to `new_size` bytes. Growing through truncate is not
/// supported; files grow through writes.
pub async fn truncate(ctx: &ClientContext, path: &str, new_size: u64) -> FsResult<()> {
    check_path(path)?;
    let (target, md) = stat_resolved(ctx, path).await?;
    if md.is_dir() {
        return Err(FsError::from_errno(libc::EISDIR));
    }
    let current = md.size();
    if new_size > current {
        return Err(FsError::InvalidArgument(
            "cannot grow a file through truncate".into(),
        ));
    }
    if new_size == current {
        return Ok(());
    }
    truncate_sized(ctx, &target, current, new_size).await
}

/// Open a directory: snapshot its entries across all daemons and bind
/// them to a descriptor for readdir cursors.
pub async fn opendir(ctx: &ClientContext, path: &str) -> FsResult<i32> {
    check_path(path)?;
    let md = forward_metadata::forward_stat(ctx, path).await?;
    if !md.is_dir() {
        return Err(FsError::from_errno(libc::ENOTDIR));
    }
    let entries = forward_metadata::forward_get_dirents(ctx, path).await?;
    Ok(ctx.ofm().add(OpenFile::new_dir(path, entries)))
}

/// Next entry of the snapshot taken at opendir time, or `None` at the
/// end. The descriptor position is the cursor, so `lseek(fd, 0,
/// SEEK_SET)` rewinds.
pub fn readdir(ctx: &ClientContext, fd: i32) -> FsResult<Option<DirEntry>> {
    let dir = ctx.ofm().get_dir(fd).ok_or(FsError::BadDescriptor)?;
    let pos = dir.pos();
    match dir.entry_at(pos as usize) {
        Some(entry) => {
            dir.set_pos(pos + 1);
            Ok(Some(entry.clone()))
        }
        None => Ok(None),
    }
}

#[cfg(feature = "symlinks")]
pub async fn mk_symlink(ctx: &ClientContext, path: &str, target_path: &str) -> FsResult<()> {
    check_path(path)?;
    check_path(target_path)?;
    if forward_metadata::forward_stat(ctx, path).await.is_ok() {
        return Err(FsError::AlreadyExists);
    }
    forward_metadata::forward_mk_symlink(ctx, path, target_path).await
}

#[cfg(not(feature = "symlinks"))]
pub async fn mk_symlink(_ctx: &ClientContext, _path: &str, _target_path: &str) -> FsResult<()> {
    Err(FsError::NotSupported)
}

#[cfg(feature = "symlinks")]
pub async fn readlink(ctx: &ClientContext, path: &str) -> FsResult<String> {
    check_path(path)?;
    let md = forward_metadata::forward_stat(ctx, path).await?;
    if !md.is_link() {
        return Err(FsError::InvalidArgument(format!(
            "'{}' is not a symlink",
            path
        )));
    }
    Ok(md.target_path().to_string())
}

#[cfg(not(feature = "symlinks"))]
pub async fn readlink(_ctx: &ClientContext, _path: &str) -> FsResult<String> {
    Err(FsError::NotSupported)
}

/// Filesystem-wide chunk capacity, aggregated over all daemons.
pub async fn statfs(ctx: &ClientContext) -> FsResult<ChunkStat> {
    forward_data::forward_get_chunk_stat(ctx).await
}

#[cfg(test)]
mod tests {
    use super::parent_of;

    #[test]
    fn parents() {
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a/b/c"), "/a/b");
    }
}
