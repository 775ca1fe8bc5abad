//! RPC handlers.
//!
//! One handler per request variant. Handlers map every fault to a status
//! code in the response and never unwind across the serving loop; data
//! handlers push their chunk work onto the I/O pool and report partial
//! success (bytes moved plus the first error in chunk-id order).

use std::sync::Arc;

use bytes::Bytes;

use crate::chunk_calc;
use crate::config;
use crate::daemon::{metadentry, DaemonContext};
use crate::error::{FsError, FsResult};
use crate::metadata::Metadata;
use crate::rpc::{self, ChunkId, FsConfig, Request, Response, ResponseBody};

/// Dispatch one decoded request. Infallible: faults become the response
/// status.
pub async fn handle_request(
    ctx: &Arc<DaemonContext>,
    request: Request,
    bulk: Bytes,
) -> (Response, Bytes) {
    match request {
        Request::GetFsConfig => reply(get_fs_config(ctx)),
        Request::Create { path, mode } => reply(create(ctx, &path, mode)),
        Request::Stat { path } => reply(stat(ctx, &path)),
        Request::Remove {
            path,
            remove_metadentry,
        } => reply(remove(ctx, &path, remove_metadentry)),
        Request::DecrSize { path, length } => reply(decr_size(ctx, &path, length)),
        Request::UpdateMetadentry {
            path,
            metadata,
            flags,
        } => reply(update_metadentry(ctx, &path, &metadata, &flags)),
        Request::GetMetadentrySize { path } => reply(get_metadentry_size(ctx, &path)),
        Request::UpdateMetadentrySize {
            path,
            size,
            offset,
            append,
        } => reply(update_metadentry_size(ctx, &path, size, offset, append)),
        Request::GetDirents { path } => get_dirents(ctx, &path),
        Request::MkSymlink { path, target_path } => reply(mk_symlink(ctx, &path, &target_path)),
        Request::Read {
            path,
            offset,
            chunk_start,
            chunk_end,
            total_size,
        } => read(ctx, &path, offset, chunk_start, chunk_end, total_size).await,
        Request::Write {
            path,
            offset,
            chunk_start,
            chunk_end,
            total_size,
        } => write(ctx, &path, offset, chunk_start, chunk_end, total_size, bulk).await,
        Request::Truncate { path, new_size } => reply(truncate(ctx, &path, new_size).await),
        Request::ChunkStat => reply(chunk_stat(ctx).await),
    }
}

fn reply(result: FsResult<ResponseBody>) -> (Response, Bytes) {
    match result {
        Ok(body) => (Response::ok(body), Bytes::new()),
        Err(err) => (Response::error(&err), Bytes::new()),
    }
}

fn check_path(path: &str) -> FsResult<()> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(FsError::InvalidArgument(format!(
            "path must be absolute: '{}'",
            path
        )));
    }
    Ok(())
}

fn get_fs_config(ctx: &DaemonContext) -> FsResult<ResponseBody> {
    let settings = ctx.settings();
    Ok(ResponseBody::FsConfig(FsConfig {
        mountdir: settings.mountdir.clone(),
        rootdir: settings.rootdir.to_string_lossy().into_owned(),
        chunk_size: settings.chunk_size,
        atime_state: config::metadata::USE_ATIME,
        mtime_state: config::metadata::USE_MTIME,
        ctime_state: config::metadata::USE_CTIME,
        link_cnt_state: config::metadata::USE_LINK_CNT,
        blocks_state: config::metadata::USE_BLOCKS,
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
    }))
}

fn create(ctx: &DaemonContext, path: &str, mode: u32) -> FsResult<ResponseBody> {
    check_path(path)?;
    metadentry::create(ctx, path, Metadata::new(mode))?;
    Ok(ResponseBody::Empty)
}

fn stat(ctx: &DaemonContext, path: &str) -> FsResult<ResponseBody> {
    check_path(path)?;
    let metadata = metadentry::get_str(ctx, path)?;
    Ok(ResponseBody::Stat { metadata })
}

fn remove(ctx: &DaemonContext, path: &str, remove_metadentry: bool) -> FsResult<ResponseBody> {
    check_path(path)?;
    metadentry::remove(ctx, path, remove_metadentry)?;
    Ok(ResponseBody::Empty)
}

fn decr_size(ctx: &DaemonContext, path: &str, length: u64) -> FsResult<ResponseBody> {
    check_path(path)?;
    metadentry::decrease_size(ctx, path, length)?;
    Ok(ResponseBody::Empty)
}

fn update_metadentry(
    ctx: &DaemonContext,
    path: &str,
    metadata: &str,
    flags: &rpc::MetadentryUpdateFlags,
) -> FsResult<ResponseBody> {
    check_path(path)?;
    let md = Metadata::deserialize(metadata)?;
    metadentry::update(ctx, path, &md, flags)?;
    Ok(ResponseBody::Empty)
}

fn get_metadentry_size(ctx: &DaemonContext, path: &str) -> FsResult<ResponseBody> {
    check_path(path)?;
    let size = metadentry::get_size(ctx, path)?;
    Ok(ResponseBody::Size { size })
}

fn update_metadentry_size(
    ctx: &DaemonContext,
    path: &str,
    size: u64,
    offset: u64,
    append: bool,
) -> FsResult<ResponseBody> {
    check_path(path)?;
    let size = metadentry::update_size(ctx, path, size, offset, append)?;
    Ok(ResponseBody::Size { size })
}

fn get_dirents(ctx: &DaemonContext, path: &str) -> (Response, Bytes) {
    let entries = match check_path(path).and_then(|_| metadentry::get_dirents(ctx, path)) {
        Ok(entries) => entries,
        Err(err) => return (Response::error(&err), Bytes::new()),
    };
    let (bulk, count, truncated) = rpc::pack_dirents(&entries, config::rpc::DIRENTS_BUF_SIZE);
    let response = Response {
        err: if truncated { libc::ENOBUFS } else { 0 },
        body: ResponseBody::Dirents {
            count: count as u32,
        },
    };
    (response, bulk)
}

#[cfg(feature = "symlinks")]
fn mk_symlink(ctx: &DaemonContext, path: &str, target_path: &str) -> FsResult<ResponseBody> {
    check_path(path)?;
    if target_path.is_empty() {
        return Err(FsError::InvalidArgument("empty symlink target".into()));
    }
    metadentry::create(ctx, path, Metadata::new_symlink(target_path))?;
    Ok(ResponseBody::Empty)
}

#[cfg(not(feature = "symlinks"))]
fn mk_symlink(_ctx: &DaemonContext, _path: &str, _target_path: &str) -> FsResult<ResponseBody> {
    Err(FsError::NotSupported)
}

/// One chunk's slice of a data operation on this daemon.
struct ChunkSpan {
    chunk_id: ChunkId,
    /// Offset within the chunk file.
    intra_offset: u64,
    /// Bytes of this chunk taking part.
    size: u64,
    /// Offset within this daemon's bulk payload.
    bulk_offset: u64,
}

/// Walk the global chunk range of an operation and keep the chunks this
/// daemon owns. The bulk cursor advances over owned chunks only: the
/// client packs exactly those bytes, in ascending chunk-id order.
fn owned_spans(
    ctx: &DaemonContext,
    path: &str,
    offset: u64,
    chunk_start: ChunkId,
    chunk_end: ChunkId,
    total_size: u64,
) -> FsResult<Vec<ChunkSpan>> {
    let chunk_size = ctx.storage().chunk_size();

    check_path(path)?;
    if chunk_start > chunk_end || offset >= chunk_size || total_size == 0 {
        return Err(FsError::InvalidArgument(format!(
            "bad chunk range [{}, {}] offset {} size {}",
            chunk_start, chunk_end, offset, total_size
        )));
    }

    let localhost = ctx.distributor().localhost();
    let mut spans = Vec::new();
    let mut remaining = total_size;
    let mut bulk_offset = 0u64;

    for chunk_id in chunk_start..=chunk_end {
        if remaining == 0 {
            break;
        }
        if ctx.distributor().locate_data(path, chunk_id) != localhost {
            continue;
        }
        let (intra_offset, size) = if chunk_id == chunk_start {
            (offset, std::cmp::min(chunk_size - offset, remaining))
        } else if chunk_id == chunk_end {
            (0, remaining)
        } else {
            (0, std::cmp::min(chunk_size, remaining))
        };
        spans.push(ChunkSpan {
            chunk_id,
            intra_offset,
            size,
            bulk_offset,
        });
        remaining -= size;
        bulk_offset += size;
    }

    if remaining != 0 {
        return Err(FsError::InvalidArgument(format!(
            "bulk size {} does not match owned chunks of [{}, {}]",
            total_size, chunk_start, chunk_end
        )));
    }
    Ok(spans)
}

fn join_fault() -> FsError {
    FsError::StorageFault {
        errno: libc::EIO,
        msg: "chunk io task failed".into(),
    }
}

async fn write(
    ctx: &Arc<DaemonContext>,
    path: &str,
    offset: u64,
    chunk_start: ChunkId,
    chunk_end: ChunkId,
    total_size: u64,
    bulk: Bytes,
) -> (Response, Bytes) {
    let spans = match owned_spans(ctx, path, offset, chunk_start, chunk_end, total_size) {
        Ok(spans) => spans,
        Err(err) => return (Response::error(&err), Bytes::new()),
    };
    if bulk.len() as u64 != total_size {
        let err = FsError::InvalidArgument(format!(
            "bulk payload {} != announced size {}",
            bulk.len(),
            total_size
        ));
        return (Response::error(&err), Bytes::new());
    }

    let mut tasks = Vec::with_capacity(spans.len());
    for span in &spans {
        let ctx2 = Arc::clone(ctx);
        let path = path.to_string();
        let data = bulk.slice(span.bulk_offset as usize..(span.bulk_offset + span.size) as usize);
        let chunk_id = span.chunk_id;
        let intra_offset = span.intra_offset;
        tasks.push(ctx.io_pool().submit(move || {
            ctx2.storage().write_chunk(&path, chunk_id, &data, intra_offset)
        }));
    }

    let mut written = 0u64;
    let mut first_err: Option<FsError> = None;
    for task in tasks {
        match task.await {
            Ok(Ok(n)) => written += n,
            Ok(Err(err)) => {
                log::error!("chunk write failed for '{}': {}", path, err);
                first_err.get_or_insert(err);
            }
            Err(_) => {
                first_err.get_or_insert_with(join_fault);
            }
        }
    }

    let response = Response {
        err: first_err.map(|e| e.errno()).unwrap_or(0),
        body: ResponseBody::Io { io_size: written },
    };
    (response, Bytes::new())
}

async fn read(
    ctx: &Arc<DaemonContext>,
    path: &str,
    offset: u64,
    chunk_start: ChunkId,
    chunk_end: ChunkId,
    total_size: u64,
) -> (Response, Bytes) {
    let spans = match owned_spans(ctx, path, offset, chunk_start, chunk_end, total_size) {
        Ok(spans) => spans,
        Err(err) => return (Response::error(&err), Bytes::new()),
    };

    let mut tasks = Vec::with_capacity(spans.len());
    for span in &spans {
        let ctx2 = Arc::clone(ctx);
        let path = path.to_string();
        let chunk_id = span.chunk_id;
        let intra_offset = span.intra_offset;
        let size = span.size as usize;
        tasks.push(ctx.io_pool().submit(move || {
            // sparse regions must come back zeroed, not as stale bytes
            let mut buf = vec![0u8; size];
            let read = ctx2
                .storage()
                .read_chunk(&path, chunk_id, &mut buf, intra_offset)?;
            Ok::<_, FsError>((buf, read))
        }));
    }

    let mut bulk = vec![0u8; total_size as usize];
    let mut read_total = 0u64;
    let mut first_err: Option<FsError> = None;
    for (span, task) in spans.iter().zip(tasks) {
        match task.await {
            Ok(Ok((buf, read))) => {
                let start = span.bulk_offset as usize;
                bulk[start..start + buf.len()].copy_from_slice(&buf);
                read_total += read;
            }
            Ok(Err(err)) => {
                log::error!("chunk read failed for '{}': {}", path, err);
                first_err.get_or_insert(err);
            }
            Err(_) => {
                first_err.get_or_insert_with(join_fault);
            }
        }
    }

    let response = Response {
        err: first_err.map(|e| e.errno()).unwrap_or(0),
        body: ResponseBody::Io { io_size: read_total },
    };
    (response, Bytes::from(bulk))
}

/// Cut the chunk tree down to `new_size` bytes: truncate the last
/// surviving chunk when the boundary falls inside it (and this daemon owns
/// it), then drop every chunk past the boundary.
async fn truncate(ctx: &Arc<DaemonContext>, path: &str, new_size: u64) -> FsResult<ResponseBody> {
    check_path(path)?;

    let ctx2 = Arc::clone(ctx);
    let path = path.to_string();
    let task = ctx.io_pool().submit(move || {
        let chunk_size = ctx2.storage().chunk_size();
        if new_size == 0 {
            return ctx2.storage().trim_chunk_space(&path, 0);
        }
        let last_chunk = chunk_calc::chunk_id_for_offset(new_size - 1, chunk_size);
        let lpad = chunk_calc::chunk_lpad(new_size, chunk_size);
        if lpad != 0
            && ctx2.distributor().locate_data(&path, last_chunk) == ctx2.distributor().localhost()
        {
            ctx2.storage().truncate_chunk_file(&path, last_chunk, lpad)?;
        }
        ctx2.storage().trim_chunk_space(&path, last_chunk + 1)
    });
    task.await.map_err(|_| join_fault())??;
    Ok(ResponseBody::Empty)
}

async fn chunk_stat(ctx: &Arc<DaemonContext>) -> FsResult<ResponseBody> {
    let ctx2 = Arc::clone(ctx);
    let task = ctx.io_pool().submit(move || ctx2.storage().chunk_stat());
    let stat = task.await.map_err(|_| join_fault())??;
    Ok(ResponseBody::ChunkStat(stat))
}
