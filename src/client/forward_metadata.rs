//! Metadata forwarders.
//!
//! Metadata operations target the single daemon owning a path's record;
//! the exceptions fan out: directory listings query every daemon (children
//! hash anywhere), and removes broadcast chunk destruction while the KV
//! record is removed exactly once, on its owner.

use bytes::Bytes;
use futures::future;

use crate::client::open_file::{DirEntry, FileKind};
use crate::client::ClientContext;
use crate::error::{FsError, FsResult};
use crate::metadata::Metadata;
use crate::rpc::{self, MetadentryUpdateFlags, Request, Response, ResponseBody};

fn check(response: &Response) -> FsResult<()> {
    if response.err != 0 {
        return Err(FsError::from_errno(response.err));
    }
    Ok(())
}

pub async fn forward_create(ctx: &ClientContext, path: &str, mode: u32) -> FsResult<()> {
    let host = ctx.distributor().locate_file_metadata(path);
    let request = Request::Create {
        path: path.to_string(),
        mode,
    };
    let (response, _) = ctx.channel(host).send(&request, &[]).await?;
    check(&response)
}

pub async fn forward_stat(ctx: &ClientContext, path: &str) -> FsResult<Metadata> {
    let host = ctx.distributor().locate_file_metadata(path);
    let request = Request::Stat {
        path: path.to_string(),
    };
    let (response, _) = ctx.channel(host).send(&request, &[]).await?;
    check(&response)?;
    match response.body {
        ResponseBody::Stat { metadata } => Metadata::deserialize(&metadata),
        _ => Err(FsError::TransportFault("unexpected stat response".into())),
    }
}

/// Remove a path. The KV record lives on exactly one daemon, which gets
/// the removal; chunk destruction is broadcast when the file may hold
/// data, because its chunks can live on any node.
pub async fn forward_remove(
    ctx: &ClientContext,
    path: &str,
    remove_chunks_everywhere: bool,
) -> FsResult<()> {
    let md_host = ctx.distributor().locate_file_metadata(path);
    let request = Request::Remove {
        path: path.to_string(),
        remove_metadentry: true,
    };
    let (response, _) = ctx.channel(md_host).send(&request, &[]).await?;
    check(&response)?;

    if !remove_chunks_everywhere {
        return Ok(());
    }

    let request = Request::Remove {
        path: path.to_string(),
        remove_metadentry: false,
    };
    let results = future::join_all(
        (0..ctx.hosts_count())
            .filter(|host| *host != md_host)
            .map(|host| {
                let request = request.clone();
                async move { ctx.channel(host).send(&request, &[]).await }
            }),
    )
    .await;

    for result in results {
        check(&result?.0)?;
    }
    Ok(())
}

pub async fn forward_decr_size(ctx: &ClientContext, path: &str, length: u64) -> FsResult<()> {
    let host = ctx.distributor().locate_file_metadata(path);
    let request = Request::DecrSize {
        path: path.to_string(),
        length,
    };
    let (response, _) = ctx.channel(host).send(&request, &[]).await?;
    check(&response)
}

pub async fn forward_update_metadentry(
    ctx: &ClientContext,
    path: &str,
    md: &Metadata,
    flags: &MetadentryUpdateFlags,
) -> FsResult<()> {
    let host = ctx.distributor().locate_file_metadata(path);
    let request = Request::UpdateMetadentry {
        path: path.to_string(),
        metadata: md.serialize(),
        flags: flags.clone(),
    };
    let (response, _) = ctx.channel(host).send(&request, &[]).await?;
    check(&response)
}

pub async fn forward_get_metadentry_size(ctx: &ClientContext, path: &str) -> FsResult<u64> {
    let host = ctx.distributor().locate_file_metadata(path);
    let request = Request::GetMetadentrySize {
        path: path.to_string(),
    };
    let (response, _) = ctx.channel(host).send(&request, &[]).await?;
    check(&response)?;
    match response.body {
        ResponseBody::Size { size } => Ok(size),
        _ => Err(FsError::TransportFault("unexpected size response".into())),
    }
}

/// Merge a size update on the metadata owner and return the resulting
/// logical size. For appends the caller derives its write offset from the
/// returned size.
pub async fn forward_update_metadentry_size(
    ctx: &ClientContext,
    path: &str,
    size: u64,
    offset: u64,
    append: bool,
) -> FsResult<u64> {
    let host = ctx.distributor().locate_file_metadata(path);
    let request = Request::UpdateMetadentrySize {
        path: path.to_string(),
        size,
        offset,
        append,
    };
    let (response, _) = ctx.channel(host).send(&request, &[]).await?;
    check(&response)?;
    match response.body {
        ResponseBody::Size { size } => Ok(size),
        _ => Err(FsError::TransportFault("unexpected size response".into())),
    }
}

/// Directory listing fan-out: every daemon scans its own KV for children
/// of `dir`; each child's record lives on exactly one daemon, so the
/// merged result has no duplicates. Entries come back in listing
/// (lexicographic) order.
pub async fn forward_get_dirents(ctx: &ClientContext, dir: &str) -> FsResult<Vec<DirEntry>> {
    let targets = ctx.distributor().locate_directory_metadata(dir);
    let request = Request::GetDirents {
        path: dir.to_string(),
    };

    let results = future::join_all(targets.into_iter().map(|host| {
        let request = request.clone();
        async move { ctx.channel(host).send(&request, &[]).await }
    }))
    .await;

    let mut entries = Vec::new();
    for result in results {
        let (response, bulk): (Response, Bytes) = result?;
        check(&response)?;
        for (name, is_dir) in rpc::unpack_dirents(bulk)? {
            entries.push(DirEntry {
                name,
                kind: if is_dir {
                    FileKind::Directory
                } else {
                    FileKind::Regular
                },
            });
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(feature = "symlinks")]
pub async fn forward_mk_symlink(
    ctx: &ClientContext,
    path: &str,
    target_path: &str,
) -> FsResult<()> {
    let host = ctx.distributor().locate_file_metadata(path);
    let request = Request::MkSymlink {
        path: path.to_string(),
        target_path: target_path.to_string(),
    };
    let (response, _) = ctx.channel(host).send(&request, &[]).await?;
    check(&response)
}
