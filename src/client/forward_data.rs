//! Data forwarders: chunk-range fan-out for reads, writes, truncation
//! and capacity queries.
//!
//! A data operation covers a contiguous chunk range. The range is
//! partitioned by owning daemon, each daemon gets one RPC carrying (for
//! writes) exactly the bytes of its chunks packed in ascending chunk-id
//! order, all RPCs run in parallel, and the results are aggregated:
//! transferred bytes add up, and the reported error is the first one in
//! chunk-id order.

use std::collections::HashMap;

use bytes::BytesMut;
use futures::future;

use crate::chunk_calc::{chunk_count_for_offset, chunk_id_for_offset, chunk_lpad};
use crate::client::ClientContext;
use crate::distributor::HostId;
use crate::error::{FsError, FsResult};
use crate::rpc::{ChunkStat, Request, ResponseBody};

/// One chunk's slice of the operation, positioned in the caller's buffer.
struct Span {
    host: HostId,
    buf_offset: usize,
    len: usize,
}

/// Per-daemon share of the operation, in first-chunk order.
struct Target {
    host: HostId,
    total: u64,
    bulk: BytesMut,
}

fn partition(ctx: &ClientContext, path: &str, offset: u64, count: u64) -> Vec<Span> {
    let chunk_size = ctx.chunk_size();
    let chunk_start = chunk_id_for_offset(offset, chunk_size);
    let chunk_end = chunk_id_for_offset(offset + count - 1, chunk_size);

    let mut spans = Vec::with_capacity(chunk_count_for_offset(offset, count, chunk_size) as usize);
    let mut buf_offset = 0u64;
    for chunk_id in chunk_start..=chunk_end {
        let len = if chunk_id == chunk_start {
            std::cmp::min(chunk_size - chunk_lpad(offset, chunk_size), count)
        } else if chunk_id == chunk_end {
            offset + count - chunk_id * chunk_size
        } else {
            chunk_size
        };
        spans.push(Span {
            host: ctx.distributor().locate_data(path, chunk_id),
            buf_offset: buf_offset as usize,
            len: len as usize,
        });
        buf_offset += len;
    }
    spans
}

/// Group spans by daemon. Spans arrive in ascending chunk order, so the
/// group order is each daemon's first owned chunk - the order partial
/// failures are reported in.
fn group(spans: &[Span], write_buf: Option<&[u8]>) -> Vec<Target> {
    let mut targets: Vec<Target> = Vec::new();
    let mut index: HashMap<HostId, usize> = HashMap::new();
    for span in spans {
        let idx = *index.entry(span.host).or_insert_with(|| {
            targets.push(Target {
                host: span.host,
                total: 0,
                bulk: BytesMut::new(),
            });
            targets.len() - 1
        });
        targets[idx].total += span.len as u64;
        if let Some(buf) = write_buf {
            targets[idx]
                .bulk
                .extend_from_slice(&buf[span.buf_offset..span.buf_offset + span.len]);
        }
    }
    targets
}

/// Write `buf` at `offset`. Returns the bytes that made it to disk and,
/// on partial failure, the first error in chunk-id order.
pub async fn forward_write(
    ctx: &ClientContext,
    path: &str,
    buf: &[u8],
    offset: u64,
) -> (u64, Option<FsError>) {
    let count = buf.len() as u64;
    if count == 0 {
        return (0, None);
    }
    let chunk_size = ctx.chunk_size();
    let chunk_start = chunk_id_for_offset(offset, chunk_size);
    let chunk_end = chunk_id_for_offset(offset + count - 1, chunk_size);

    let spans = partition(ctx, path, offset, count);
    let targets = group(&spans, Some(buf));

    let results = future::join_all(targets.into_iter().map(|target| {
        let request = Request::Write {
            path: path.to_string(),
            offset: chunk_lpad(offset, chunk_size),
            chunk_start,
            chunk_end,
            total_size: target.total,
        };
        async move { ctx.channel(target.host).send(&request, &target.bulk).await }
    }))
    .await;

    let mut written = 0u64;
    let mut first_err = None;
    for result in results {
        match result {
            Ok((response, _)) => {
                if let ResponseBody::Io { io_size } = response.body {
                    written += io_size;
                }
                if response.err != 0 {
                    first_err.get_or_insert(FsError::from_errno(response.err));
                }
            }
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }
    (written, first_err)
}

/// Read `buf.len()` bytes from `offset`, scattering each daemon's payload
/// back into place. Returns bytes read plus the first error in chunk-id
/// order.
pub async fn forward_read(
    ctx: &ClientContext,
    path: &str,
    buf: &mut [u8],
    offset: u64,
) -> (u64, Option<FsError>) {
    let count = buf.len() as u64;
    if count == 0 {
        return (0, None);
    }
    let chunk_size = ctx.chunk_size();
    let chunk_start = chunk_id_for_offset(offset, chunk_size);
    let chunk_end = chunk_id_for_offset(offset + count - 1, chunk_size);

    let spans = partition(ctx, path, offset, count);
    let targets = group(&spans, None);

    let hosts: Vec<HostId> = targets.iter().map(|t| t.host).collect();
    let results = future::join_all(targets.into_iter().map(|target| {
        let request = Request::Read {
            path: path.to_string(),
            offset: chunk_lpad(offset, chunk_size),
            chunk_start,
            chunk_end,
            total_size: target.total,
        };
        async move {
            let expected = target.total;
            let (response, bulk) = ctx.channel(target.host).send(&request, &[]).await?;
            if response.err != 0 {
                return Err(FsError::from_errno(response.err));
            }
            if bulk.len() as u64 != expected {
                return Err(FsError::TransportFault(format!(
                    "read payload {} != expected {}",
                    bulk.len(),
                    expected
                )));
            }
            match response.body {
                ResponseBody::Io { io_size } => Ok((io_size, bulk)),
                _ => Err(FsError::TransportFault("unexpected read response".into())),
            }
        }
    }))
    .await;

    let mut read_total = 0u64;
    let mut first_err = None;
    let mut payloads: HashMap<HostId, bytes::Bytes> = HashMap::new();
    for (host, result) in hosts.into_iter().zip(results) {
        match result {
            Ok((io_size, bulk)) => {
                read_total += io_size;
                payloads.insert(host, bulk);
            }
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }

    let mut cursors: HashMap<HostId, usize> = HashMap::new();
    for span in &spans {
        if let Some(payload) = payloads.get(&span.host) {
            let cursor = cursors.entry(span.host).or_insert(0);
            buf[span.buf_offset..span.buf_offset + span.len]
                .copy_from_slice(&payload[*cursor..*cursor + span.len]);
            *cursor += span.len;
        }
    }

    (read_total, first_err)
}

/// Tell every daemon holding affected chunks to cut the chunk tree down
/// to `new_size`.
pub async fn forward_truncate(
    ctx: &ClientContext,
    path: &str,
    current_size: u64,
    new_size: u64,
) -> FsResult<()> {
    if new_size >= current_size {
        return Err(FsError::InvalidArgument(
            "truncate target not below current size".into(),
        ));
    }
    let chunk_size = ctx.chunk_size();
    let chunk_start = chunk_id_for_offset(new_size, chunk_size);
    let chunk_end = chunk_id_for_offset(current_size - 1, chunk_size);

    let mut involved = Vec::new();
    for chunk_id in chunk_start..=chunk_end {
        let host = ctx.distributor().locate_data(path, chunk_id);
        if !involved.contains(&host) {
            involved.push(host);
            if involved.len() as u64 == ctx.hosts_count() {
                break;
            }
        }
    }

    let request = Request::Truncate {
        path: path.to_string(),
        new_size,
    };
    let results = future::join_all(involved.into_iter().map(|host| {
        let request = request.clone();
        async move { ctx.channel(host).send(&request, &[]).await }
    }))
    .await;

    for result in results {
        let (response, _) = result?;
        if response.err != 0 {
            return Err(FsError::from_errno(response.err));
        }
    }
    Ok(())
}

/// Aggregate chunk capacity across all daemons.
pub async fn forward_get_chunk_stat(ctx: &ClientContext) -> FsResult<ChunkStat> {
    let results = future::join_all(
        (0..ctx.hosts_count())
            .map(|host| async move { ctx.channel(host).send(&Request::ChunkStat, &[]).await }),
    )
    .await;

    let mut aggregate = ChunkStat {
        chunk_size: ctx.chunk_size(),
        chunk_total: 0,
        chunk_free: 0,
    };
    for result in results {
        let (response, _) = result?;
        if response.err != 0 {
            return Err(FsError::from_errno(response.err));
        }
        match response.body {
            ResponseBody::ChunkStat(stat) => {
                aggregate.chunk_total += stat.chunk_total;
                aggregate.chunk_free += stat.chunk_free;
            }
            _ => {
                return Err(FsError::TransportFault(
                    "unexpected chunk stat response".into(),
                ))
            }
        }
    }
    Ok(aggregate)
}
