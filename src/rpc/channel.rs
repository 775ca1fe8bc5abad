use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config;
use crate::error::{FsError, FsResult};
use crate::rpc::codec::{self, FramedStream};
use crate::rpc::message::{Request, Response};

/// Client-side channel to one daemon.
///
/// Connections are pooled; each request takes a connection exclusively for
/// one send/receive exchange and returns it afterwards, so concurrent
/// requests to the same daemon simply run on parallel connections. Every
/// attempt is time-bounded and transport failures are retried a fixed
/// number of times before surfacing as a transport fault.
pub struct Channel {
    addr: String,
    pool: Mutex<Vec<FramedStream>>,
}

impl Channel {
    pub fn new(addr: &str) -> Self {
        Channel {
            addr: addr.to_string(),
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and await its response.
    pub async fn send(&self, request: &Request, bulk: &[u8]) -> FsResult<(Response, Bytes)> {
        let mut last_err = String::new();
        for attempt in 0..config::rpc::RPC_TRIES {
            if attempt > 0 {
                log::debug!("retrying rpc to {} (attempt {})", self.addr, attempt + 1);
            }
            match tokio::time::timeout(config::rpc::RPC_TIMEOUT, self.exchange(request, bulk))
                .await
            {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(err)) => last_err = err.to_string(),
                Err(_) => last_err = format!("rpc to {} timed out", self.addr),
            }
        }
        Err(FsError::TransportFault(last_err))
    }

    async fn exchange(&self, request: &Request, bulk: &[u8]) -> FsResult<(Response, Bytes)> {
        let mut conn = self.checkout().await?;

        let frame = codec::encode_frame(request, bulk)?;
        let result = async {
            conn.send(frame).await.map_err(FsError::from)?;
            match conn.next().await {
                Some(Ok(frame)) => codec::decode_frame::<Response>(frame),
                Some(Err(err)) => Err(err.into()),
                None => Err(FsError::TransportFault(format!(
                    "connection to {} closed",
                    self.addr
                ))),
            }
        }
        .await;

        if result.is_ok() {
            self.pool.lock().await.push(conn);
        }
        result
    }

    async fn checkout(&self) -> FsResult<FramedStream> {
        if let Some(conn) = self.pool.lock().await.pop() {
            return Ok(conn);
        }
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|err| FsError::TransportFault(format!("connect {}: {}", self.addr, err)))?;
        stream.set_nodelay(true).ok();
        Ok(codec::framed(stream))
    }
}
