//! The daemon's serving loop.

use std::sync::Arc;

use anyhow::Error;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};

use crate::daemon::{handlers, DaemonContext};
use crate::error::FsError;
use crate::rpc::{self, Request, Response};

/// Accept connections on `listener` and serve them until the task is
/// dropped or the listener fails.
pub async fn serve(listener: TcpListener, ctx: Arc<DaemonContext>) -> Result<(), Error> {
    log::info!("serving on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        log::debug!("connection from {}", peer);
        stream.set_nodelay(true).ok();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(ctx, stream).await {
                log::debug!("connection from {} ended: {}", peer, err);
            }
        });
    }
}

/// One request/response exchange at a time per connection; clients that
/// want parallelism open parallel connections.
async fn handle_connection(ctx: Arc<DaemonContext>, stream: TcpStream) -> Result<(), Error> {
    let mut framed = rpc::framed(stream);

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let (response, bulk) = match rpc::decode_frame::<Request>(frame) {
            Ok((request, bulk)) => handlers::handle_request(&ctx, request, bulk).await,
            Err(err) => {
                // unparsable header: answer with a status so the client
                // does not hang, then keep the connection
                log::warn!("dropping malformed request: {}", err);
                (
                    Response::error(&FsError::InvalidArgument("malformed request".into())),
                    bytes::Bytes::new(),
                )
            }
        };
        framed.send(rpc::encode_frame(&response, &bulk)?).await?;
    }
    Ok(())
}
