//! Mount-time handshake.

use crate::error::{FsError, FsResult};
use crate::rpc::{Channel, FsConfig, Request, ResponseBody};

/// Fetch the filesystem configuration from one daemon. Any daemon will
/// do; the settings are identical across the job.
pub async fn forward_get_fs_config(channel: &Channel) -> FsResult<FsConfig> {
    let (response, _) = channel.send(&Request::GetFsConfig, &[]).await?;
    if response.err != 0 {
        return Err(FsError::from_errno(response.err));
    }
    match response.body {
        ResponseBody::FsConfig(config) => Ok(config),
        _ => Err(FsError::TransportFault(
            "unexpected fs config response".into(),
        )),
    }
}
