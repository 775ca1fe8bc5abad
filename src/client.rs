//! The client half: per-operation fan-out over the daemons and the
//! POSIX-like operation layer on top.
//!
//! A [`ClientContext`] is built once per process from the hosts file: it
//! performs the mount handshake against one daemon, checks that both
//! sides agree on the metadata field layout, and is immutable afterwards
//! except for the open-file table.

use std::path::Path;

use crate::config;
use crate::distributor::{Distributor, HostId};
use crate::error::{FsError, FsResult};
use crate::hosts::{self, Host};
use crate::rpc::{Channel, FsConfig};

pub mod open_file;
pub use open_file::*;

mod open_file_map;
pub use open_file_map::*;

pub mod forward_data;
pub mod forward_management;
pub mod forward_metadata;

pub mod file_ops;

pub struct ClientContext {
    hosts: Vec<Host>,
    channels: Vec<Channel>,
    distributor: Distributor,
    fs_config: FsConfig,
    ofm: OpenFileMap,
}

impl ClientContext {
    /// Connect with the default hash placement over all hosts.
    pub async fn new(hosts: Vec<Host>) -> FsResult<Self> {
        if hosts.is_empty() {
            return Err(FsError::InvalidArgument("empty host list".into()));
        }
        let distributor = Distributor::hash(0, hosts.len() as u64);
        Self::with_distributor(hosts, distributor).await
    }

    /// Connect with an explicit placement policy (local-only development
    /// mode, or forwarding to a dedicated I/O node).
    pub async fn with_distributor(hosts: Vec<Host>, distributor: Distributor) -> FsResult<Self> {
        if hosts.is_empty() {
            return Err(FsError::InvalidArgument("empty host list".into()));
        }
        let channels: Vec<Channel> = hosts.iter().map(|h| Channel::new(&h.addr)).collect();

        let fs_config = forward_management::forward_get_fs_config(&channels[0]).await?;
        if !fs_config.chunk_size.is_power_of_two() {
            return Err(FsError::InvalidArgument(format!(
                "daemon advertises non power-of-two chunk size {}",
                fs_config.chunk_size
            )));
        }
        // both sides must serialize records identically
        if fs_config.atime_state != config::metadata::USE_ATIME
            || fs_config.mtime_state != config::metadata::USE_MTIME
            || fs_config.ctime_state != config::metadata::USE_CTIME
            || fs_config.link_cnt_state != config::metadata::USE_LINK_CNT
            || fs_config.blocks_state != config::metadata::USE_BLOCKS
        {
            return Err(FsError::InvalidArgument(
                "daemon tracks a different metadata field set than this client".into(),
            ));
        }

        Ok(ClientContext {
            hosts,
            channels,
            distributor,
            fs_config,
            ofm: OpenFileMap::new(),
        })
    }

    /// Read the hosts file (path from the client environment when not
    /// given) and connect.
    pub async fn from_hosts_file<P: AsRef<Path>>(path: Option<P>) -> FsResult<Self> {
        let hosts = match path {
            Some(path) => hosts::parse_hosts_file(path)?,
            None => {
                let path = config::env_var(config::CLIENT_ENV_PREFIX, "HOSTS_FILE")
                    .unwrap_or_else(|| config::DEFAULT_HOSTS_FILE.to_string());
                hosts::parse_hosts_file(path)?
            }
        };
        Self::new(hosts).await
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn hosts_count(&self) -> u64 {
        self.hosts.len() as u64
    }

    pub fn channel(&self, host: HostId) -> &Channel {
        &self.channels[host as usize]
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    pub fn fs_config(&self) -> &FsConfig {
        &self.fs_config
    }

    pub fn chunk_size(&self) -> u64 {
        self.fs_config.chunk_size
    }

    pub fn ofm(&self) -> &OpenFileMap {
        &self.ofm
    }
}
