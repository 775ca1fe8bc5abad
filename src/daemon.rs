//! The daemon half: storage engines, request handlers and the serving
//! loop.
//!
//! All daemon state lives in one [`DaemonContext`] constructed at startup
//! and passed explicitly to every handler; it is dropped at shutdown after
//! the serving tasks have drained.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config;
use crate::distributor::Distributor;
use crate::error::FsResult;
use crate::metadata::Metadata;

mod merge;
pub use merge::*;

mod metadata_db;
pub use metadata_db::*;

mod chunk_storage;
pub use chunk_storage::*;

pub mod metadentry;

mod io_pool;
pub use io_pool::*;

pub mod handlers;

mod server;
pub use server::*;

/// Startup settings of one daemon.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// Root of this daemon's on-disk state; metadata DB and chunk tree
    /// live underneath unless overridden.
    pub rootdir: PathBuf,
    /// Optional separate location of the metadata DB.
    pub metadir: Option<PathBuf>,
    /// Mount prefix advertised to clients.
    pub mountdir: String,
    pub chunk_size: u64,
}

impl DaemonSettings {
    fn metadir(&self) -> PathBuf {
        self.metadir
            .clone()
            .unwrap_or_else(|| self.rootdir.join("metadata"))
    }

    fn datadir(&self) -> PathBuf {
        self.rootdir.join("data")
    }
}

/// Process-scoped daemon state.
pub struct DaemonContext {
    settings: DaemonSettings,
    mdb: MetadataDb,
    storage: ChunkStorage,
    io_pool: IoPool,
    distributor: Distributor,
}

impl DaemonContext {
    /// Build the context: open the KV engine and the chunk tree, start
    /// the I/O pool and bootstrap the root record.
    pub fn init(settings: DaemonSettings, distributor: Distributor) -> FsResult<Arc<Self>> {
        let mdb = MetadataDb::open(settings.metadir())?;
        let storage = ChunkStorage::new(settings.datadir(), settings.chunk_size)?;
        let io_pool = IoPool::new(config::rpc::DAEMON_IO_STREAMS)?;

        let ctx = DaemonContext {
            settings,
            mdb,
            storage,
            io_pool,
            distributor,
        };

        // every daemon holds the root record so listings of "/" work from
        // any node
        let root = Metadata::new(libc::S_IFDIR | 0o777);
        ctx.mdb.create("/", &root.serialize())?;

        Ok(Arc::new(ctx))
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    pub fn mdb(&self) -> &MetadataDb {
        &self.mdb
    }

    pub fn storage(&self) -> &ChunkStorage {
        &self.storage
    }

    pub fn io_pool(&self) -> &IoPool {
        &self.io_pool
    }

    pub fn distributor(&self) -> &Distributor {
        &self.distributor
    }

    /// Flush persistent state; called on clean shutdown.
    pub fn shutdown(&self) -> FsResult<()> {
        self.mdb.flush()
    }
}
